//! Configuration environment variable tests.


use cufile_rs::{CompatMode, Config, ErrorKind, OpenOptions, Session};

use test_utils::{EnvVarGuard, serial};

const ALL_VARS: [&str; 4] = [
    "CUFILE_RS_COMPAT_MODE",
    "CUFILE_RS_DIRECT_IO",
    "CUFILE_RS_FILE_PERMISSIONS",
    "CUFILE_RS_BUF_REGISTER_FLAGS",
];

#[test]
fn test_env_unset_gives_defaults() {
    let _serial = serial();
    let _guard = EnvVarGuard::remove(&ALL_VARS);
    assert_eq!(Config::from_env().unwrap(), Config::default());
}

#[test]
fn test_env_compat_mode() {
    let _serial = serial();
    for (val, expected) in [("ON", CompatMode::On), ("off", CompatMode::Off), ("Auto", CompatMode::Auto)] {
        let _guard = EnvVarGuard::new(&[("CUFILE_RS_COMPAT_MODE", val)]);
        assert_eq!(Config::from_env().unwrap().compat_mode, expected, "{val:?}");
    }
}

#[test]
fn test_env_direct_io() {
    let _serial = serial();
    let _guard = EnvVarGuard::new(&[("CUFILE_RS_DIRECT_IO", "yes")]);
    assert!(Config::from_env().unwrap().direct_io);
}

#[test]
fn test_env_file_permissions() {
    let _serial = serial();
    let _guard = EnvVarGuard::new(&[("CUFILE_RS_FILE_PERMISSIONS", "0600")]);
    assert_eq!(Config::from_env().unwrap().file_permissions, 0o600);
}

#[test]
fn test_env_buf_register_flags() {
    let _serial = serial();
    let _guard = EnvVarGuard::new(&[("CUFILE_RS_BUF_REGISTER_FLAGS", " 1 ")]);
    assert_eq!(Config::from_env().unwrap().buf_register_flags, 1);
}

#[test]
fn test_env_empty_value_is_unset() {
    let _serial = serial();
    let _guard = EnvVarGuard::new(&[("CUFILE_RS_COMPAT_MODE", "  ")]);
    assert_eq!(Config::from_env().unwrap().compat_mode, CompatMode::Auto);
}

#[test]
fn test_env_invalid_values() {
    let _serial = serial();
    for (var, val) in [
        ("CUFILE_RS_COMPAT_MODE", "sometimes"),
        ("CUFILE_RS_DIRECT_IO", "maybe"),
        ("CUFILE_RS_FILE_PERMISSIONS", "rw-r--r--"),
        ("CUFILE_RS_FILE_PERMISSIONS", "77777"),
        ("CUFILE_RS_BUF_REGISTER_FLAGS", "many"),
    ] {
        let _guard = EnvVarGuard::new(&[(var, val)]);
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{var}={val:?}");
        assert_eq!(err.operation(), "Config::from_env");
    }
}

#[test]
fn test_global_config_feeds_new_objects() {
    let _serial = serial();
    let before = Config::get();

    Config::update(|c| {
        c.compat_mode = CompatMode::On;
        c.file_permissions = 0o640;
        c.direct_io = true;
    });
    let session = Session::new();
    assert_eq!(session.requested_compat_mode(), CompatMode::On);
    let options = OpenOptions::default();
    assert_eq!(options.permissions, 0o640);
    assert!(options.direct_io);

    Config::set(before.clone());
    assert_eq!(Config::get(), before);
}
