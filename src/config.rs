//! Runtime-configurable defaults for cufile-rs.
//!
//! Configuration is read from environment variables on first access and can
//! be modified at runtime through a global singleton.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default | Description |
//! |----------|------|---------|-------------|
//! | `CUFILE_RS_COMPAT_MODE` | `CompatMode` | `Auto` | Backend selection for new sessions |
//! | `CUFILE_RS_DIRECT_IO` | `bool` | `false` | Open files with `O_DIRECT` on the cuFile backend |
//! | `CUFILE_RS_FILE_PERMISSIONS` | octal | `644` | Permissions for files created by `open` |
//! | `CUFILE_RS_BUF_REGISTER_FLAGS` | `i32` | `0` | Flags passed to `cuFileBufRegister` |

use std::sync::{OnceLock, RwLock};

use crate::compat_mode::CompatMode;
use crate::error::{Error, ErrorKind, Result};

/// Default permissions for files created through `open`.
const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

/// Runtime configuration for cufile-rs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Backend selection used by [`Session::new`](crate::Session::new).
    pub compat_mode: CompatMode,
    /// Whether files are opened with `O_DIRECT` when the cuFile backend is active.
    pub direct_io: bool,
    /// Permission bits for files created by `"w"`, `"w+"`, `"a"` and `"a+"`.
    pub file_permissions: u32,
    /// Flags forwarded to `cuFileBufRegister`.
    pub buf_register_flags: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compat_mode: CompatMode::Auto,
            direct_io: false,
            file_permissions: DEFAULT_FILE_PERMISSIONS,
            buf_register_flags: 0,
        }
    }
}

static GLOBAL_CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

impl Config {
    /// Create a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(val) = env_var("CUFILE_RS_COMPAT_MODE")? {
            config.compat_mode =
                CompatMode::parse(&val).map_err(|e| e.with_operation("Config::from_env"))?;
        }
        if let Some(val) = env_var("CUFILE_RS_DIRECT_IO")? {
            config.direct_io = parse_bool(&val, "CUFILE_RS_DIRECT_IO")?;
        }
        if let Some(val) = env_var("CUFILE_RS_FILE_PERMISSIONS")? {
            config.file_permissions = parse_octal(&val, "CUFILE_RS_FILE_PERMISSIONS")?;
        }
        if let Some(val) = env_var("CUFILE_RS_BUF_REGISTER_FLAGS")? {
            config.buf_register_flags = val.trim().parse::<i32>().map_err(|e| {
                invalid("CUFILE_RS_BUF_REGISTER_FLAGS", &val).set_source(e)
            })?;
        }

        Ok(config)
    }

    /// Get a snapshot of the global configuration.
    ///
    /// The first call reads the environment; an invalid environment is
    /// logged and replaced by the defaults.
    pub fn get() -> Config {
        let lock = global();
        match lock.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the global configuration.
    pub fn set(config: Config) {
        Config::update(|c| *c = config);
    }

    /// Modify the global configuration in place.
    pub fn update(f: impl FnOnce(&mut Config)) {
        let lock = global();
        let mut guard = match lock.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

fn global() -> &'static RwLock<Config> {
    GLOBAL_CONFIG.get_or_init(|| {
        let config = Config::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring invalid cufile-rs environment configuration");
            Config::default()
        });
        RwLock::new(config)
    })
}

/// Read an environment variable, returning `None` if it is unset or empty.
fn env_var(name: &'static str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(val) if val.trim().is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("environment variable {name} contains invalid Unicode"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", name)),
    }
}

fn invalid(var_name: &'static str, val: &str) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        format!("invalid value for {var_name}: {val:?}"),
    )
    .with_operation("Config::from_env")
    .with_context("env_var", var_name)
}

fn parse_bool(val: &str, var_name: &'static str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(invalid(var_name, val)),
    }
}

/// Accepts `644`, `0644` and `0o644`.
fn parse_octal(val: &str, var_name: &'static str) -> Result<u32> {
    let trimmed = val.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    let mode =
        u32::from_str_radix(digits, 8).map_err(|e| invalid(var_name, val).set_source(e))?;
    if mode > 0o7777 {
        return Err(invalid(var_name, val));
    }
    Ok(mode)
}
