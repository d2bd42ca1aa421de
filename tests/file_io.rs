//! End-to-end host I/O through `FileHandle`.
//!
//! All tests use `CompatMode::On` so they run without a GPU.


use std::io::{SeekFrom, Write};

use cufile_rs::{CompatMode, ErrorKind, FileHandle, OpenMode, Session};

use test_utils::{assert_data_eq, compat_session, fd_is_open, gen_data, open_fd_count, serial};

#[test]
fn test_open_on_uninitialized_session() {
    let _serial = serial();
    let session = Session::with_compat_mode(CompatMode::On);
    let err = FileHandle::open(&session, "f.bin", "r").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionClosed);
}

#[test]
fn test_open_missing_file() {
    let _serial = serial();
    let session = compat_session();
    let dir = tempfile::tempdir().unwrap();
    let err = session.open(dir.path().join("missing.bin"), "r").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.errno(), Some(libc::ENOENT));
}

#[test]
fn test_write_then_reopen_and_read_1024() {
    let _serial = serial();
    let session = compat_session();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.bin");
    let data = gen_data(1024);

    let mut out = session.open(&path, "w").unwrap();
    assert_eq!(out.mode(), OpenMode::Write);
    assert_eq!(out.write_host(&data, Some(0)).unwrap(), 1024);
    out.close().unwrap();

    let mut inp = session.open(&path, "r").unwrap();
    assert_eq!(inp.nbytes().unwrap(), 1024);
    let mut buf = vec![0u8; 1024];
    assert_eq!(inp.read_host(&mut buf, Some(0)).unwrap(), 1024);
    assert_data_eq(&data, &buf);
}

/// Unaligned size, large enough for the kernel to split transfers.
#[test]
fn test_round_trip_large_unaligned() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let size = 8 * 1024 * 1024 + 124;
    let data = gen_data(size);

    let mut file = session.open(tmp.path(), "w+").unwrap();
    assert_eq!(file.write_host(&data, Some(0)).unwrap(), size);
    let mut buf = vec![0u8; size];
    assert_eq!(file.read_host(&mut buf, Some(0)).unwrap(), size);
    assert_data_eq(&data, &buf);
}

#[test]
fn test_read_subrange_at_offset() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let data = gen_data(10_000);

    let mut file = session.open(tmp.path(), "rw").unwrap();
    file.write_host(&data, Some(0)).unwrap();

    let mut buf = vec![0u8; 1000];
    assert_eq!(file.read_host(&mut buf, Some(5000)).unwrap(), 1000);
    assert_data_eq(&data[5000..6000], &buf);
}

#[test]
fn test_short_read_at_eof() {
    let _serial = serial();
    let session = compat_session();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&gen_data(3000)).unwrap();
    tmp.flush().unwrap();

    let mut file = session.open(tmp.path(), "r").unwrap();
    let mut buf = vec![0u8; 4096];
    assert_eq!(file.read_host(&mut buf, Some(0)).unwrap(), 3000);
    assert_eq!(file.read_host(&mut buf, Some(2999)).unwrap(), 1);
    assert_eq!(file.read_host(&mut buf, Some(3000)).unwrap(), 0);
}

#[test]
fn test_sequential_position() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let data = gen_data(300);

    let mut file = session.open(tmp.path(), "w+").unwrap();
    for chunk in data.chunks(100) {
        file.write_host(chunk, None).unwrap();
    }
    assert_eq!(file.position(), 300);

    let mut buf = vec![0u8; 300];
    assert_eq!(file.read_host(&mut buf, Some(0)).unwrap(), 300);
    assert_eq!(file.position(), 300);
    assert_data_eq(&data, &buf);
}

#[test]
fn test_append_mode() {
    let _serial = serial();
    let session = compat_session();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"head-").unwrap();
    tmp.flush().unwrap();

    let mut file = session.open(tmp.path(), "a").unwrap();
    file.write_host(b"tail", None).unwrap();
    file.close().unwrap();

    assert_eq!(std::fs::read(tmp.path()).unwrap(), b"head-tail");
}

#[test]
fn test_append_rejects_explicit_offset() {
    let _serial = serial();
    let session = compat_session();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"head-").unwrap();
    tmp.flush().unwrap();

    for mode in ["a", "a+"] {
        let mut file = session.open(tmp.path(), mode).unwrap();
        let err = file.write_host(b"XX", Some(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{mode}");
        assert_eq!(file.position(), 0, "{mode}");
    }
    assert_eq!(std::fs::read(tmp.path()).unwrap(), b"head-");
}

#[test]
fn test_append_position_tracks_end_of_file() {
    let _serial = serial();
    let session = compat_session();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"head-").unwrap();
    tmp.flush().unwrap();

    let mut file = session.open(tmp.path(), "a+").unwrap();
    assert_eq!(file.write_host(b"tail", None).unwrap(), 4);
    assert_eq!(file.position(), 9);
    assert_eq!(file.nbytes().unwrap(), 9);

    assert_eq!(file.write_host(b"!!", None).unwrap(), 2);
    assert_eq!(file.position(), 11);

    // Reads on a+ still honour offsets and the position.
    let mut buf = [0u8; 4];
    assert_eq!(file.read_host(&mut buf, Some(5)).unwrap(), 4);
    assert_eq!(&buf, b"tail");
    assert_eq!(file.read_host(&mut buf, None).unwrap(), 0);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut all = vec![0u8; 11];
    assert_eq!(file.read_host(&mut all, None).unwrap(), 11);
    assert_eq!(all, b"head-tail!!");
}

#[test]
fn test_truncating_modes() {
    let _serial = serial();
    let session = compat_session();
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&[1u8; 500]).unwrap();
    tmp.flush().unwrap();

    let file = session.open(tmp.path(), "r+").unwrap();
    assert_eq!(file.nbytes().unwrap(), 500);
    drop(file);

    let file = session.open(tmp.path(), "w+").unwrap();
    assert_eq!(file.nbytes().unwrap(), 0);
}

#[test]
fn test_mode_violations() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();

    let mut reader = session.open(tmp.path(), "r").unwrap();
    let err = reader.write_host(&[1, 2, 3], Some(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);

    let mut writer = session.open(tmp.path(), "a").unwrap();
    let mut buf = [0u8; 3];
    let err = writer.read_host(&mut buf, Some(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
}

#[test]
fn test_closed_handle_and_double_close() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();

    let mut file = session.open(tmp.path(), "rw").unwrap();
    file.close().unwrap();
    file.close().unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(file.read_host(&mut buf, Some(0)).unwrap_err().kind(), ErrorKind::InvalidMode);
    assert_eq!(file.write_host(&buf, None).unwrap_err().kind(), ErrorKind::InvalidMode);
    let err = unsafe { file.read(buf.as_mut_ptr().cast(), buf.len(), None) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
}

#[test]
fn test_open_close_leaks_no_descriptor() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();

    let before = open_fd_count();
    for mode in ["r", "w", "rw", "r+", "w+", "a", "a+"] {
        for _ in 0..8 {
            let mut file = session.open(tmp.path(), mode).unwrap();
            file.close().unwrap();
        }
        for _ in 0..8 {
            let _file = session.open(tmp.path(), mode).unwrap();
        }
        assert_eq!(open_fd_count(), before, "{mode}");
    }
    assert_eq!(session.open_files(), 0);
}

#[test]
fn test_failed_opens_leak_no_descriptor() {
    let _serial = serial();
    let session = compat_session();
    let dir = tempfile::tempdir().unwrap();

    let before = open_fd_count();
    for _ in 0..8 {
        session.open(dir.path().join("missing.bin"), "r").unwrap_err();
        session.open(dir.path(), "w").unwrap_err();
        session.open(dir.path().join("x.bin"), "bogus").unwrap_err();
    }
    assert_eq!(open_fd_count(), before);
}

#[test]
fn test_close_runs_when_scope_panics() {
    let _serial = serial();
    let session = compat_session();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();

    let mut fd = -1;
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let file = session.open(&path, "r").unwrap();
        fd = file.fd();
        panic!("boom");
    }));
    assert!(result.is_err());
    assert!(fd >= 0);
    assert!(!fd_is_open(fd));
    assert_eq!(session.open_files(), 0);
}

#[test]
fn test_handles_on_separate_threads() {
    let _serial = serial();
    let session = compat_session();
    let dir = tempfile::tempdir().unwrap();

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let session = &session;
            let path = dir.path().join(format!("t{t}.bin"));
            s.spawn(move || {
                let data = vec![t; 64 * 1024];
                let mut file = session.open(&path, "w+").unwrap();
                file.write_host(&data, Some(0)).unwrap();
                let mut back = vec![0u8; data.len()];
                file.read_host(&mut back, Some(0)).unwrap();
                assert_eq!(back, data);
            });
        }
    });
    assert_eq!(session.open_files(), 0);
}
