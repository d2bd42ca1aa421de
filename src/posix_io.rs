//! Thin, errno-checked wrappers over the POSIX file-descriptor API.
//!
//! Every call here checks its return value and converts failures into the
//! crate taxonomy with the errno attached. `EINTR` is retried transparently.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Open `path` with `open(2)`. `O_CLOEXEC` is always added.
///
/// `ENOENT` becomes [`ErrorKind::NotFound`], `EACCES`/`EPERM` become
/// [`ErrorKind::PermissionDenied`], anything else [`ErrorKind::SystemError`].
pub fn posix_open(path: &Path, flags: i32, mode: u32) -> Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("path contains null byte: {}", path.display()),
        )
        .with_operation("posix_open")
    })?;

    loop {
        // SAFETY: c_path is a valid NUL-terminated string.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
        if fd >= 0 {
            return Ok(fd);
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(errno, ErrorKind::SystemError, "open")
            .with_operation("posix_open")
            .with_context("path", path.display().to_string()));
    }
}

/// Close a file descriptor. Negative descriptors are ignored.
///
/// The descriptor is released even when `close(2)` reports an error, so the
/// caller must not retry.
pub fn posix_close(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    // SAFETY: the caller owns fd and never uses it again.
    let ret = unsafe { libc::close(fd) };
    if ret < 0 {
        let errno = last_errno();
        // On Linux the descriptor is gone even after EINTR.
        if errno != libc::EINTR {
            return Err(Error::from_errno(errno, ErrorKind::SystemError, "close")
                .with_operation("posix_close")
                .with_context("fd", fd.to_string()));
        }
    }
    Ok(())
}

/// Size of the file behind `fd`, via `fstat(2)`.
pub fn file_size(fd: RawFd) -> Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: stat points to writable memory of the right size.
    let ret = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if ret < 0 {
        return Err(Error::from_errno(last_errno(), ErrorKind::SystemError, "fstat")
            .with_operation("file_size")
            .with_context("fd", fd.to_string()));
    }
    // SAFETY: fstat succeeded and filled the struct.
    let stat = unsafe { stat.assume_init() };
    Ok(stat.st_size as u64)
}

/// A single `pread(2)`, retried on `EINTR`.
///
/// # Safety
///
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn pread_raw(fd: RawFd, buf: *mut u8, count: usize, offset: i64) -> Result<usize> {
    loop {
        // SAFETY: guaranteed by the caller.
        let ret = unsafe { libc::pread(fd, buf.cast(), count, offset as libc::off_t) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            return Err(transfer_error(errno, "pread", fd, count, offset));
        }
    }
}

/// A single `pwrite(2)`, retried on `EINTR`.
///
/// # Safety
///
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn pwrite_raw(fd: RawFd, buf: *const u8, count: usize, offset: i64) -> Result<usize> {
    loop {
        // SAFETY: guaranteed by the caller.
        let ret = unsafe { libc::pwrite(fd, buf.cast(), count, offset as libc::off_t) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let errno = last_errno();
        if errno != libc::EINTR {
            return Err(transfer_error(errno, "pwrite", fd, count, offset));
        }
    }
}

fn transfer_error(errno: i32, call: &'static str, fd: RawFd, count: usize, offset: i64) -> Error {
    let err = Error::from_errno(errno, ErrorKind::TransferFailed, call).with_operation(call);
    // A transfer never reports NotFound/PermissionDenied: the file is already open.
    let err = if err.kind() == ErrorKind::TransferFailed {
        err
    } else {
        Error::new(ErrorKind::TransferFailed, err.message().to_string())
            .with_operation(call)
            .with_errno(errno)
    };
    err.with_context("fd", fd.to_string())
        .with_context("count", count.to_string())
        .with_context("offset", offset.to_string())
}
