//! The cuFile backend, built on `cudarc::cufile`'s result-level API.
//!
//! cudarc loads `libcufile.so` lazily and panics if it cannot be found.
//! [`CufileDriver::open`] probes for the library first and reports a missing
//! one as [`ErrorKind::DriverUnavailable`]. Any remaining load panic is
//! contained and reported the same way, though the panic hook still prints
//! its message to stderr.
//!
//! cudarc decodes failed calls into [`CufileError`]: `IO` carries the OS
//! error behind a `-1` return, `Cufile` a `CUfileOpError`. The errno or the
//! `CUfileOpError` number is attached to the resulting [`Error`].

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::addr_of_mut;

use cudarc::cufile::result::{self, CufileError};
use cudarc::cufile::sys;

use crate::driver::{Driver, DriverKind, NativeHandle};
use crate::error::{is_temporary_errno, Error, ErrorKind, Result};

/// A live cuFile driver (`cuFileDriverOpen` succeeded).
#[derive(Debug)]
pub(crate) struct CufileDriver {
    _private: (),
}

impl CufileDriver {
    /// Open the cuFile driver.
    pub(crate) fn open() -> Result<Self> {
        // SAFETY: only tries to dlopen the candidate library names.
        if !unsafe { sys::is_culib_present() } {
            return Err(Error::new(ErrorKind::DriverUnavailable, "libcufile not found")
                .with_operation("CufileDriver::open"));
        }
        let opened = panic::catch_unwind(AssertUnwindSafe(result::driver_open));
        match opened {
            Ok(Ok(())) => {
                tracing::debug!("cuFileDriverOpen succeeded");
                Ok(Self { _private: () })
            }
            Ok(Err(e)) => Err(native_error(e, ErrorKind::DriverUnavailable, "cuFileDriverOpen")
                .with_operation("CufileDriver::open")),
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| payload.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown reason");
                Err(Error::new(
                    ErrorKind::DriverUnavailable,
                    format!("libcufile could not be loaded: {reason}"),
                )
                .with_operation("CufileDriver::open"))
            }
        }
    }
}

/// Translate a cudarc cuFile error into `kind`, keeping the errno or the
/// native status number.
fn native_error(e: CufileError, kind: ErrorKind, call: &'static str) -> Error {
    let err = match e {
        CufileError::IO(io) => {
            let errno = io.raw_os_error().unwrap_or(libc::EIO);
            let err = Error::new(kind, format!("{call} failed: {io}"))
                .with_errno(errno)
                .set_source(io);
            if is_temporary_errno(errno) { err.set_temporary() } else { err }
        }
        CufileError::Cufile(op) => {
            Error::new(kind, format!("{call} failed: {op:?}")).with_native_status(op as i64)
        }
    };
    err.with_operation(call)
}

fn transfer_result(ret: std::result::Result<isize, CufileError>, call: &'static str) -> Result<usize> {
    let n = ret.map_err(|e| native_error(e, ErrorKind::TransferFailed, call))?;
    usize::try_from(n).map_err(|_| {
        Error::new(ErrorKind::TransferFailed, format!("{call} returned {n}"))
            .with_operation(call)
            .with_native_status(n as i64)
    })
}

impl Driver for CufileDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Cufile
    }

    fn close(&self) -> Result<()> {
        result::driver_close().map_err(|e| {
            native_error(e, ErrorKind::DriverUnavailable, "cuFileDriverClose")
                .with_operation("CufileDriver::close")
        })
    }

    fn handle_register(&self, fd: RawFd) -> Result<NativeHandle> {
        // Zero first so the union and fs_ops are initialized, then store a
        // valid enum discriminant before assume_init.
        let mut descr = MaybeUninit::<sys::CUfileDescr_t>::zeroed();
        let p = descr.as_mut_ptr();
        // SAFETY: p points to zeroed memory of the right size; every field
        // read later has been initialized.
        let descr = unsafe {
            addr_of_mut!((*p).type_)
                .write(sys::CUfileFileHandleType::CU_FILE_HANDLE_TYPE_OPAQUE_FD);
            addr_of_mut!((*p).handle.fd).write(fd);
            descr.assume_init()
        };

        // descr describes an open descriptor owned by the caller.
        let handle = result::handle_register(&descr).map_err(|e| {
            native_error(e, ErrorKind::RegistrationFailed, "cuFileHandleRegister")
                .with_operation("CufileDriver::handle_register")
            .with_context("fd", fd.to_string())
        })?;
        Ok(NativeHandle::from_raw(handle))
    }

    fn handle_deregister(&self, handle: NativeHandle) -> Result<()> {
        // SAFETY: handle came from handle_register and is released once.
        unsafe { result::handle_deregister(handle.as_raw()) }.map_err(|e| {
            native_error(e, ErrorKind::RegistrationFailed, "cuFileHandleDeregister")
                .with_operation("CufileDriver::handle_deregister")
        })
    }

    unsafe fn buf_register(&self, base: *const c_void, len: usize, flags: i32) -> Result<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { result::buf_register(base, len, flags) }.map_err(|e| {
            native_error(e, ErrorKind::RegistrationFailed, "cuFileBufRegister")
                .with_operation("CufileDriver::buf_register")
            .with_context("address", format!("{base:p}"))
            .with_context("length", len.to_string())
        })
    }

    unsafe fn buf_deregister(&self, base: *const c_void) -> Result<()> {
        // SAFETY: guaranteed by the caller.
        unsafe { result::buf_deregister(base) }.map_err(|e| {
            native_error(e, ErrorKind::RegistrationFailed, "cuFileBufDeregister")
                .with_operation("CufileDriver::buf_deregister")
            .with_context("address", format!("{base:p}"))
        })
    }

    unsafe fn read(
        &self,
        handle: NativeHandle,
        _fd: RawFd,
        base: *mut c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        let ret = unsafe { result::read(handle.as_raw(), base, size, file_offset, buf_offset) };
        transfer_result(ret, "cuFileRead")
    }

    unsafe fn write(
        &self,
        handle: NativeHandle,
        _fd: RawFd,
        base: *const c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        let ret = unsafe { result::write(handle.as_raw(), base.cast_mut(), size, file_offset, buf_offset) };
        transfer_result(ret, "cuFileWrite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_result_success() {
        assert_eq!(transfer_result(Ok(4096), "cuFileRead").unwrap(), 4096);
        assert_eq!(transfer_result(Ok(0), "cuFileRead").unwrap(), 0);
    }

    #[test]
    fn test_transfer_result_cufile_status() {
        let op = sys::CUfileOpError::CU_FILE_DRIVER_NOT_INITIALIZED;
        let err = transfer_result(Err(CufileError::Cufile(op)), "cuFileWrite").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert_eq!(err.native_status(), Some(5001));
        assert!(err.errno().is_none());
        assert!(err.is_permanent());
        assert_eq!(err.operation(), "cuFileWrite");
        assert!(err.message().contains("CU_FILE_DRIVER_NOT_INITIALIZED"));
    }

    #[test]
    fn test_transfer_result_system_error() {
        let io = std::io::Error::from_raw_os_error(libc::EIO);
        let err = transfer_result(Err(CufileError::IO(io)), "cuFileRead").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert_eq!(err.errno(), Some(libc::EIO));
        assert!(err.native_status().is_none());
        assert!(err.is_permanent());
    }

    #[test]
    fn test_transfer_result_retryable_errno() {
        for errno in [libc::EAGAIN, libc::EBUSY] {
            let io = std::io::Error::from_raw_os_error(errno);
            let err = transfer_result(Err(CufileError::IO(io)), "cuFileWrite").unwrap_err();
            assert_eq!(err.errno(), Some(errno));
            assert!(err.is_temporary(), "errno {errno}");
        }
    }

    #[test]
    fn test_registration_error_keeps_native_status() {
        let op = sys::CUfileOpError::CU_FILE_DRIVER_NOT_INITIALIZED;
        let err = native_error(CufileError::Cufile(op), ErrorKind::RegistrationFailed, "cuFileBufRegister")
            .with_operation("CufileDriver::buf_register");
        assert_eq!(err.kind(), ErrorKind::RegistrationFailed);
        assert_eq!(err.native_status(), Some(5001));
        assert_eq!(err.operation(), "CufileDriver::buf_register");
    }

    #[test]
    fn test_open_without_library_is_driver_unavailable() {
        // SAFETY: only tries to dlopen the candidate library names.
        if unsafe { sys::is_culib_present() } {
            eprintln!("SKIP: libcufile is installed");
            return;
        }
        let err = CufileDriver::open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverUnavailable);
        assert_eq!(err.operation(), "CufileDriver::open");
    }

    #[test]
    #[ignore = "requires libcufile: cargo test -- --ignored"]
    fn test_open_and_close_driver() {
        let driver = CufileDriver::open().unwrap();
        assert_eq!(driver.kind(), DriverKind::Cufile);
        driver.close().unwrap();
    }
}
