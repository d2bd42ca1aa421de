//! The seam between the lifecycle layer and whatever performs transfers.
//!
//! A [`Driver`] exposes the primitives of the direct-storage library:
//! handle registration, buffer registration and positioned read/write.
//! Two implementations exist: [`CufileDriver`](crate::cufile_driver::CufileDriver)
//! over `cudarc::cufile`, and [`PosixDriver`] which serves compatibility mode
//! with `pread`/`pwrite` on host memory.
//!
//! Drivers perform single calls. Looping over short transfers, validation
//! and bookkeeping all live in [`Session`](crate::Session) and
//! [`FileHandle`](crate::FileHandle).

use std::ffi::c_void;
use std::os::fd::RawFd;

use crate::error::Result;
use crate::posix_io;

/// Which backend a session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// NVIDIA cuFile (GPUDirect Storage).
    Cufile,
    /// POSIX `pread`/`pwrite`.
    Posix,
}

/// Opaque per-file token issued by [`Driver::handle_register`].
///
/// Never handed out to callers; the session keeps it in its file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NativeHandle(*mut c_void);

impl NativeHandle {
    pub(crate) fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    pub(crate) fn as_raw(self) -> *mut c_void {
        self.0
    }

    /// Token used by backends that need no native state.
    pub(crate) fn none() -> Self {
        Self(std::ptr::null_mut())
    }
}

// SAFETY: cuFile handles are plain tokens; the library is thread-safe with
// respect to using a handle from any thread.
unsafe impl Send for NativeHandle {}
// SAFETY: see above. The token is never dereferenced on the Rust side.
unsafe impl Sync for NativeHandle {}

/// Primitives a session backend must provide.
///
/// Every method maps native failures into the crate taxonomy and attaches the
/// raw status. None of them retry.
pub(crate) trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Release the driver. Called once, from `Session::shutdown`.
    fn close(&self) -> Result<()>;

    /// Register an open descriptor for direct transfers.
    fn handle_register(&self, fd: RawFd) -> Result<NativeHandle>;

    /// Release a handle from [`handle_register`](Self::handle_register).
    fn handle_deregister(&self, handle: NativeHandle) -> Result<()>;

    /// Register `len` bytes at `base` for direct transfers.
    ///
    /// # Safety
    ///
    /// `base` must stay valid for `len` bytes until deregistered.
    unsafe fn buf_register(&self, base: *const c_void, len: usize, flags: i32) -> Result<()>;

    /// # Safety
    ///
    /// `base` must have been registered with [`buf_register`](Self::buf_register).
    unsafe fn buf_deregister(&self, base: *const c_void) -> Result<()>;

    /// Read up to `size` bytes at `file_offset` into `base + buf_offset`.
    ///
    /// # Safety
    ///
    /// `base + buf_offset` must be valid for writes of `size` bytes, in memory
    /// this backend can address.
    unsafe fn read(
        &self,
        handle: NativeHandle,
        fd: RawFd,
        base: *mut c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize>;

    /// Write up to `size` bytes from `base + buf_offset` at `file_offset`.
    ///
    /// # Safety
    ///
    /// `base + buf_offset` must be valid for reads of `size` bytes, in memory
    /// this backend can address.
    unsafe fn write(
        &self,
        handle: NativeHandle,
        fd: RawFd,
        base: *const c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize>;
}

/// Compatibility backend: registration is bookkeeping only, transfers are
/// `pread`/`pwrite` on host memory.
#[derive(Debug, Default)]
pub(crate) struct PosixDriver;

impl Driver for PosixDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Posix
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn handle_register(&self, _fd: RawFd) -> Result<NativeHandle> {
        Ok(NativeHandle::none())
    }

    fn handle_deregister(&self, _handle: NativeHandle) -> Result<()> {
        Ok(())
    }

    unsafe fn buf_register(&self, _base: *const c_void, _len: usize, _flags: i32) -> Result<()> {
        Ok(())
    }

    unsafe fn buf_deregister(&self, _base: *const c_void) -> Result<()> {
        Ok(())
    }

    unsafe fn read(
        &self,
        _handle: NativeHandle,
        fd: RawFd,
        base: *mut c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize> {
        // SAFETY: the caller guarantees base + buf_offset is valid for size bytes.
        unsafe {
            let dst = base.cast::<u8>().offset(buf_offset as isize);
            posix_io::pread_raw(fd, dst, size, file_offset)
        }
    }

    unsafe fn write(
        &self,
        _handle: NativeHandle,
        fd: RawFd,
        base: *const c_void,
        size: usize,
        file_offset: i64,
        buf_offset: i64,
    ) -> Result<usize> {
        // SAFETY: the caller guarantees base + buf_offset is valid for size bytes.
        unsafe {
            let src = base.cast::<u8>().offset(buf_offset as isize);
            posix_io::pwrite_raw(fd, src, size, file_offset)
        }
    }
}
