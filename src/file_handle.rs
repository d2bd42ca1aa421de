//! File handles: an OS descriptor paired with its native registration.
//!
//! A [`FileHandle`] is opened through an initialized [`Session`], owns its
//! descriptor, and releases both the registration and the descriptor exactly
//! once: on [`FileHandle::close`] or on drop, whichever comes first.
//!
//! Transfers come in three flavours:
//!
//! - [`read`](FileHandle::read)/[`write`](FileHandle::write) and their `_at`
//!   variants take raw addresses and go through the session's backend. On
//!   the cuFile backend the address is device (or registered) memory; in
//!   compatibility mode it is host memory.
//! - [`read_host`](FileHandle::read_host)/[`write_host`](FileHandle::write_host)
//!   take byte slices and always use `pread`/`pwrite`.
//! - [`read_device`](FileHandle::read_device)/[`write_device`](FileHandle::write_device)
//!   take `cudarc` device slices and pick the right path for the backend.
//!
//! Omitting the file offset uses the handle's position and advances it by the
//! bytes transferred. Short counts at end of file are not errors.

use std::cell::Cell;
use std::ffi::c_void;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cudarc::driver::{CudaSlice, DevicePtr, DevicePtrMut};

use crate::config::Config;
use crate::driver::DriverKind;
use crate::error::{Error, ErrorKind, Result};
use crate::posix_io;
use crate::session::{next_id, Session, Shared};

/// Direction(s) a handle was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// Creation options beyond the mode string.
///
/// Defaults come from the global [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Permission bits for files the mode creates.
    pub permissions: u32,
    /// Open with `O_DIRECT`. Only applied on the cuFile backend.
    pub direct_io: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        let config = Config::get();
        Self {
            permissions: config.file_permissions,
            direct_io: config.direct_io,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissions(mut self, permissions: u32) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Read,
    Write,
}

/// Which primitive performs a transfer.
#[derive(Debug, Clone, Copy)]
enum Route {
    /// The session's backend, with the native handle.
    Driver,
    /// `pread`/`pwrite` on the descriptor.
    Host,
}

/// An open file registered with a [`Session`].
///
/// Transfers take `&mut self`, so one handle is never used by two threads at
/// once. Different handles may be used concurrently.
pub struct FileHandle {
    shared: Arc<Shared>,
    fd: RawFd,
    id: u64,
    epoch: u64,
    mode: OpenMode,
    path: PathBuf,
    position: u64,
    // Opened with O_APPEND: writes always land at end of file.
    append: bool,
    open: bool,
    // Send but not Sync.
    _not_sync: PhantomData<Cell<()>>,
}

impl FileHandle {
    /// Open `path` with a mode string and default [`OpenOptions`].
    ///
    /// | Mode | Access | Flags |
    /// |------|--------|-------|
    /// | `"r"` | read | |
    /// | `"w"` | write | create, truncate |
    /// | `"rw"`, `"r+"` | read/write | |
    /// | `"w+"` | read/write | create, truncate |
    /// | `"a"` | write | create, append |
    /// | `"a+"` | read/write | create, append |
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::SessionClosed`] if the session is not initialized.
    /// - [`ErrorKind::InvalidArgument`] for an unknown mode string.
    /// - [`ErrorKind::NotFound`], [`ErrorKind::PermissionDenied`] or
    ///   [`ErrorKind::SystemError`] if the descriptor cannot be opened.
    /// - [`ErrorKind::RegistrationFailed`] if the native layer rejects the
    ///   descriptor. The descriptor is closed before returning.
    pub fn open(session: &Session, path: impl AsRef<Path>, mode: &str) -> Result<Self> {
        Self::open_with(session, path, mode, &OpenOptions::default())
    }

    /// Open `path` with explicit [`OpenOptions`].
    pub fn open_with(
        session: &Session,
        path: impl AsRef<Path>,
        mode: &str,
        options: &OpenOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let backend = session
            .backend()
            .ok_or_else(|| closed("FileHandle::open").with_context("path", path.display().to_string()))?;
        let (open_mode, mut flags) = parse_flags(mode)?;
        if options.direct_io && backend == DriverKind::Cufile {
            flags |= libc::O_DIRECT;
        }

        let fd = posix_io::posix_open(path, flags, options.permissions)
            .map_err(|e| e.with_operation("FileHandle::open"))?;

        match register(session.shared(), fd) {
            Ok((id, epoch)) => {
                tracing::debug!(path = %path.display(), fd, id, mode, "file opened");
                Ok(Self {
                    shared: session.shared().clone(),
                    fd,
                    id,
                    epoch,
                    mode: open_mode,
                    path: path.to_path_buf(),
                    position: 0,
                    append: flags & libc::O_APPEND != 0,
                    open: true,
                    _not_sync: PhantomData,
                })
            }
            Err(e) => {
                if let Err(close_err) = posix_io::posix_close(fd) {
                    tracing::warn!(error = %close_err, fd, "closing descriptor after failed registration");
                }
                Err(e
                    .with_operation("FileHandle::open")
                    .with_context("path", path.display().to_string()))
            }
        }
    }

    /// Read `size` bytes into `buf` through the session's backend.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidMode`] if the handle is closed or write-only.
    /// - [`ErrorKind::InvalidArgument`] if `buf` is null and `size > 0`.
    /// - [`ErrorKind::SessionClosed`] if the session was shut down.
    /// - [`ErrorKind::TransferFailed`] on a native or OS failure, with the
    ///   bytes moved so far in [`Error::bytes_transferred`].
    ///
    /// # Safety
    ///
    /// `buf` must be valid for writes of `size` bytes, in memory the backend
    /// can address.
    pub unsafe fn read(&mut self, buf: *mut c_void, size: usize, file_offset: Option<u64>) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.read_at(buf, size, file_offset, 0) }
    }

    /// Write `size` bytes from `buf` through the session's backend.
    ///
    /// Errors mirror [`read`](Self::read), with read-only handles rejected.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for reads of `size` bytes, in memory the backend
    /// can address.
    pub unsafe fn write(&mut self, buf: *const c_void, size: usize, file_offset: Option<u64>) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.write_at(buf, size, file_offset, 0) }
    }

    /// Read into `base + buf_offset`, where `base` is usually a registered
    /// buffer's base address.
    ///
    /// # Safety
    ///
    /// `base + buf_offset` must be valid for writes of `size` bytes.
    pub unsafe fn read_at(
        &mut self,
        base: *mut c_void,
        size: usize,
        file_offset: Option<u64>,
        buf_offset: u64,
    ) -> Result<usize> {
        // SAFETY: guaranteed by the caller.
        unsafe {
            self.transfer(Direction::Read, Route::Driver, base, size, file_offset, buf_offset, "FileHandle::read")
        }
    }

    /// Write from `base + buf_offset`.
    ///
    /// # Safety
    ///
    /// `base + buf_offset` must be valid for reads of `size` bytes.
    pub unsafe fn write_at(
        &mut self,
        base: *const c_void,
        size: usize,
        file_offset: Option<u64>,
        buf_offset: u64,
    ) -> Result<usize> {
        // SAFETY: guaranteed by the caller; the write path never writes through base.
        unsafe {
            self.transfer(
                Direction::Write,
                Route::Driver,
                base.cast_mut(),
                size,
                file_offset,
                buf_offset,
                "FileHandle::write",
            )
        }
    }

    /// Read into a host slice with `pread`. Returns fewer bytes than
    /// `buf.len()` only at end of file.
    pub fn read_host(&mut self, buf: &mut [u8], file_offset: Option<u64>) -> Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        unsafe {
            self.transfer(
                Direction::Read,
                Route::Host,
                buf.as_mut_ptr().cast(),
                buf.len(),
                file_offset,
                0,
                "FileHandle::read_host",
            )
        }
    }

    /// Write a host slice with `pwrite`.
    pub fn write_host(&mut self, buf: &[u8], file_offset: Option<u64>) -> Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes; the write path
        // never writes through the pointer.
        unsafe {
            self.transfer(
                Direction::Write,
                Route::Host,
                buf.as_ptr().cast_mut().cast(),
                buf.len(),
                file_offset,
                0,
                "FileHandle::write_host",
            )
        }
    }

    /// Read `size` bytes into `buf[dev_offset..]`.
    ///
    /// On the cuFile backend this is a direct transfer. In compatibility mode
    /// the data is staged through host memory.
    pub fn read_device(
        &mut self,
        buf: &mut CudaSlice<u8>,
        size: usize,
        file_offset: Option<u64>,
        dev_offset: u64,
    ) -> Result<usize> {
        let range = device_range(buf.len(), size, dev_offset, "FileHandle::read_device")?;
        let stream = buf.stream().clone();

        if self.live_backend("FileHandle::read_device")? == DriverKind::Cufile {
            let (ptr, _record) = buf.device_ptr_mut(&stream);
            stream.synchronize().map_err(|e| cuda_error("FileHandle::read_device", e))?;
            // SAFETY: ptr + dev_offset is valid for size bytes (checked above).
            return unsafe { self.read_at(ptr as usize as *mut c_void, size, file_offset, dev_offset) };
        }

        let mut staging = vec![0u8; size];
        let n = self
            .read_host(&mut staging, file_offset)
            .map_err(|e| e.with_operation("FileHandle::read_device"))?;
        if n > 0 {
            let mut dst = buf.slice_mut(range.start..range.start + n);
            stream
                .memcpy_htod(&staging[..n], &mut dst)
                .map_err(|e| cuda_error("FileHandle::read_device", e))?;
            stream.synchronize().map_err(|e| cuda_error("FileHandle::read_device", e))?;
        }
        Ok(n)
    }

    /// Write `size` bytes from `buf[dev_offset..]`.
    pub fn write_device(
        &mut self,
        buf: &CudaSlice<u8>,
        size: usize,
        file_offset: Option<u64>,
        dev_offset: u64,
    ) -> Result<usize> {
        let range = device_range(buf.len(), size, dev_offset, "FileHandle::write_device")?;
        let stream = buf.stream().clone();

        if self.live_backend("FileHandle::write_device")? == DriverKind::Cufile {
            let (ptr, _record) = buf.device_ptr(&stream);
            stream.synchronize().map_err(|e| cuda_error("FileHandle::write_device", e))?;
            // SAFETY: ptr + dev_offset is valid for size bytes (checked above).
            return unsafe { self.write_at(ptr as usize as *const c_void, size, file_offset, dev_offset) };
        }

        let staging = stream
            .memcpy_dtov(&buf.slice(range))
            .map_err(|e| cuda_error("FileHandle::write_device", e))?;
        self.write_host(&staging, file_offset)
            .map_err(|e| e.with_operation("FileHandle::write_device"))
    }

    /// Move the position used by offset-less transfers.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open("FileHandle::seek")?;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.nbytes()?.checked_add_signed(delta),
        };
        let Some(target) = target.filter(|&t| t <= i64::MAX as u64) else {
            return Err(Error::new(ErrorKind::InvalidArgument, format!("invalid seek to {pos:?}"))
                .with_operation("FileHandle::seek")
                .with_context("path", self.path.display().to_string()));
        };
        self.position = target;
        Ok(target)
    }

    /// Current position for offset-less transfers.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Size of the file in bytes.
    pub fn nbytes(&self) -> Result<u64> {
        self.ensure_open("FileHandle::nbytes")?;
        posix_io::file_size(self.fd).map_err(|e| e.with_operation("FileHandle::nbytes"))
    }

    /// The OS descriptor, or `-1` once closed.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Deregister the native handle and close the descriptor.
    ///
    /// The descriptor is closed even if deregistration fails; the first
    /// failure is returned afterwards. Closing a closed handle does nothing.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let mut result = self.deregister();
        if let Err(e) = posix_io::posix_close(self.fd) {
            tracing::warn!(error = %e, fd = self.fd, "close failed");
            result = result.and(Err(e));
        }
        tracing::debug!(path = %self.path.display(), fd = self.fd, id = self.id, "file closed");
        self.fd = -1;
        result.map_err(|e| e.with_operation("FileHandle::close"))
    }

    /// Remove this file from the session's table, if the session that opened
    /// it is still live.
    fn deregister(&self) -> Result<()> {
        let mut state = self.shared.write()?;
        let Some(live) = state.as_mut().filter(|live| live.epoch == self.epoch) else {
            // Shutdown already released the native handle.
            return Ok(());
        };
        let Some(handle) = live.files.remove(&self.id) else {
            return Ok(());
        };
        live.driver.handle_deregister(handle).inspect_err(|e| {
            tracing::warn!(error = %e, fd = self.fd, "native handle deregistration failed");
        })
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::InvalidMode, "file handle is closed")
                .with_operation(operation)
                .with_context("path", self.path.display().to_string()))
        }
    }

    fn live_backend(&self, operation: &'static str) -> Result<DriverKind> {
        self.ensure_open(operation)?;
        let state = self.shared.read().map_err(|e| e.with_operation(operation))?;
        state
            .as_ref()
            .filter(|live| live.epoch == self.epoch)
            .map(|live| live.driver.kind())
            .ok_or_else(|| self.session_closed(operation))
    }

    fn session_closed(&self, operation: &'static str) -> Error {
        closed(operation).with_context("path", self.path.display().to_string())
    }

    /// Validate, then loop single backend calls until `size` bytes moved or
    /// the backend reports end of file.
    ///
    /// # Safety
    ///
    /// `base + buf_offset` must be valid for `size` bytes in the direction of
    /// the transfer.
    #[allow(clippy::too_many_arguments)]
    unsafe fn transfer(
        &mut self,
        direction: Direction,
        route: Route,
        base: *mut c_void,
        size: usize,
        file_offset: Option<u64>,
        buf_offset: u64,
        operation: &'static str,
    ) -> Result<usize> {
        self.ensure_open(operation)?;
        let permitted = match direction {
            Direction::Read => self.mode.can_read(),
            Direction::Write => self.mode.can_write(),
        };
        if !permitted {
            return Err(Error::new(
                ErrorKind::InvalidMode,
                format!("{direction:?} not permitted on a {:?} handle", self.mode),
            )
            .with_operation(operation)
            .with_context("path", self.path.display().to_string()));
        }
        let appending = self.append && matches!(direction, Direction::Write);
        if appending && file_offset.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "append handles write at end of file and take no file offset",
            )
            .with_operation(operation)
            .with_context("path", self.path.display().to_string()));
        }
        if size == 0 {
            return Ok(0);
        }
        if base.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument, "null buffer address")
                .with_operation(operation)
                .with_context("size", size.to_string()));
        }

        let start = if appending {
            posix_io::file_size(self.fd).map_err(|e| e.with_operation(operation))?
        } else {
            file_offset.unwrap_or(self.position)
        };
        let end = start.checked_add(size as u64).filter(|&e| e <= i64::MAX as u64);
        let buf_end = buf_offset.checked_add(size as u64).filter(|&e| e <= i64::MAX as u64);
        if end.is_none() || buf_end.is_none() {
            return Err(Error::new(ErrorKind::InvalidArgument, "offset out of range")
                .with_operation(operation)
                .with_context("file_offset", start.to_string())
                .with_context("buf_offset", buf_offset.to_string()));
        }

        let state = self.shared.read().map_err(|e| e.with_operation(operation))?;
        let Some(live) = state.as_ref().filter(|live| live.epoch == self.epoch) else {
            return Err(self.session_closed(operation));
        };
        let Some(&handle) = live.files.get(&self.id) else {
            return Err(self.session_closed(operation));
        };

        let mut done = 0usize;
        while done < size {
            let remaining = size - done;
            let file_pos = (start + done as u64) as i64;
            let buf_pos = buf_offset + done as u64;
            // SAFETY: the caller guarantees base + buf_offset is valid for
            // size bytes, and buf_pos + remaining never exceeds that range.
            let ret = unsafe {
                match (route, direction) {
                    (Route::Driver, Direction::Read) => {
                        live.driver.read(handle, self.fd, base, remaining, file_pos, buf_pos as i64)
                    }
                    (Route::Driver, Direction::Write) => {
                        live.driver.write(handle, self.fd, base, remaining, file_pos, buf_pos as i64)
                    }
                    (Route::Host, Direction::Read) => posix_io::pread_raw(
                        self.fd,
                        base.cast::<u8>().add(buf_pos as usize),
                        remaining,
                        file_pos,
                    ),
                    (Route::Host, Direction::Write) => posix_io::pwrite_raw(
                        self.fd,
                        base.cast::<u8>().add(buf_pos as usize),
                        remaining,
                        file_pos,
                    ),
                }
            };
            match ret {
                Ok(0) => break,
                Ok(n) => done += n.min(remaining),
                Err(e) => {
                    return Err(e
                        .with_operation(operation)
                        .with_context("path", self.path.display().to_string())
                        .with_transferred(done));
                }
            }
        }
        drop(state);

        if appending {
            self.position = posix_io::file_size(self.fd).unwrap_or(start + done as u64);
        } else if file_offset.is_none() {
            self.position = start + done as u64;
        }
        Ok(done)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, path = %self.path.display(), "close on drop failed");
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("fd", &self.fd)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("open", &self.open)
            .finish()
    }
}

impl std::io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.read_host(buf, None)?)
    }
}

impl std::io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(self.write_host(buf, None)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        Ok(FileHandle::seek(self, pos)?)
    }
}

/// Add `fd` to the session's file table, returning the file id and epoch.
fn register(shared: &Shared, fd: RawFd) -> Result<(u64, u64)> {
    let mut state = shared.write()?;
    let Some(live) = state.as_mut() else {
        return Err(closed("FileHandle::open"));
    };
    let handle = live.driver.handle_register(fd)?;
    let id = next_id();
    live.files.insert(id, handle);
    Ok((id, live.epoch))
}

fn closed(operation: &'static str) -> Error {
    Error::new(ErrorKind::SessionClosed, "session is not initialized").with_operation(operation)
}

fn cuda_error(operation: &'static str, e: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::TransferFailed, format!("CUDA error: {e}")).with_operation(operation)
}

fn device_range(
    len: usize,
    size: usize,
    dev_offset: u64,
    operation: &'static str,
) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(dev_offset).ok();
    match start.and_then(|s| s.checked_add(size).map(|e| s..e)) {
        Some(range) if range.end <= len => Ok(range),
        _ => Err(Error::new(
            ErrorKind::InvalidArgument,
            "transfer exceeds the device buffer",
        )
        .with_operation(operation)
        .with_context("buffer_len", len.to_string())
        .with_context("size", size.to_string())
        .with_context("dev_offset", dev_offset.to_string())),
    }
}

/// Parse a mode string into an [`OpenMode`] and `libc::O_*` flags.
fn parse_flags(mode: &str) -> Result<(OpenMode, i32)> {
    match mode {
        "r" => Ok((OpenMode::Read, libc::O_RDONLY)),
        "w" => Ok((OpenMode::Write, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)),
        "rw" | "r+" => Ok((OpenMode::ReadWrite, libc::O_RDWR)),
        "w+" => Ok((OpenMode::ReadWrite, libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC)),
        "a" => Ok((OpenMode::Write, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND)),
        "a+" => Ok((OpenMode::ReadWrite, libc::O_RDWR | libc::O_CREAT | libc::O_APPEND)),
        _ => Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("unknown file mode: {mode:?}"),
        )
        .with_operation("FileHandle::open")),
    }
}
