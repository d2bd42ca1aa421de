//! Buffer registration.
//!
//! Registering a buffer with the cuFile driver lets transfers into that range
//! skip the driver's internal staging. Registration is never required for
//! correctness: unregistered buffers work, just slower.
//!
//! The caller keeps ownership of the memory. The session only records that it
//! recognizes the range and hands back a [`RegistrationToken`]. Shutdown
//! force-deregisters every live range, after which old tokens are stale.

use std::ffi::c_void;

use cudarc::driver::{CudaSlice, DevicePtr};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::session::{next_id, BufferRecord, Session};

/// Names one buffer registration. Cheap to copy; becomes stale after
/// [`Session::deregister_buffer`] or session shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationToken {
    id: u64,
}

impl RegistrationToken {
    /// Opaque numeric id, useful in logs.
    pub fn id(self) -> u64 {
        self.id
    }
}

impl Session {
    /// Register `len` bytes at `base` for direct transfers.
    ///
    /// Flags come from [`Config::buf_register_flags`].
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidArgument`] if `len` is 0 or `base` is null.
    /// - [`ErrorKind::SessionClosed`] if the session is not initialized.
    /// - [`ErrorKind::RegistrationFailed`] if `base` is already registered or
    ///   the native layer rejects the range.
    ///
    /// # Safety
    ///
    /// `base` must stay valid for `len` bytes until the token is deregistered
    /// or the session is shut down.
    pub unsafe fn register_buffer(&self, base: *const c_void, len: usize) -> Result<RegistrationToken> {
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidArgument, "cannot register an empty buffer")
                .with_operation("Session::register_buffer"));
        }
        if base.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument, "cannot register a null address")
                .with_operation("Session::register_buffer")
                .with_context("length", len.to_string()));
        }

        let flags = Config::get().buf_register_flags;
        let mut state = self
            .shared()
            .write()
            .map_err(|e| e.with_operation("Session::register_buffer"))?;
        let Some(live) = state.as_mut() else {
            return Err(closed("Session::register_buffer"));
        };

        let addr = base as usize;
        if live.buffers.values().any(|b| b.base == addr) {
            return Err(Error::new(
                ErrorKind::RegistrationFailed,
                "address is already registered",
            )
            .with_operation("Session::register_buffer")
            .with_context("address", format!("{base:p}")));
        }

        // SAFETY: guaranteed by the caller.
        unsafe { live.driver.buf_register(base, len, flags) }
            .map_err(|e| e.with_operation("Session::register_buffer"))?;

        let token = RegistrationToken { id: next_id() };
        live.buffers.insert(token.id, BufferRecord { base: addr, len });
        tracing::debug!(token = token.id, address = ?base, len, flags, "buffer registered");
        Ok(token)
    }

    /// Register the whole of a device slice.
    ///
    /// The slice must outlive the registration; deregister it before the
    /// slice is dropped.
    pub fn register_device_buffer(&self, buf: &CudaSlice<u8>) -> Result<RegistrationToken> {
        let len = buf.len();
        let stream = buf.stream().clone();
        let (ptr, _record) = buf.device_ptr(&stream);
        // SAFETY: the device allocation is `len` bytes and the caller keeps
        // the slice alive while the token is live.
        unsafe { self.register_buffer(ptr as usize as *const c_void, len) }
            .map_err(|e| e.with_operation("Session::register_device_buffer"))
    }

    /// Release a registration.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidArgument`] for an unknown or stale token,
    /// [`ErrorKind::RegistrationFailed`] if the native layer refuses. In the
    /// latter case the registration is forgotten anyway.
    pub fn deregister_buffer(&self, token: RegistrationToken) -> Result<()> {
        let mut state = self
            .shared()
            .write()
            .map_err(|e| e.with_operation("Session::deregister_buffer"))?;
        let Some(live) = state.as_mut() else {
            return Err(unknown_token(token));
        };
        let Some(record) = live.buffers.remove(&token.id) else {
            return Err(unknown_token(token));
        };

        tracing::debug!(token = token.id, base = record.base, len = record.len, "buffer deregistered");
        // SAFETY: the address was registered with this driver and was just
        // removed from the table, so it is released once.
        unsafe { live.driver.buf_deregister(record.base as *const c_void) }
            .map_err(|e| e.with_operation("Session::deregister_buffer"))
    }

    /// Returns `true` if `token` names a live registration.
    pub fn is_registered(&self, token: RegistrationToken) -> bool {
        self.shared()
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|live| live.buffers.contains_key(&token.id)))
            .unwrap_or(false)
    }

    /// Number of live buffer registrations.
    pub fn registered_buffers(&self) -> usize {
        self.shared()
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|live| live.buffers.len()))
            .unwrap_or(0)
    }
}

fn unknown_token(token: RegistrationToken) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        "unknown or already deregistered buffer token",
    )
    .with_operation("Session::deregister_buffer")
    .with_context("token", token.id.to_string())
}

fn closed(operation: &'static str) -> Error {
    Error::new(ErrorKind::SessionClosed, "session is not initialized").with_operation(operation)
}
