//! The driver session: process-wide state every file and buffer hangs off.
//!
//! A [`Session`] starts uninitialized. [`Session::init`] negotiates a backend
//! (see [`CompatMode`]) and [`Session::shutdown`] tears it down, releasing
//! every buffer registration and every open file's native handle. Only one
//! session may be initialized per process at a time; a single mutex gate
//! serializes all init/shutdown transitions.
//!
//! Calling `init` on an initialized session is an error
//! ([`ErrorKind::AlreadyInitialized`]), never a silent no-op. A session that
//! has been shut down may be initialized again; handles and registration
//! tokens from the earlier epoch stay invalid.
//!
//! # Examples
//!
//! ```no_run
//! use cufile_rs::{CompatMode, Session};
//!
//! let session = Session::with_compat_mode(CompatMode::Auto);
//! session.init().unwrap();
//! let mut file = session.open("/data/model.bin", "r").unwrap();
//! let mut buf = vec![0u8; 4096];
//! let n = file.read_host(&mut buf, Some(0)).unwrap();
//! println!("read {n} bytes");
//! file.close().unwrap();
//! session.shutdown().unwrap();
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::compat_mode::{self, CompatMode};
use crate::config::Config;
use crate::cufile_driver::CufileDriver;
use crate::driver::{Driver, DriverKind, NativeHandle, PosixDriver};
use crate::error::{Error, ErrorKind, Result};
use crate::file_handle::FileHandle;

/// Set while any session in the process is initialized.
static SESSION_GATE: Mutex<bool> = Mutex::new(false);

/// Source of file ids, buffer tokens and epochs. Never reused, so a stale id
/// can never alias a live one, even across sessions.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn lock_gate() -> MutexGuard<'static, bool> {
    // The gate guards a plain bool, which is always consistent.
    SESSION_GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A buffer the session currently recognizes for direct transfers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferRecord {
    pub(crate) base: usize,
    pub(crate) len: usize,
}

/// Everything that exists only while the session is initialized.
pub(crate) struct Live {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) compat_mode: CompatMode,
    pub(crate) epoch: u64,
    /// Native handles of open files, keyed by file id.
    pub(crate) files: HashMap<u64, NativeHandle>,
    /// Buffer registrations, keyed by token id.
    pub(crate) buffers: HashMap<u64, BufferRecord>,
}

/// Shared between a [`Session`] and the [`FileHandle`]s opened through it.
pub(crate) struct Shared {
    state: RwLock<Option<Live>>,
}

impl Shared {
    /// Read access for transfers. Many transfers may hold it at once.
    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Option<Live>>> {
        self.state.read().map_err(|_| poisoned())
    }

    /// Write access for state transitions and table updates.
    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Option<Live>>> {
        self.state.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> Error {
    Error::new(
        ErrorKind::Unexpected,
        "session state lock poisoned by a panicking thread",
    )
}

/// Process-wide connection to the direct-storage subsystem.
///
/// Pass it by reference to everything that needs it. Dropping an
/// initialized session shuts it down.
pub struct Session {
    shared: Arc<Shared>,
    requested: CompatMode,
}

impl Session {
    /// An uninitialized session using the configured compatibility mode.
    pub fn new() -> Self {
        Self::with_compat_mode(Config::get().compat_mode)
    }

    /// An uninitialized session that will negotiate `mode` at [`init`](Self::init).
    pub fn with_compat_mode(mode: CompatMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(None),
            }),
            requested: mode,
        }
    }

    /// Initialize the session.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::AlreadyInitialized`] if this or any other session in the
    ///   process is initialized.
    /// - [`ErrorKind::DriverUnavailable`] if the mode is [`CompatMode::Off`]
    ///   and the cuFile driver cannot be opened.
    pub fn init(&self) -> Result<()> {
        let requested = self.requested;
        self.init_with(|| {
            let (driver, mode) = compat_mode::negotiate(requested, CufileDriver::open)?;
            let driver: Arc<dyn Driver> = match driver {
                Some(d) => Arc::new(d),
                None => Arc::new(PosixDriver),
            };
            Ok((driver, mode))
        })
    }

    pub(crate) fn init_with(
        &self,
        open_driver: impl FnOnce() -> Result<(Arc<dyn Driver>, CompatMode)>,
    ) -> Result<()> {
        let mut gate = lock_gate();
        let mut state = self.shared.write().map_err(|e| e.with_operation("Session::init"))?;
        if state.is_some() || *gate {
            return Err(Error::new(
                ErrorKind::AlreadyInitialized,
                if state.is_some() {
                    "session is already initialized"
                } else {
                    "another session in this process is initialized"
                },
            )
            .with_operation("Session::init"));
        }

        let (driver, compat_mode) = open_driver().map_err(|e| e.with_operation("Session::init"))?;
        let epoch = next_id();
        tracing::info!(%compat_mode, backend = ?driver.kind(), epoch, "session initialized");
        *state = Some(Live {
            driver,
            compat_mode,
            epoch,
            files: HashMap::new(),
            buffers: HashMap::new(),
        });
        *gate = true;
        Ok(())
    }

    /// Shut the session down.
    ///
    /// Every outstanding buffer registration is force-deregistered and every
    /// open file loses its native handle; later use of those files fails with
    /// [`ErrorKind::SessionClosed`]. The files' descriptors stay owned by
    /// their [`FileHandle`]s until closed or dropped.
    ///
    /// Teardown always runs to completion. If any native release failed, the
    /// first failure is returned after the session is already closed.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NotInitialized`] if the session is not initialized.
    pub fn shutdown(&self) -> Result<()> {
        let mut gate = lock_gate();
        let mut state = self
            .shared
            .write()
            .map_err(|e| e.with_operation("Session::shutdown"))?;
        let Some(live) = state.take() else {
            return Err(Error::new(ErrorKind::NotInitialized, "session is not initialized")
                .with_operation("Session::shutdown"));
        };
        *gate = false;
        drop(state);

        let mut first_error = None;
        let mut record = |e: Error| {
            tracing::warn!(error = %e, "session teardown step failed");
            first_error.get_or_insert(e);
        };

        for (token, buf) in &live.buffers {
            tracing::debug!(token, base = buf.base, len = buf.len, "force-deregistering buffer");
            // SAFETY: base was registered with this driver and not yet released.
            if let Err(e) = unsafe { live.driver.buf_deregister(buf.base as *const c_void) } {
                record(e.with_context("token", token.to_string()));
            }
        }
        for (file, handle) in &live.files {
            tracing::debug!(file, "releasing native handle of open file");
            if let Err(e) = live.driver.handle_deregister(*handle) {
                record(e.with_context("file", file.to_string()));
            }
        }
        if let Err(e) = live.driver.close() {
            record(e);
        }
        tracing::info!(
            epoch = live.epoch,
            buffers = live.buffers.len(),
            files = live.files.len(),
            "session shut down"
        );

        match first_error {
            Some(e) => Err(e.with_operation("Session::shutdown")),
            None => Ok(()),
        }
    }

    /// Returns `true` between a successful `init` and the next `shutdown`.
    pub fn is_initialized(&self) -> bool {
        self.shared.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// The effective compatibility mode: `Off` when cuFile is in use, `On`
    /// for POSIX I/O. `None` while uninitialized.
    pub fn compat_mode(&self) -> Option<CompatMode> {
        self.shared
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|live| live.compat_mode))
    }

    /// The compatibility mode requested at construction.
    pub fn requested_compat_mode(&self) -> CompatMode {
        self.requested
    }

    /// Returns `true` if transfers go through cuFile.
    pub fn is_gds_available(&self) -> bool {
        self.backend() == Some(DriverKind::Cufile)
    }

    /// The backend in use, or `None` while uninitialized.
    pub fn backend(&self) -> Option<DriverKind> {
        self.shared
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|live| live.driver.kind()))
    }

    /// Number of files currently registered with the session.
    pub fn open_files(&self) -> usize {
        self.shared
            .read()
            .ok()
            .and_then(|s| s.as_ref().map(|live| live.files.len()))
            .unwrap_or(0)
    }

    /// Open a file. Shorthand for [`FileHandle::open`].
    pub fn open(&self, path: impl AsRef<Path>, mode: &str) -> Result<FileHandle> {
        FileHandle::open(self, path, mode)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "session shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("requested", &self.requested)
            .field("compat_mode", &self.compat_mode())
            .field("open_files", &self.open_files())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::serial;
    use super::*;
    use crate::driver::testing::FaultyDriver;

    fn faulty_session() -> (Session, Arc<FaultyDriver>) {
        let driver = Arc::new(FaultyDriver::default());
        let session = Session::with_compat_mode(CompatMode::Off);
        let d = driver.clone();
        session.init_with(move || Ok((d as Arc<dyn Driver>, CompatMode::Off))).unwrap();
        (session, driver)
    }

    #[test]
    fn test_new_session_is_uninitialized() {
        let session = Session::with_compat_mode(CompatMode::On);
        assert!(!session.is_initialized());
        assert_eq!(session.compat_mode(), None);
        assert_eq!(session.requested_compat_mode(), CompatMode::On);
        assert!(!session.is_gds_available());
    }

    #[test]
    fn test_init_and_shutdown_compat() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::On);
        session.init().unwrap();
        assert!(session.is_initialized());
        assert_eq!(session.compat_mode(), Some(CompatMode::On));
        assert_eq!(session.backend(), Some(DriverKind::Posix));
        session.shutdown().unwrap();
        assert!(!session.is_initialized());
    }

    #[test]
    fn test_double_init_fails() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::On);
        session.init().unwrap();
        let err = session.init().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
        assert!(session.is_initialized());
        session.shutdown().unwrap();
    }

    #[test]
    fn test_second_session_blocked_while_first_live() {
        let _serial = serial();
        let first = Session::with_compat_mode(CompatMode::On);
        first.init().unwrap();

        let second = Session::with_compat_mode(CompatMode::On);
        let err = second.init().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyInitialized);
        assert!(!second.is_initialized());

        first.shutdown().unwrap();
        second.init().unwrap();
        second.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_uninitialized_fails() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::On);
        assert_eq!(session.shutdown().unwrap_err().kind(), ErrorKind::NotInitialized);

        session.init().unwrap();
        session.shutdown().unwrap();
        assert_eq!(session.shutdown().unwrap_err().kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_reinit_after_shutdown() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::On);
        session.init().unwrap();
        session.shutdown().unwrap();
        session.init().unwrap();
        assert!(session.is_initialized());
    }

    #[test]
    fn test_drop_releases_gate() {
        let _serial = serial();
        {
            let session = Session::with_compat_mode(CompatMode::On);
            session.init().unwrap();
        }
        let session = Session::with_compat_mode(CompatMode::On);
        session.init().unwrap();
        session.shutdown().unwrap();
    }

    #[test]
    fn test_failed_driver_open_leaves_session_uninitialized() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::Off);
        let err = session
            .init_with(|| Err(Error::new(ErrorKind::DriverUnavailable, "no libcufile")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverUnavailable);
        assert_eq!(err.operation(), "Session::init");
        assert!(!session.is_initialized());

        // The gate must not be held after a failed init.
        let other = Session::with_compat_mode(CompatMode::On);
        other.init().unwrap();
        other.shutdown().unwrap();
    }

    #[test]
    fn test_init_off_without_driver_is_unavailable_or_gds() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::Off);
        match session.init() {
            Ok(()) => {
                assert!(session.is_gds_available());
                session.shutdown().unwrap();
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::DriverUnavailable),
        }
    }

    #[test]
    fn test_shutdown_releases_files_and_buffers() {
        let _serial = serial();
        let (session, driver) = faulty_session();
        let tmp = tempfile::NamedTempFile::new().unwrap();

        let mut file = session.open(tmp.path(), "rw").unwrap();
        let buf = vec![0u8; 4096];
        let token = unsafe { session.register_buffer(buf.as_ptr().cast(), buf.len()) }.unwrap();
        assert_eq!(driver.live_handles.load(Ordering::SeqCst), 1);
        assert_eq!(driver.live_buffers.load(Ordering::SeqCst), 1);

        session.shutdown().unwrap();
        assert_eq!(driver.live_handles.load(Ordering::SeqCst), 0);
        assert_eq!(driver.live_buffers.load(Ordering::SeqCst), 0);

        let err = file.write_host(&[1, 2, 3], Some(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert_eq!(
            session.deregister_buffer(token).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        // Closing after shutdown only releases the descriptor.
        file.close().unwrap();
        assert_eq!(driver.live_handles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_reports_teardown_failure_but_closes() {
        let _serial = serial();
        let (session, driver) = faulty_session();
        let buf = vec![0u8; 64];
        unsafe { session.register_buffer(buf.as_ptr().cast(), buf.len()) }.unwrap();
        driver.fail_buf_deregister.store(true, Ordering::SeqCst);
        driver.fail_close.store(true, Ordering::SeqCst);

        let err = session.shutdown().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistrationFailed);
        assert_eq!(err.operation(), "Session::shutdown");
        assert!(!session.is_initialized());
    }

    #[test]
    fn test_handles_from_old_epoch_stay_closed() {
        let _serial = serial();
        let session = Session::with_compat_mode(CompatMode::On);
        session.init().unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut file = session.open(tmp.path(), "rw").unwrap();

        session.shutdown().unwrap();
        session.init().unwrap();

        let mut buf = [0u8; 8];
        let err = file.read_host(&mut buf, Some(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
        assert_eq!(session.open_files(), 0);
        session.shutdown().unwrap();
    }
}
