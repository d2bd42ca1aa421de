//! Error types for cufile-rs.
//!
//! # Design
//!
//! - [`ErrorKind`] is the closed taxonomy callers branch on.
//! - [`ErrorStatus`] indicates *what to do about it* (retry or not).
//! - [`Error`] combines both with the raw OS/native codes and rich context.
//!
//! Raw vendor or OS codes are never the only information an error carries,
//! but they are attached for diagnostics through [`Error::errno`] and
//! [`Error::native_status`].
//!
//! Errors are constructed via a fluent builder pattern:
//!
//! ```
//! use cufile_rs::error::{Error, ErrorKind};
//!
//! let err = Error::new(ErrorKind::RegistrationFailed, "cuFileHandleRegister rejected the descriptor")
//!     .with_operation("FileHandle::open")
//!     .with_context("path", "/data/file.bin")
//!     .with_native_status(5030);
//! assert_eq!(err.native_status(), Some(5030));
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// A specialized `Result` type for cufile-rs operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes the type of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// `shutdown` was called on a session that is not initialized.
    NotInitialized,
    /// `init` was called while a session is already initialized.
    AlreadyInitialized,
    /// The direct-storage subsystem is unreachable or incompatible.
    DriverUnavailable,
    /// The operation needs an initialized session, or the session that owned
    /// the handle has been shut down.
    SessionClosed,
    /// The requested file was not found.
    NotFound,
    /// Permission denied when opening a file.
    PermissionDenied,
    /// The native layer rejected a handle or buffer (de)registration.
    RegistrationFailed,
    /// The handle is closed, or its mode forbids the requested direction.
    InvalidMode,
    /// Caller contract violation: null or empty buffer, stale token, bad flag string.
    InvalidArgument,
    /// A native or POSIX read/write failed mid-transfer.
    TransferFailed,
    /// Any other OS-level failure (e.g. `EISDIR`, `EMFILE`).
    SystemError,
    /// An internal invariant was broken. Should not happen.
    Unexpected,
}

impl ErrorKind {
    /// Returns a static string label for this error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::AlreadyInitialized => "AlreadyInitialized",
            ErrorKind::DriverUnavailable => "DriverUnavailable",
            ErrorKind::SessionClosed => "SessionClosed",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::RegistrationFailed => "RegistrationFailed",
            ErrorKind::InvalidMode => "InvalidMode",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::SystemError => "SystemError",
            ErrorKind::Unexpected => "Unexpected",
        }
    }

    /// Whether to capture a backtrace for this error kind.
    ///
    /// Only `Unexpected` errors capture one: every other kind has a call site
    /// that is already named by the operation.
    fn enable_backtrace(&self) -> bool {
        matches!(self, ErrorKind::Unexpected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicates whether the caller should retry the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// The error is permanent and should not be retried.
    Permanent,
    /// The error is transient and may succeed on retry.
    Temporary,
    /// The error was transient but persisted after retry attempts.
    /// Should not be retried again.
    Persistent,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Permanent => f.write_str("permanent"),
            ErrorStatus::Temporary => f.write_str("temporary"),
            ErrorStatus::Persistent => f.write_str("persistent"),
        }
    }
}

/// The main error type for cufile-rs.
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    errno: Option<i32>,
    native_status: Option<i64>,
    transferred: Option<usize>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Option<Box<Backtrace>>,
}

impl Error {
    /// Create a new error with the given kind and message.
    ///
    /// Defaults to `ErrorStatus::Permanent` and empty operation/context.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: ErrorStatus::Permanent,
            operation: "",
            context: Vec::new(),
            errno: None,
            native_status: None,
            transferred: None,
            source: None,
            // `Backtrace::capture()` is zero cost when `RUST_BACKTRACE` is not set.
            backtrace: kind
                .enable_backtrace()
                .then(Backtrace::capture)
                .filter(|bt| bt.status() == BacktraceStatus::Captured)
                .map(Box::new),
        }
    }

    /// Build an error from an OS `errno`, keeping the errno as auxiliary context.
    ///
    /// `ENOENT` maps to [`ErrorKind::NotFound`], `EACCES`/`EPERM` to
    /// [`ErrorKind::PermissionDenied`]; everything else becomes `fallback`.
    pub fn from_errno(errno: i32, fallback: ErrorKind, what: &str) -> Self {
        let io_err = std::io::Error::from_raw_os_error(errno);
        let kind = match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
            _ => fallback,
        };
        let err = Error::new(kind, format!("{what} failed: {io_err}"))
            .with_errno(errno)
            .set_source(io_err);
        if is_temporary_errno(errno) {
            err.set_temporary()
        } else {
            err
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error status.
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Returns the operation that caused this error.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Returns the human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the error context as key-value pairs.
    pub fn context_iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.context.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// The OS `errno` behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// The raw cuFile status number behind this error, if any.
    pub fn native_status(&self) -> Option<i64> {
        self.native_status
    }

    /// Bytes moved before a [`ErrorKind::TransferFailed`] error interrupted the transfer.
    pub fn bytes_transferred(&self) -> Option<usize> {
        self.transferred
    }

    /// Returns `true` if this error is permanent.
    pub fn is_permanent(&self) -> bool {
        self.status == ErrorStatus::Permanent
    }

    /// Returns `true` if this error is temporary (retryable).
    pub fn is_temporary(&self) -> bool {
        self.status == ErrorStatus::Temporary
    }

    /// Returns `true` if this error is persistent (was temporary, no longer retryable).
    pub fn is_persistent(&self) -> bool {
        self.status == ErrorStatus::Persistent
    }

    /// Set the error status to permanent. Consumes and returns self.
    pub fn set_permanent(mut self) -> Self {
        self.status = ErrorStatus::Permanent;
        self
    }

    /// Set the error status to temporary. Consumes and returns self.
    pub fn set_temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Set the error status to persistent. Consumes and returns self.
    pub fn set_persistent(mut self) -> Self {
        self.status = ErrorStatus::Persistent;
        self
    }

    /// Set the operation that caused this error.
    ///
    /// If the error already has an operation, the previous one is pushed
    /// into context as `("called", previous_operation)`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add a key-value context pair.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Attach the OS `errno`.
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    /// Attach the raw native status number.
    pub fn with_native_status(mut self, status: i64) -> Self {
        self.native_status = Some(status);
        self
    }

    /// Record how many bytes were transferred before the failure.
    pub fn with_transferred(mut self, bytes: usize) -> Self {
        self.transferred = Some(bytes);
        self
    }

    /// Set the underlying source error.
    pub fn set_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the captured backtrace, if any.
    ///
    /// Backtraces are only captured for [`ErrorKind::Unexpected`] and only when
    /// `RUST_BACKTRACE=1` (or `full`) is set.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            let mut d = f.debug_struct("Error");
            d.field("kind", &self.kind);
            d.field("message", &self.message);
            d.field("status", &self.status);
            d.field("operation", &self.operation);
            d.field("context", &self.context);
            d.field("errno", &self.errno);
            d.field("native_status", &self.native_status);
            d.field("transferred", &self.transferred);
            d.field("source", &self.source.as_ref().map(|s| s.to_string()));
            d.finish()
        } else {
            writeln!(
                f,
                "{} ({}) at {} => {}",
                self.kind, self.status, self.operation, self.message
            )?;
            if !self.context.is_empty() || self.has_codes() {
                writeln!(f)?;
                writeln!(f, "Context:")?;
                for (k, v) in &self.context {
                    writeln!(f, "   {k}: {v}")?;
                }
                if let Some(errno) = self.errno {
                    writeln!(f, "   errno: {errno}")?;
                }
                if let Some(status) = self.native_status {
                    writeln!(f, "   native_status: {status}")?;
                }
                if let Some(n) = self.transferred {
                    writeln!(f, "   transferred: {n}")?;
                }
            }
            if let Some(source) = &self.source {
                writeln!(f)?;
                writeln!(f, "Source:")?;
                writeln!(f, "   {source}")?;
            }
            if let Some(backtrace) = &self.backtrace {
                writeln!(f)?;
                writeln!(f, "Backtrace:")?;
                writeln!(f, "{backtrace}")?;
            }
            Ok(())
        }
    }
}

impl Error {
    fn has_codes(&self) -> bool {
        self.errno.is_some() || self.native_status.is_some() || self.transferred.is_some()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            write!(f, " }}")?;
        }
        write!(f, " => {}", self.message)?;
        if let Some(status) = self.native_status {
            write!(f, " (native status {status})")?;
        }
        if let Some(n) = self.transferred {
            write!(f, " after {n} bytes")?;
        }
        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        let kind = match err.kind() {
            ErrorKind::NotFound => std::io::ErrorKind::NotFound,
            ErrorKind::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            ErrorKind::InvalidArgument | ErrorKind::InvalidMode => {
                std::io::ErrorKind::InvalidInput
            }
            ErrorKind::DriverUnavailable => std::io::ErrorKind::Unsupported,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// `errno` values worth retrying.
pub(crate) fn is_temporary_errno(errno: i32) -> bool {
    matches!(errno, libc::EAGAIN | libc::EBUSY | libc::EINTR)
}
