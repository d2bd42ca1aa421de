//! # cufile-rs
//!
//! Safe resource lifetimes and error mapping for NVIDIA cuFile (GPUDirect
//! Storage).
//!
//! The vendor library does the DMA. This crate makes sure its resources are
//! acquired and released correctly and that every native or OS failure comes
//! back as a typed [`Error`]:
//!
//! - a [`Session`] wraps the process-wide driver (`cuFileDriverOpen`/`Close`),
//! - a [`FileHandle`] pairs a descriptor with its `cuFileHandleRegister`
//!   handle and releases both exactly once,
//! - [`Session::register_buffer`] tracks `cuFileBufRegister` ranges so that
//!   shutdown can force-release them.
//!
//! cuFile is reached through [`cudarc`]'s bindings.
//!
//! ## Backends
//!
//! - **cuFile** (`CompatMode::Off`): GPUDirect Storage; `init` fails if
//!   unavailable.
//! - **POSIX** (`CompatMode::On`): `pread`/`pwrite` on host memory; device
//!   slices are staged through host memory.
//! - **Auto** (`CompatMode::Auto`, default): cuFile when the host supports it,
//!   POSIX otherwise.
//!
//! ## Example
//!
//! ```no_run
//! use cufile_rs::{CompatMode, Session};
//!
//! let session = Session::with_compat_mode(CompatMode::On);
//! session.init()?;
//!
//! let mut out = session.open("/tmp/example.bin", "w")?;
//! out.write_host(&[42u8; 1024], Some(0))?;
//! out.close()?;
//!
//! let mut inp = session.open("/tmp/example.bin", "r")?;
//! let mut buf = vec![0u8; 1024];
//! assert_eq!(inp.read_host(&mut buf, Some(0))?, 1024);
//! # Ok::<(), cufile_rs::Error>(())
//! ```

pub mod buffer;
pub mod compat_mode;
pub mod config;
mod cufile_driver;
mod driver;
pub mod error;
pub mod file_handle;
pub mod posix_io;
pub mod session;

pub use buffer::RegistrationToken;
pub use compat_mode::CompatMode;
pub use config::Config;
pub use driver::DriverKind;
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use file_handle::{FileHandle, OpenMode, OpenOptions};
pub use session::Session;
