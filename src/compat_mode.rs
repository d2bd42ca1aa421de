//! Choosing between the cuFile driver and plain POSIX I/O.
//!
//! A [`Session`](crate::Session) resolves its [`CompatMode`] once, at `init`:
//!
//! - `Off`: the cuFile driver must open, otherwise `init` fails with
//!   [`ErrorKind::DriverUnavailable`].
//! - `On`: cuFile is never touched; transfers go through `pread`/`pwrite`.
//! - `Auto`: skip cuFile outright on hosts that cannot run it (WSL, no
//!   `/run/udev`), otherwise try it and fall back to POSIX if it fails.

use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

/// Controls whether a session uses GPUDirect Storage or POSIX I/O.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CompatMode {
    /// Require cuFile.
    Off,
    /// POSIX I/O only.
    On,
    /// Try cuFile, fall back to POSIX (default).
    #[default]
    Auto,
}

impl CompatMode {
    /// Parse a compatibility mode, case-insensitively.
    ///
    /// `on`/`true`/`yes`/`1` mean POSIX only, `off`/`false`/`no`/`0` mean
    /// cuFile only, `auto` means probe.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(CompatMode::On),
            "off" | "false" | "no" | "0" => Ok(CompatMode::Off),
            "auto" => Ok(CompatMode::Auto),
            _ => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("unknown compatibility mode: {s:?}"),
            )
            .with_operation("CompatMode::parse")),
        }
    }
}

impl std::fmt::Display for CompatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CompatMode::Off => "OFF",
            CompatMode::On => "ON",
            CompatMode::Auto => "AUTO",
        })
    }
}

/// Returns `true` under Windows Subsystem for Linux, where GDS is unsupported.
pub fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| v.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

/// Returns `true` if `/run/udev` exists. cuFile needs it to discover
/// devices and it is missing in most containers.
pub fn is_udev_readable() -> bool {
    Path::new("/run/udev").is_dir()
}

/// Decide which backend a session should run on.
///
/// `open_driver` is only called when the mode allows cuFile and the host
/// looks capable of it. Returns the driver (if any) together with the
/// effective mode: `Off` when the driver is in use, `On` otherwise.
pub(crate) fn negotiate<D>(
    mode: CompatMode,
    open_driver: impl FnOnce() -> Result<D>,
) -> Result<(Option<D>, CompatMode)> {
    match mode {
        CompatMode::On => Ok((None, CompatMode::On)),
        CompatMode::Off => {
            let driver = open_driver().map_err(|e| e.with_operation("CompatMode::negotiate"))?;
            Ok((Some(driver), CompatMode::Off))
        }
        CompatMode::Auto => {
            if is_wsl() || !is_udev_readable() {
                tracing::info!("host cannot run GPUDirect Storage, using POSIX I/O");
                return Ok((None, CompatMode::On));
            }
            match open_driver() {
                Ok(driver) => Ok((Some(driver), CompatMode::Off)),
                Err(e) => {
                    tracing::warn!(error = %e, "cuFile unavailable, falling back to POSIX I/O");
                    Ok((None, CompatMode::On))
                }
            }
        }
    }
}
