//! Host-memory I/O through a session.
//!
//! Runs without a GPU: the session negotiates its backend from
//! `CUFILE_RS_COMPAT_MODE` (default `auto`) and falls back to POSIX I/O.
//!
//! ```sh
//! RUST_LOG=cufile_rs=debug cargo run --example basic_io
//! ```

use std::time::Instant;

use cufile_rs::{Config, ErrorKind, Session};
use tracing_subscriber::EnvFilter;

fn main() -> cufile_rs::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("cufile-rs: Basic I/O Example");
    println!("============================\n");

    let config = Config::get();
    println!("Configuration:");
    println!("  compat_mode:        {}", config.compat_mode);
    println!("  direct_io:          {}", config.direct_io);
    println!("  file_permissions:   {:o}", config.file_permissions);
    println!("  buf_register_flags: {}", config.buf_register_flags);
    println!();

    let session = Session::new();
    session.init()?;
    println!(
        "Session: backend {:?}, effective compat mode {}",
        session.backend(),
        session.compat_mode().map(|m| m.to_string()).unwrap_or_default()
    );

    let nelem: usize = 1024;
    let data: Vec<u8> = (0..nelem).flat_map(|i| (i as i32).to_ne_bytes()).collect();
    let size = data.len();

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("basic_io.bin");
    println!("File: {}\n", path.display());

    // ---- Write ----
    let start = Instant::now();
    let mut out = session.open(&path, "w")?;
    let written = out.write_host(&data, Some(0))?;
    out.close()?;
    println!("Write: {written} bytes in {} us", start.elapsed().as_micros());

    // ---- Read through a registered buffer ----
    let mut inp = session.open(&path, "r")?;
    println!("File size: {} bytes", inp.nbytes()?);

    let mut buf = vec![0u8; size];
    // SAFETY: buf outlives the registration, which is released below.
    let token = unsafe { session.register_buffer(buf.as_ptr().cast(), buf.len())? };
    let start = Instant::now();
    let read = inp.read_host(&mut buf, Some(0))?;
    println!("Read:  {read} bytes in {} us", start.elapsed().as_micros());
    session.deregister_buffer(token)?;

    assert_eq!(buf, data, "data mismatch");
    println!("\nData verification: PASSED ({nelem} elements)");

    // ---- Error taxonomy ----
    let err = inp.write_host(&data, Some(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
    println!("Writing to a read-only handle: {err}");

    let err = session.open(dir.path().join("missing.bin"), "r").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    println!("Opening a missing file:        {err}");

    inp.close()?;
    session.shutdown()?;
    println!("\nDone.");
    Ok(())
}
