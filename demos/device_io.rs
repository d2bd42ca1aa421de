//! Device-memory I/O: GPUDirect Storage when available, staged through host
//! memory otherwise.
//!
//! # Requirements
//!
//! - NVIDIA GPU with CUDA support
//! - cuFile/GDS drivers for the direct path (the demo still runs without them)
//!
//! ```sh
//! RUST_LOG=cufile_rs=info cargo run --example device_io
//! ```

use std::time::Instant;

use cufile_rs::{CompatMode, Session};
use tracing_subscriber::EnvFilter;

fn main() -> cufile_rs::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("cufile-rs: Device I/O Example");
    println!("=============================\n");

    let ctx = match cudarc::driver::CudaContext::new(0) {
        Ok(ctx) => ctx,
        Err(e) => {
            println!("CUDA device 0 not available ({e}); nothing to do.");
            return Ok(());
        }
    };
    let stream = ctx.default_stream();

    let session = Session::with_compat_mode(CompatMode::Auto);
    session.init()?;
    println!("GDS available: {}\n", session.is_gds_available());

    let size = 16 * 1024 * 1024;
    let host: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let src = stream.memcpy_stod(&host).expect("memcpy_stod failed");
    let mut dst = stream.alloc_zeros::<u8>(size).expect("alloc_zeros failed");

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("device_io.bin");

    let src_token = session.register_device_buffer(&src)?;
    let mut file = session.open(&path, "w+")?;

    let start = Instant::now();
    let written = file.write_device(&src, size, Some(0), 0)?;
    let elapsed = start.elapsed();
    println!(
        "Write: {written} bytes in {:.2} ms ({:.1} MiB/s)",
        elapsed.as_secs_f64() * 1e3,
        written as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
    );
    session.deregister_buffer(src_token)?;

    let start = Instant::now();
    let read = file.read_device(&mut dst, size, Some(0), 0)?;
    let elapsed = start.elapsed();
    println!(
        "Read:  {read} bytes in {:.2} ms ({:.1} MiB/s)",
        elapsed.as_secs_f64() * 1e3,
        read as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64()
    );

    let back = stream.memcpy_dtov(&dst).expect("memcpy_dtov failed");
    assert_eq!(back, host, "device round trip mismatch");
    println!("\nData verification: PASSED");

    file.close()?;
    session.shutdown()?;
    Ok(())
}
