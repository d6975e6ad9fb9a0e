//! Logging init helper, grounded on `main.rs::init_tracing_if_requested` in
//! the teacher crate: a file-only `tracing` layer under a caller-supplied
//! directory, non-blocking so the writer thread never stalls a worker.
//!
//! The out-of-scope CLI front-end decides whether and when to call this; the
//! library itself never installs a global subscriber implicitly.

use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a non-blocking file-backed tracing subscriber rooted at
/// `logs_dir/debug.log`, filtered by `level` (e.g. `"info"`, `"debug"`).
/// Returns the worker guard; dropping it stops the background writer
/// thread, so the caller must hold onto it for the life of the process.
pub fn init_file_logging(
    logs_dir: &Path,
    level: &str,
) -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;
    let file = std::fs::OpenOptions::new().create(true).append(true).open(logs_dir.join("debug.log"))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let layer = fmt::layer().with_writer(writer).with_ansi(false).with_filter(EnvFilter::new(level));
    tracing_subscriber::registry().with(layer).init();
    Ok(guard)
}
