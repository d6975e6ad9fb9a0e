//! Typed progress events replacing the teacher's cooperative progress
//! callbacks and global console writer (Design Note, §9): components emit
//! [`ProgressEvent`]s to a [`ProgressSink`] instead of writing to stdout or a
//! shared `MultiProgress` directly, so tests can assert on a deterministic
//! event sequence and a human-facing run can still get the same bars.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ScanStarted { strategy: &'static str },
    ScanProgress { dirs_scanned: u64, files_found: u64 },
    ScanFinished { files_found: u64, partial: bool },
    DiffComputed { to_download: usize, to_delete: usize, total_bytes: u64 },
    DeletionApplied { rel_path: String },
    TransferStarted { rel_path: String, size: u64 },
    TransferProgress { rel_path: String, bytes: u64 },
    TransferCompleted { rel_path: String },
    TransferFailed { rel_path: String, message: String },
    Reconnected { worker: usize },
    Checkpoint { files_processed: u64, files_total: u64, bytes_transferred: u64 },
    RunCompleted { files: u64, bytes: u64, elapsed: Duration, had_errors: bool },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Sink that drops every event; used by library callers and tests that only
/// care about the return value of a run.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink that appends every event to an in-memory vector under a mutex, for
/// deterministic assertions in integration tests.
#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Human-facing sink backed by `indicatif`, mirroring the teacher's
/// `util::init_progress_and_mp` / `set_startup_header` / `print_summary`.
pub struct IndicatifSink {
    mp: Arc<MultiProgress>,
    header: ProgressBar,
    total_pb: ProgressBar,
    bytes_done: AtomicU64,
}

impl IndicatifSink {
    pub fn new(total_bytes: u64) -> Self {
        let mp = Arc::new(MultiProgress::with_draw_target(ProgressDrawTarget::stdout()));
        let header = mp.add(ProgressBar::new_spinner());
        header.set_style(ProgressStyle::with_template("{msg}").expect("valid header template"));
        let total_pb = mp.add(ProgressBar::new(total_bytes));
        total_pb.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta}) {msg}",
            )
            .expect("valid total template"),
        );
        Self { mp, header, total_pb, bytes_done: AtomicU64::new(0) }
    }

    pub fn set_header(&self, action: &str, workers: usize) {
        self.header.set_message(format!("{:<10}    Worker:{}", format!("Action:{action}"), workers));
    }

    pub fn multi_progress(&self) -> Arc<MultiProgress> {
        self.mp.clone()
    }
}

impl ProgressSink for IndicatifSink {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::TransferProgress { bytes, .. } => {
                self.bytes_done.fetch_add(bytes, Ordering::SeqCst);
                self.total_pb.set_position(self.bytes_done.load(Ordering::SeqCst));
            }
            ProgressEvent::TransferCompleted { rel_path } => {
                self.total_pb.set_message(rel_path);
            }
            ProgressEvent::RunCompleted { files, bytes, elapsed, .. } => {
                self.total_pb.finish_and_clear();
                if elapsed.as_secs_f64() > 0.0 {
                    let mb = bytes as f64 / 1024.0 / 1024.0;
                    println!(
                        "average rate: {:.2} MB/s ({bytes} bytes, {:.2}s, {files} files)",
                        mb / elapsed.as_secs_f64(),
                        elapsed.as_secs_f64()
                    );
                }
            }
            _ => {}
        }
    }
}

/// Coalesces many small byte-count updates into periodic sink emissions, the
/// same batching the teacher's worker `Throttler` performs before touching a
/// shared progress bar.
pub struct Throttler {
    pending: u64,
    last_flush: Instant,
}

impl Throttler {
    pub fn new() -> Self {
        Self { pending: 0, last_flush: Instant::now() }
    }

    pub fn tick(&mut self, n: u64, rel_path: &str, sink: &dyn ProgressSink) {
        self.pending += n;
        if self.pending >= 64 * 1024 || self.last_flush.elapsed() >= Duration::from_millis(50) {
            self.flush(rel_path, sink);
        }
    }

    pub fn flush(&mut self, rel_path: &str, sink: &dyn ProgressSink) {
        if self.pending > 0 {
            sink.emit(ProgressEvent::TransferProgress {
                rel_path: rel_path.to_string(),
                bytes: self.pending,
            });
            self.pending = 0;
            self.last_flush = Instant::now();
        }
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_events_in_order() {
        let sink = RecordingSink::default();
        sink.emit(ProgressEvent::ScanStarted { strategy: "full_recursive" });
        sink.emit(ProgressEvent::ScanFinished { files_found: 3, partial: false });
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::ScanStarted { .. }));
    }

    #[test]
    fn throttler_flushes_past_byte_threshold() {
        let sink = RecordingSink::default();
        let mut th = Throttler::new();
        th.tick(70 * 1024, "a.txt", &sink);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
    }
}
