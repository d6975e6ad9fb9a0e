//! Transfer Pool (C5): a fixed-size worker set, each owning an independent
//! transport connection, draining a priority-ordered task queue (§4.5).
//! Grounded on `transfer::workers::{mod,download}` — the bounded
//! progress-bar "slot" idea is replaced here by unconditional
//! `ProgressEvent` emission (sinks decide how many bars to render).

mod worker;

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::{Checksum, HashAlgorithm};
use crate::progress::ProgressSink;
use crate::transport::TransportFactory;
use crate::verify::RemoteHashProbeCache;

#[derive(Debug, Clone)]
pub struct Task {
    pub rel_path: String,
    pub remote_path: String,
    pub local_path: std::path::PathBuf,
    pub size: u64,
    pub priority: i64,
    pub retry_count: u32,
    /// Checksum recorded at scan time, if the scanner or a prior state row
    /// carried one. Threaded through so the worker can hash-verify without
    /// a second remote round trip.
    pub checksum: Option<Checksum>,
}

impl Task {
    /// Small files first (grouped under a 1 MiB threshold), then large files
    /// largest-first, so a run produces visible progress quickly (§4.5).
    pub fn initial_priority(size: u64) -> i64 {
        const SMALL_THRESHOLD: u64 = 1024 * 1024;
        if size < SMALL_THRESHOLD { i64::MAX - size as i64 } else { size as i64 }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}
impl Eq for Task {}
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Task {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority.cmp(&other.priority)
    }
}

pub struct TaskResult {
    pub rel_path: String,
    pub outcome: Result<u64, (SyncError, Task)>,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub completed: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub reconnections: u64,
}

pub struct PoolConfig {
    pub workers: usize,
    pub max_retries: u32,
    pub verify_integrity: bool,
    pub use_hash_verification: bool,
    pub hash_algorithm: HashAlgorithm,
    pub health_check_interval: u32,
    pub stall_timeout: Duration,
    pub stagger_delay: Duration,
}

impl PoolConfig {
    pub fn from_sync_config(cfg: &SyncConfig) -> Self {
        Self {
            workers: cfg.effective_workers(),
            max_retries: cfg.max_retries,
            verify_integrity: cfg.verify_integrity,
            use_hash_verification: cfg.use_hash_verification,
            hash_algorithm: cfg.hash_algorithm,
            health_check_interval: 50,
            stall_timeout: Duration::from_secs(300),
            stagger_delay: cfg.stagger_delay(),
        }
    }
}

/// Runs the pool to completion over the given tasks, blocking the caller.
/// Returns once every task has either completed, exhausted its retries, or
/// the pool detected a stall.
pub fn run(
    config: &PoolConfig,
    factory: Arc<dyn TransportFactory>,
    tasks: Vec<Task>,
    sink: Arc<dyn ProgressSink>,
) -> (PoolStats, Vec<(String, u64)>, Vec<(String, SyncError)>) {
    let (task_tx, task_rx): (Sender<Task>, Receiver<Task>) = unbounded();
    let (result_tx, result_rx): (Sender<TaskResult>, Receiver<TaskResult>) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));

    let mut heap: BinaryHeap<Task> = tasks.into_iter().collect();
    let mut in_flight = heap.len();
    while let Some(task) = heap.pop() {
        let _ = task_tx.send(task);
    }

    let probe_cache = Arc::new(RemoteHashProbeCache::new());
    let mut handles = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let task_rx = task_rx.clone();
        let result_tx = result_tx.clone();
        let factory = factory.clone();
        let stop = stop.clone();
        let sink = sink.clone();
        let probe_cache = probe_cache.clone();
        let stagger = config.stagger_delay * worker_id as u32;
        let worker_cfg = worker::WorkerConfig {
            worker_id,
            max_retries: config.max_retries,
            verify_integrity: config.verify_integrity,
            use_hash_verification: config.use_hash_verification,
            hash_algorithm: config.hash_algorithm,
            health_check_interval: config.health_check_interval,
        };
        handles.push(std::thread::spawn(move || {
            std::thread::sleep(stagger);
            worker::run_worker(worker_cfg, factory, task_rx, result_tx, stop, sink, probe_cache)
        }));
    }
    drop(task_rx);
    drop(result_tx);

    let mut stats = PoolStats::default();
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    let mut last_progress = Instant::now();

    while in_flight > 0 {
        match result_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(result) => {
                in_flight -= 1;
                last_progress = Instant::now();
                match result.outcome {
                    Ok(bytes) => {
                        stats.completed += 1;
                        stats.bytes_transferred += bytes;
                        successes.push((result.rel_path.clone(), bytes));
                        sink.emit(crate::progress::ProgressEvent::TransferCompleted {
                            rel_path: result.rel_path,
                        });
                    }
                    Err((err, failed_task)) => {
                        sink.emit(crate::progress::ProgressEvent::TransferFailed {
                            rel_path: result.rel_path.clone(),
                            message: err.to_string(),
                        });
                        if failed_task.retry_count < config.max_retries {
                            let mut retried = failed_task;
                            retried.retry_count += 1;
                            retried.priority -= 100;
                            if task_tx.send(retried).is_ok() {
                                in_flight += 1;
                            } else {
                                stats.failed += 1;
                                failures.push((result.rel_path, err));
                            }
                        } else {
                            stats.failed += 1;
                            failures.push((result.rel_path, err));
                        }
                    }
                }
            }
            Err(_) => {
                if last_progress.elapsed() >= config.stall_timeout {
                    stop.store(true, Ordering::SeqCst);
                    failures.push((
                        "<pool>".to_string(),
                        SyncError::Stalled { last_progress_secs: last_progress.elapsed().as_secs() },
                    ));
                    break;
                }
            }
        }
    }

    stop.store(true, Ordering::SeqCst);
    drop(task_tx);
    for h in handles {
        let _ = h.join();
    }

    (stats, successes, failures)
}
