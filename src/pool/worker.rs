//! Per-worker download loop (§4.5 steps 1-8), grounded on
//! `transfer::workers::download` — connect with backoff, dequeue with a
//! bounded wait, periodic health checks, buffered streaming download,
//! write-to-temp-then-atomic-rename, and reconnect-without-retry-count on a
//! recognized connection-loss error.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::SyncError;
use crate::model::HashAlgorithm;
use crate::progress::{ProgressEvent, ProgressSink, Throttler};
use crate::retry::retry_with_backoff;
use crate::transport::{Transport, TransportFactory};
use crate::verify::RemoteHashProbeCache;

use super::{Task, TaskResult};

pub struct WorkerConfig {
    pub worker_id: usize,
    pub max_retries: u32,
    pub verify_integrity: bool,
    pub use_hash_verification: bool,
    pub hash_algorithm: HashAlgorithm,
    pub health_check_interval: u32,
}

const READ_CHUNK: usize = 256 * 1024;

fn connect_with_backoff(factory: &dyn TransportFactory) -> Result<Box<dyn Transport>, SyncError> {
    retry_with_backoff(3, Duration::from_secs(2), |_| true, || factory.connect())
}

fn ensure_parent_dir(dir_cache: &mut std::collections::HashSet<PathBuf>, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !dir_cache.contains(parent) {
            std::fs::create_dir_all(parent)?;
            dir_cache.insert(parent.to_path_buf());
        }
    }
    Ok(())
}

/// Write to a sibling temp file, fsync, then rename over the final path —
/// matches the teacher's `atomic_rename_with_retries` durability pattern.
fn download_to_temp(
    transport: &mut dyn Transport,
    remote_path: &str,
    local_path: &Path,
    throttler: &mut Throttler,
    rel_path: &str,
    sink: &dyn ProgressSink,
) -> Result<u64, SyncError> {
    let tmp_name = format!(
        "{}.part",
        local_path.file_name().and_then(|n| n.to_str()).unwrap_or("download")
    );
    let tmp_path = local_path.with_file_name(tmp_name);
    let mut reader = transport.open_read(remote_path)?;
    let mut file = std::fs::File::create(&tmp_path)
        .map_err(|e| SyncError::TransientTransport(format!("create temp file: {e}")))?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        total += n as u64;
        throttler.tick(n as u64, rel_path, sink);
    }
    throttler.flush(rel_path, sink);
    file.sync_all().map_err(|e| SyncError::TransientTransport(e.to_string()))?;
    drop(file);
    atomic_rename_with_retries(&tmp_path, local_path)?;
    Ok(total)
}

fn atomic_rename_with_retries(tmp: &Path, dest: &Path) -> Result<(), SyncError> {
    let mut last_err = None;
    for attempt in 0..3 {
        match std::fs::rename(tmp, dest) {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(50 * (attempt + 1)));
            }
        }
    }
    let _ = std::fs::remove_file(tmp);
    Err(SyncError::TransientTransport(format!(
        "atomic rename failed: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

#[allow(clippy::too_many_arguments)]
pub fn run_worker(
    config: WorkerConfig,
    factory: Arc<dyn TransportFactory>,
    task_rx: Receiver<Task>,
    result_tx: Sender<TaskResult>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
    probe_cache: Arc<RemoteHashProbeCache>,
) {
    let mut transport: Option<Box<dyn Transport>> = None;
    let mut dir_cache = std::collections::HashSet::new();
    let mut dequeue_count: u32 = 0;
    let mut consecutive_failures: u32 = 0;
    let mut throttler = Throttler::new();

    while !stop.load(Ordering::SeqCst) {
        let task = match task_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(t) => t,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if transport.is_none() {
            match connect_with_backoff(factory.as_ref()) {
                Ok(t) => transport = Some(t),
                Err(e) => {
                    let _ = result_tx.send(TaskResult {
                        rel_path: task.rel_path.clone(),
                        outcome: Err((e, task)),
                    });
                    continue;
                }
            }
        }

        dequeue_count += 1;
        if dequeue_count % config.health_check_interval.max(1) == 0 {
            let healthy = transport.as_mut().map(|t| t.noop().is_ok()).unwrap_or(false);
            if !healthy {
                transport = None;
                match connect_with_backoff(factory.as_ref()) {
                    Ok(t) => transport = Some(t),
                    Err(e) => {
                        let _ = result_tx.send(TaskResult {
                            rel_path: task.rel_path.clone(),
                            outcome: Err((e, task)),
                        });
                        continue;
                    }
                }
            }
        }

        sink.emit(ProgressEvent::TransferStarted { rel_path: task.rel_path.clone(), size: task.size });

        let outcome = run_one_task(
            &config,
            transport.as_deref_mut().expect("connected above"),
            &mut dir_cache,
            &mut throttler,
            &task,
            sink.as_ref(),
            probe_cache.as_ref(),
        );

        match outcome {
            Ok(bytes) => {
                consecutive_failures = 0;
                let _ = result_tx.send(TaskResult { rel_path: task.rel_path.clone(), outcome: Ok(bytes) });
            }
            Err(err) => {
                if crate::error::looks_like_connection_loss(&err.to_string()) {
                    // Reconnect and retry the same task immediately; does
                    // not count against max_retries (§4.5 step 7).
                    transport = None;
                    match connect_with_backoff(factory.as_ref()) {
                        Ok(t) => {
                            transport = Some(t);
                            let retried = run_one_task(
                                &config,
                                transport.as_deref_mut().expect("just connected"),
                                &mut dir_cache,
                                &mut throttler,
                                &task,
                                sink.as_ref(),
                                probe_cache.as_ref(),
                            );
                            match retried {
                                Ok(bytes) => {
                                    consecutive_failures = 0;
                                    let _ = result_tx.send(TaskResult {
                                        rel_path: task.rel_path.clone(),
                                        outcome: Ok(bytes),
                                    });
                                    continue;
                                }
                                Err(e) => {
                                    consecutive_failures += 1;
                                    let _ = result_tx.send(TaskResult {
                                        rel_path: task.rel_path.clone(),
                                        outcome: Err((e, task)),
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            let _ = result_tx.send(TaskResult {
                                rel_path: task.rel_path.clone(),
                                outcome: Err((e, task)),
                            });
                        }
                    }
                } else {
                    consecutive_failures += 1;
                    let _ = result_tx
                        .send(TaskResult { rel_path: task.rel_path.clone(), outcome: Err((err, task)) });
                }

                if consecutive_failures >= 5 {
                    transport = None;
                    std::thread::sleep(Duration::from_secs(2));
                    consecutive_failures = 0;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_one_task(
    config: &WorkerConfig,
    transport: &mut dyn Transport,
    dir_cache: &mut std::collections::HashSet<PathBuf>,
    throttler: &mut Throttler,
    task: &Task,
    sink: &dyn ProgressSink,
    probe_cache: &RemoteHashProbeCache,
) -> Result<u64, SyncError> {
    ensure_parent_dir(dir_cache, &task.local_path)
        .map_err(|e| SyncError::TransientTransport(format!("mkdir: {e}")))?;

    let bytes = download_to_temp(
        transport,
        &task.remote_path,
        &task.local_path,
        throttler,
        &task.rel_path,
        sink,
    )?;

    if config.verify_integrity {
        let expected = task.checksum.as_ref().map(|c| (c.hex.as_str(), c.algorithm));
        let outcome = crate::verify::verify(
            transport,
            probe_cache,
            &task.local_path,
            &task.remote_path,
            task.size,
            expected,
        );
        if !outcome.ok {
            let _ = std::fs::remove_file(&task.local_path);
            return Err(SyncError::IntegrityMismatch {
                rel_path: task.rel_path.clone(),
                detail: outcome.message,
            });
        }
        return Ok(outcome.corrected_size.unwrap_or(bytes));
    }

    Ok(bytes)
}
