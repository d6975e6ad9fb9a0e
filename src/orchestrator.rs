//! Sync Orchestrator (C7): wires the scanner, state store, exclusion set,
//! tar streamer, and transfer pool into one run (§4.7). Grounded on
//! `commands::pull`'s phase ordering in the teacher crate, generalized from a
//! one-shot upload command into a resumable mirror pass.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{SyncConfig, TransportKind};
use crate::error::SyncError;
use crate::exclude::ExcludeSet;
use crate::model::{Checkpoint, CheckpointStatus, ErrorRecord, FileEntry, Index, now_rfc3339};
use crate::pool::{self, PoolConfig, Task};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scanner::{ScanCache, Scanner};
use crate::store::StateStore;
use crate::tar_stream;
use crate::transport::{Transport, TransportFactory};
use crate::transport::ftp::FtpTransportFactory;
use crate::transport::sftp::SftpTransportFactory;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub sync_id: String,
    pub files_transferred: u64,
    pub files_deleted: u64,
    pub bytes_transferred: u64,
    pub errors: Vec<(String, String)>,
    pub scan_partial: bool,
}

fn build_factory(config: &SyncConfig) -> Arc<dyn TransportFactory> {
    match config.transport {
        TransportKind::Sftp => Arc::new(SftpTransportFactory {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
        }),
        TransportKind::Ftp => Arc::new(FtpTransportFactory {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone().unwrap_or_default(),
        }),
    }
}

fn new_sync_id() -> String {
    format!("sync-{}", now_rfc3339().replace([':', '.', '+'], "-"))
}

/// Runs one full mirror pass to completion: scan, exclude, diff, delete,
/// transfer, checkpoint, commit (§4.7 phases 1-10).
pub fn run(config: &SyncConfig, sink: Arc<dyn ProgressSink>) -> Result<RunSummary, SyncError> {
    run_with_factory(config, build_factory(config), sink)
}

/// Same pipeline as [`run`], but takes an explicit transport factory instead
/// of building one from `config.transport`/`host`/`user` — the seam
/// integration tests use to drive the pipeline against a `MockTransport`
/// (§8.1) without a network.
pub fn run_with_factory(
    config: &SyncConfig,
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn ProgressSink>,
) -> Result<RunSummary, SyncError> {
    let start = Instant::now();
    let sync_id = new_sync_id();

    let store_path = config
        .state_store_path()
        .map_err(|e| SyncError::Fatal(format!("resolving state store path: {e}")))?;
    let mut store = StateStore::open(&store_path, 500)?;

    let mut transport: Box<dyn Transport> = factory.connect()?;

    let exclude = ExcludeSet::new(&config.exclude_patterns);

    let scanner = Scanner::new(config.use_incremental_scan, config.incremental_threshold_hours);
    let previous_index = store.get_all()?;
    let last_full_scan = store
        .statistics()?
        .last_sync
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| std::time::SystemTime::from(dt.with_timezone(&chrono::Utc)));
    let cache = ScanCache { last_full_scan, previous_index };

    sink.emit(ProgressEvent::ScanStarted { strategy: "auto" });
    let scan_outcome = scanner.scan(&mut transport, factory.as_ref(), &config.remote_root, &cache)?;
    sink.emit(ProgressEvent::ScanFinished {
        files_found: scan_outcome.stats.files_found,
        partial: !scan_outcome.complete,
    });

    let mut remote_index: Index = Index::new();
    for (path, entry) in scan_outcome.index.into_iter() {
        if exclude.is_excluded(&path) {
            continue;
        }
        remote_index.insert(path, entry);
    }

    let diff = store.diff(&remote_index)?;
    sink.emit(ProgressEvent::DiffComputed {
        to_download: diff.to_download.len(),
        to_delete: diff.to_delete.len(),
        total_bytes: diff.total_bytes,
    });

    let mut summary = RunSummary {
        sync_id: sync_id.clone(),
        scan_partial: !scan_outcome.complete,
        ..RunSummary::default()
    };

    if config.handle_deletions {
        for rel_path in &diff.to_delete {
            let local_path = config.local_root.join(rel_path);
            if !local_path.starts_with(&config.local_root) {
                continue;
            }
            match std::fs::remove_file(&local_path) {
                Ok(()) => {
                    summary.files_deleted += 1;
                    sink.emit(ProgressEvent::DeletionApplied { rel_path: rel_path.clone() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => summary.errors.push((rel_path.clone(), e.to_string())),
            }
        }
        store.delete(&diff.to_delete)?;
    }

    if diff.to_download.is_empty() {
        store.create_checkpoint(&Checkpoint {
            sync_id: sync_id.clone(),
            timestamp: now_rfc3339(),
            files_processed: 0,
            files_total: 0,
            bytes_transferred: 0,
            status: CheckpointStatus::Completed,
        })?;
        sink.emit(ProgressEvent::RunCompleted {
            files: 0,
            bytes: 0,
            elapsed: start.elapsed(),
            had_errors: false,
        });
        return Ok(summary);
    }

    let to_download: Vec<(String, u64)> = diff.to_download;

    let transferred = run_transfer_phase(
        config,
        &mut transport,
        factory.clone(),
        &remote_index,
        &to_download,
        sink.clone(),
    )?;

    let mut synced_entries: Vec<FileEntry> = Vec::with_capacity(transferred.succeeded.len());
    for (rel_path, actual_size) in &transferred.succeeded {
        if let Some(entry) = remote_index.get(rel_path) {
            let mut entry = entry.clone();
            // A smart rescan during verification may have found the remote
            // file at a different size than the scan observed; the Index
            // records what actually landed on disk, not the stale scan size.
            entry.size = *actual_size;
            synced_entries.push(entry);
        }
    }
    store.upsert_batch(synced_entries.iter())?;

    summary.files_transferred = transferred.succeeded.len() as u64;
    summary.bytes_transferred = transferred.bytes;
    for (rel_path, message) in &transferred.failed {
        store.log_error(&ErrorRecord {
            sync_id: sync_id.clone(),
            rel_path: rel_path.clone(),
            message: message.clone(),
            retry_count: config.max_retries,
            timestamp: now_rfc3339(),
        })?;
    }
    summary.errors.extend(transferred.failed);

    let status =
        if summary.errors.is_empty() { CheckpointStatus::Completed } else { CheckpointStatus::CompletedWithErrors };
    store.create_checkpoint(&Checkpoint {
        sync_id: sync_id.clone(),
        timestamp: now_rfc3339(),
        files_processed: summary.files_transferred + summary.files_deleted,
        files_total: to_download.len() as u64,
        bytes_transferred: summary.bytes_transferred,
        status,
    })?;

    sink.emit(ProgressEvent::RunCompleted {
        files: summary.files_transferred,
        bytes: summary.bytes_transferred,
        elapsed: start.elapsed(),
        had_errors: !summary.errors.is_empty(),
    });

    Ok(summary)
}

struct TransferOutcome {
    /// Rel path plus the byte count actually written to disk, which a smart
    /// rescan may have corrected away from the scan-time size.
    succeeded: Vec<(String, u64)>,
    failed: Vec<(String, String)>,
    bytes: u64,
}

/// Picks Tar vs Pool per §4.7 phase 8: tar only when the shell is available,
/// the backend can run `tar`, and the selection is large enough to amortize
/// one extra round trip.
fn run_transfer_phase(
    config: &SyncConfig,
    transport: &mut Box<dyn Transport>,
    factory: Arc<dyn TransportFactory>,
    remote_index: &Index,
    to_download: &[(String, u64)],
    sink: Arc<dyn ProgressSink>,
) -> Result<TransferOutcome, SyncError> {
    let mut remaining: Vec<String> = to_download.iter().map(|(p, _)| p.clone()).collect();
    let mut succeeded = Vec::new();
    let mut bytes = 0u64;

    if to_download.len() >= config.bulk_threshold
        && transport.has_shell()
        && tar_stream::is_available(transport.as_mut())
    {
        if let Ok(real_root) =
            crate::scanner::shell_find::resolve_real_root(transport.as_mut(), &config.remote_root)
        {
            let ratio = to_download.len() as f64 / remote_index.len().max(1) as f64;
            let full_tree = ratio >= 0.8;
            let tar_outcome = if full_tree {
                tar_stream::download_full_tree(transport.as_mut(), &real_root, &config.local_root, sink.as_ref())
            } else {
                tar_stream::download_selective(
                    transport.as_mut(),
                    &real_root,
                    &config.local_root,
                    &remaining,
                    sink.as_ref(),
                )
            };

            if let Ok(outcome) = tar_outcome {
                // Tar reports which members it actually wrote; anything not
                // in that set (declared fallback, or silently dropped by a
                // failed tier-2 batch) still needs the pool. Members it did
                // extract are re-verified against the expected size before
                // the committed Index is allowed to reference them.
                let extracted_set: std::collections::HashSet<&str> =
                    outcome.extracted_paths.iter().map(|s| s.as_str()).collect();
                let mut next_remaining = outcome.fallback_paths.clone();
                for (path, size) in to_download {
                    if extracted_set.contains(path.as_str()) {
                        let local_path = config.local_root.join(path);
                        let verified =
                            std::fs::metadata(&local_path).map(|m| m.len() == *size).unwrap_or(false);
                        if verified {
                            succeeded.push((path.clone(), *size));
                            bytes += *size;
                        } else if !next_remaining.contains(path) {
                            next_remaining.push(path.clone());
                        }
                    } else if !next_remaining.contains(path) {
                        next_remaining.push(path.clone());
                    }
                }
                remaining = next_remaining;
            }
        }
    }

    if remaining.is_empty() {
        return Ok(TransferOutcome { succeeded, failed: Vec::new(), bytes });
    }

    let tasks: Vec<Task> = remaining
        .iter()
        .filter_map(|rel_path| {
            let entry = remote_index.get(rel_path)?;
            Some(Task {
                rel_path: rel_path.clone(),
                remote_path: format!("{}/{}", config.remote_root.trim_end_matches('/'), rel_path),
                local_path: config.local_root.join(rel_path),
                size: entry.size,
                priority: Task::initial_priority(entry.size),
                retry_count: 0,
                checksum: entry.checksum.clone(),
            })
        })
        .collect();

    let pool_config = PoolConfig::from_sync_config(config);
    let (stats, successes, failures) = pool::run(&pool_config, factory, tasks, sink);

    bytes += stats.bytes_transferred;
    succeeded.extend(successes);

    Ok(TransferOutcome {
        succeeded,
        failed: failures.into_iter().map(|(p, e)| (p, e.to_string())).collect(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sync_id_has_no_path_hostile_characters() {
        let id = new_sync_id();
        assert!(id.starts_with("sync-"));
        assert!(!id.contains(':'));
    }
}
