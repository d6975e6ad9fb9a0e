//! Strategy (c): full recursive. Depth-first traversal over `Transport::list`
//! with a single reconnect-and-retry on transient failure per directory
//! (§4.3c). Directories that still fail are skipped and counted; the overall
//! scan is marked incomplete so the caller's `last_full_scan` does not
//! advance.

use crate::error::SyncError;
use crate::model::{FileEntry, Index};
use crate::transport::{EntryKind, ListEntry, Transport, TransportFactory};

use super::{ScanOutcome, ScanStats};

pub fn entry_from_list(entry: &ListEntry, rel_path: &str) -> Option<FileEntry> {
    let rel = crate::transport::normalize_rel_path(rel_path)?;
    Some(FileEntry::new(rel, entry.size, entry.mtime.clone().unwrap_or_default()))
}

/// Recursive helper shared with the incremental strategy for scanning a
/// single subtree that the cache did not already cover.
pub fn scan_subtree(
    transport: &mut dyn Transport,
    remote_dir: &str,
    rel_prefix: &str,
    index: &mut Index,
    stats: &mut ScanStats,
    depth: u32,
) -> Result<(), SyncError> {
    let children = transport.list(remote_dir)?;
    stats.dirs_scanned += 1;
    for child in children {
        if child.kind == EntryKind::Link {
            continue;
        }
        let rel =
            if rel_prefix.is_empty() { child.name.clone() } else { format!("{rel_prefix}/{}", child.name) };
        match child.kind {
            EntryKind::File => {
                if let Some(fe) = entry_from_list(&child, &rel) {
                    index.insert(fe.rel_path.clone(), fe);
                    stats.files_found += 1;
                }
            }
            EntryKind::Dir => {
                let full = format!("{}/{}", remote_dir.trim_end_matches('/'), child.name);
                scan_subtree(transport, &full, &rel, index, stats, depth + 1)?;
            }
            EntryKind::Link => {}
        }
    }
    Ok(())
}

/// List one directory, attempting exactly one reconnect-and-retry when the
/// failure looks transient. On reconnect, `*transport` is replaced with the
/// freshly connected backend so subsequent directories reuse it.
fn list_with_reconnect(
    transport: &mut Box<dyn Transport>,
    factory: &dyn TransportFactory,
    dir: &str,
    stats: &mut ScanStats,
) -> Result<Vec<ListEntry>, SyncError> {
    match transport.list(dir) {
        Ok(children) => Ok(children),
        Err(e) if e.is_retriable_pre_transfer() => {
            let mut fresh = factory.connect()?;
            stats.reconnections += 1;
            let result = fresh.list(dir);
            *transport = fresh;
            result
        }
        Err(e) => Err(e),
    }
}

pub fn scan(
    transport: &mut Box<dyn Transport>,
    factory: &dyn TransportFactory,
    remote_root: &str,
) -> Result<ScanOutcome, SyncError> {
    let mut index = Index::new();
    let mut stats = ScanStats::default();
    let mut complete = true;

    let mut stack: Vec<(String, String)> = vec![(remote_root.to_string(), String::new())];
    while let Some((dir, rel_prefix)) = stack.pop() {
        match list_with_reconnect(transport, factory, &dir, &mut stats) {
            Ok(children) => {
                stats.dirs_scanned += 1;
                for child in children {
                    if child.kind == EntryKind::Link {
                        continue;
                    }
                    let rel = if rel_prefix.is_empty() {
                        child.name.clone()
                    } else {
                        format!("{rel_prefix}/{}", child.name)
                    };
                    match child.kind {
                        EntryKind::File => {
                            if let Some(fe) = entry_from_list(&child, &rel) {
                                index.insert(fe.rel_path.clone(), fe);
                                stats.files_found += 1;
                            }
                        }
                        EntryKind::Dir => {
                            let full = format!("{}/{}", dir.trim_end_matches('/'), child.name);
                            stack.push((full, rel));
                        }
                        EntryKind::Link => {}
                    }
                }
            }
            Err(_) => {
                stats.scan_errors += 1;
                complete = false;
            }
        }
    }

    Ok(ScanOutcome { index, stats, complete })
}
