//! Strategy (b): incremental. Trusts cached subdirectories and only
//! refreshes the top level plus any subdirectory unknown to the cache
//! (§4.3b). Trades completeness for latency; the orchestrator only chooses
//! this strategy when the cache is fresh.

use crate::error::SyncError;
use crate::model::Index;
use crate::transport::{EntryKind, Transport};

use super::full_recursive::scan_subtree;
use super::{ScanOutcome, ScanStats};

pub fn scan(
    transport: &mut dyn Transport,
    remote_root: &str,
    previous: &Index,
) -> Result<ScanOutcome, SyncError> {
    let top = transport.list(remote_root)?;
    let mut index = Index::new();
    let mut stats = ScanStats { dirs_scanned: 1, ..ScanStats::default() };

    let known_dirs: std::collections::HashSet<&str> = previous
        .keys()
        .filter_map(|p| p.split('/').next())
        .collect();

    for entry in top {
        if entry.kind == EntryKind::Link {
            continue;
        }
        match entry.kind {
            EntryKind::File => {
                if let Some(fe) = crate::scanner::full_recursive::entry_from_list(&entry, &entry.name) {
                    index.insert(fe.rel_path.clone(), fe);
                    stats.files_found += 1;
                }
            }
            EntryKind::Dir => {
                if known_dirs.contains(entry.name.as_str()) {
                    // Trust the cache: copy every previously known entry under
                    // this top-level directory without re-listing it.
                    let prefix = format!("{}/", entry.name);
                    for (path, fe) in previous.iter().filter(|(p, _)| p.starts_with(&prefix)) {
                        index.insert(path.clone(), fe.clone());
                    }
                    stats.cache_hits += 1;
                } else {
                    let sub_root = format!("{}/{}", remote_root.trim_end_matches('/'), entry.name);
                    let mut sub_stats = ScanStats::default();
                    scan_subtree(transport, &sub_root, &entry.name, &mut index, &mut sub_stats, 1)?;
                    stats.dirs_scanned += sub_stats.dirs_scanned;
                    stats.files_found += sub_stats.files_found;
                    stats.scan_errors += sub_stats.scan_errors;
                }
            }
            EntryKind::Link => {}
        }
    }

    Ok(ScanOutcome { index, stats, complete: true })
}
