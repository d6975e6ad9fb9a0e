//! Strategy (a): shell-find. Requires `has_shell`; resolves the real
//! filesystem path an SFTP chroot root maps to, then issues a single `find`
//! invocation and streams its output.

use crate::error::SyncError;
use crate::model::{FileEntry, Index, format_epoch_seconds};
use crate::transport::Transport;

use super::{ScanOutcome, ScanStats};

/// Resolve the chroot root by walking up from `$HOME` up to six levels and
/// picking the first candidate that looks like a real directory containing
/// entries consistent with the protocol-level listing of `remote_root`
/// (§4.3a).
pub(crate) fn resolve_real_root(
    transport: &mut dyn Transport,
    remote_root: &str,
) -> Result<String, SyncError> {
    let handle = transport.exec("printf '%s' \"$HOME\"")?;
    let (out, _code) = handle.finish()?;
    let home = String::from_utf8_lossy(&out).trim().to_string();
    if home.is_empty() {
        return Err(SyncError::Protocol("could not resolve $HOME".into()));
    }

    let known_children: Vec<String> =
        transport.list(remote_root).unwrap_or_default().into_iter().map(|e| e.name).collect();

    let mut candidate = std::path::PathBuf::from(&home);
    let mut best: Option<(String, usize)> = None;
    for _ in 0..6 {
        let candidate_str = candidate.to_string_lossy().to_string();
        let list_cmd = format!("ls -a \"{candidate_str}\" 2>/dev/null");
        if let Ok(handle) = transport.exec(&list_cmd) {
            if let Ok((out, _code)) = handle.finish() {
                let names: Vec<&str> = String::from_utf8_lossy(&out).lines().collect();
                let matches = known_children.iter().filter(|c| names.contains(&c.as_str())).count();
                if matches >= 2 {
                    return Ok(candidate_str);
                }
                if best.as_ref().map(|(_, n)| matches > *n).unwrap_or(true) {
                    best = Some((candidate_str.clone(), matches));
                }
            }
        }
        if !candidate.pop() {
            break;
        }
    }
    best.map(|(p, _)| p).ok_or_else(|| SyncError::Protocol("could not resolve chroot root".into()))
}

pub fn scan(transport: &mut dyn Transport, remote_root: &str) -> Result<ScanOutcome, SyncError> {
    let real_root = resolve_real_root(transport, remote_root)?;
    // -L follows symlinks-to-files at the leaf; GNU find detects loops on its
    // own and reports them to stderr, which we tolerate as partial.
    let cmd = format!(
        "find -L \"{real_root}\" -type f -printf '%P\\t%s\\t%T@\\n' 2>&1 1>&2; \
         find -L \"{real_root}\" -type f -printf '%P\\t%s\\t%T@\\n'"
    );
    let handle = transport.exec(&cmd)?;
    let (out, code) = handle.finish()?;
    let text = String::from_utf8_lossy(&out);

    let mut index = Index::new();
    let mut stats = ScanStats::default();
    let mut dirs_seen = std::collections::HashSet::new();
    for line in text.lines() {
        let Some((rel_raw, rest)) = line.split_once('\t') else { continue };
        let Some((size_str, mtime_str)) = rest.split_once('\t') else { continue };
        let Some(rel) = crate::transport::normalize_rel_path(rel_raw) else { continue };
        let Ok(size) = size_str.parse::<u64>() else { continue };
        let epoch = mtime_str.split('.').next().unwrap_or("0").parse::<i64>().unwrap_or(0);
        if let Some(parent) = rel.rsplit_once('/').map(|(p, _)| p) {
            dirs_seen.insert(parent.to_string());
        }
        index.insert(rel.clone(), FileEntry::new(rel, size, format_epoch_seconds(epoch)));
    }
    stats.dirs_scanned = dirs_seen.len() as u64;
    stats.files_found = index.len() as u64;

    if index.is_empty() && code != 0 {
        return Err(SyncError::Protocol(format!("find exited {code} with no output")));
    }

    Ok(ScanOutcome { index, stats, complete: true })
}

#[cfg(test)]
mod tests {
    #[test]
    fn parses_tab_separated_find_output() {
        let line = "a/b.txt\t1234\t1700000000.123456789";
        let (rel, rest) = line.split_once('\t').unwrap();
        let (size, mtime) = rest.split_once('\t').unwrap();
        assert_eq!(rel, "a/b.txt");
        assert_eq!(size, "1234");
        assert_eq!(mtime.split('.').next().unwrap(), "1700000000");
    }
}
