//! Tar Streamer (C6): single-shell bulk download via a server-side `tar`,
//! bypassing per-file SFTP overhead (§4.6). Requires `has_shell`.
//!
//! Selective mode has three fallback tiers; this module implements the
//! first two (server-side NUL-separated file list, then argv batches) and
//! returns the remainder for the caller to hand to the Transfer Pool for
//! tier 3.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::error::SyncError;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::transport::Transport;

#[derive(Debug, Default)]
pub struct TarOutcome {
    pub extracted: u64,
    /// Relative paths this call actually wrote to local disk. The caller
    /// still re-verifies each one's size before trusting it (a member can be
    /// written here and yet be truncated if the remote tar stream was cut
    /// short without a nonzero exit code).
    pub extracted_paths: Vec<String>,
    /// Paths the caller must still fetch via the Transfer Pool: either tier-3
    /// fallback members, or members a batch dropped silently.
    pub fallback_paths: Vec<String>,
}

/// True iff `tar` resolves on the remote shell.
pub fn is_available(transport: &mut dyn Transport) -> bool {
    if !transport.has_shell() {
        return false;
    }
    match transport.exec("command -v tar") {
        Ok(handle) => match handle.finish() {
            Ok((out, _code)) => !String::from_utf8_lossy(&out).trim().is_empty(),
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// Probes for a writable temp directory on the remote shell, for tier 1.
fn find_writable_tmp(transport: &mut dyn Transport) -> Option<String> {
    for candidate in ["/tmp", "/var/tmp", "."] {
        let probe = format!(
            "f=\"{candidate}/.mirror_probe.$$\"; (: > \"$f\") 2>/dev/null && rm -f \"$f\" && echo ok"
        );
        if let Ok(handle) = transport.exec(&probe) {
            if let Ok((out, _code)) = handle.finish() {
                if String::from_utf8_lossy(&out).trim() == "ok" {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}

/// Full-tree mode: archive the entire resolved real root, no selection list.
pub fn download_full_tree(
    transport: &mut dyn Transport,
    real_root: &str,
    local_root: &Path,
    sink: &dyn ProgressSink,
) -> Result<TarOutcome, SyncError> {
    let cmd = format!("tar -C \"{real_root}\" -cf - --ignore-failed-read -h .");
    stream_extract(transport, &cmd, local_root, sink)
}

/// Selective mode, tier 1: write the relative path list NUL-separated to a
/// remote temp file, then `--files-from=FILE --null` (§4.6, resolving the
/// Open Question in favor of NUL over newline separation).
fn tier1_server_file_list(
    transport: &mut dyn Transport,
    tmp_dir: &str,
    real_root: &str,
    rel_paths: &[String],
) -> Result<String, SyncError> {
    let list_path = format!("{tmp_dir}/.mirror_selection.{}", std::process::id());
    let mut handle = transport.exec(&format!("cat > \"{list_path}\""))?;
    for p in rel_paths {
        handle.write_stdin(p.as_bytes())?;
        handle.write_stdin(b"\0")?;
    }
    handle.close_stdin()?;
    handle.finish()?;

    let cmd = format!(
        "tar -C \"{real_root}\" -cf - --null --files-from=\"{list_path}\" --ignore-failed-read -h; \
         rm -f \"{list_path}\""
    );
    Ok(cmd)
}

/// Selective mode, tier 2: batch relative paths directly as shell-escaped
/// tar arguments, staying under a safe argv length.
fn tier2_batches(real_root: &str, rel_paths: &[String]) -> Vec<String> {
    const MAX_ARGV_BYTES: usize = 100 * 1024;
    let mut batches = Vec::new();
    let mut current = String::new();
    for p in rel_paths {
        let escaped = shell_escape::escape(p.into());
        if current.len() + escaped.len() + 1 > MAX_ARGV_BYTES && !current.is_empty() {
            batches.push(format!("tar -C \"{real_root}\" -cf - --ignore-failed-read -h {current}"));
            current.clear();
        }
        current.push_str(&escaped);
        current.push(' ');
    }
    if !current.is_empty() {
        batches.push(format!("tar -C \"{real_root}\" -cf - --ignore-failed-read -h {current}"));
    }
    batches
}

pub fn download_selective(
    transport: &mut dyn Transport,
    real_root: &str,
    local_root: &Path,
    rel_paths: &[String],
    sink: &dyn ProgressSink,
) -> Result<TarOutcome, SyncError> {
    if let Some(tmp_dir) = find_writable_tmp(transport) {
        let cmd = tier1_server_file_list(transport, &tmp_dir, real_root, rel_paths)?;
        if let Ok(outcome) = stream_extract(transport, &cmd, local_root, sink) {
            if outcome.extracted > 0 || rel_paths.is_empty() {
                return Ok(outcome);
            }
        }
    }

    // Tier 2: argv batches.
    let mut total = TarOutcome::default();
    let mut any_batch_succeeded = false;
    for batch_cmd in tier2_batches(real_root, rel_paths) {
        match stream_extract(transport, &batch_cmd, local_root, sink) {
            Ok(outcome) => {
                total.extracted += outcome.extracted;
                total.extracted_paths.extend(outcome.extracted_paths);
                any_batch_succeeded = true;
            }
            Err(_) => {
                // This batch falls through to tier 3; its members are
                // unknown individually so the caller re-verifies the whole
                // selection and hands mismatches to the pool.
            }
        }
    }
    if any_batch_succeeded {
        let extracted_set: std::collections::HashSet<&str> =
            total.extracted_paths.iter().map(|s| s.as_str()).collect();
        total.fallback_paths =
            rel_paths.iter().filter(|p| !extracted_set.contains(p.as_str())).cloned().collect();
        return Ok(total);
    }

    // Tier 3: delegate everything to the caller's Transfer Pool.
    Ok(TarOutcome { extracted: 0, extracted_paths: Vec::new(), fallback_paths: rel_paths.to_vec() })
}

/// Known-benign stderr noise the original backend demotes to debug; see
/// §4.6.
fn is_benign_tar_stderr(line: &str) -> bool {
    let l = line.to_lowercase();
    l.contains("removing leading")
        || l.contains("file changed as we read it")
        || l.contains("cannot stat")
        || l.contains("file removed before we read it")
}

fn stream_extract(
    transport: &mut dyn Transport,
    cmd: &str,
    local_root: &Path,
    sink: &dyn ProgressSink,
) -> Result<TarOutcome, SyncError> {
    let mut handle = transport.exec(cmd)?;
    let gz = cmd.contains(".tar.gz") || cmd.contains("-z");
    let mut extracted_paths: Vec<String> = Vec::new();
    let mut dir_cache = std::collections::HashSet::new();

    {
        let reader = handle.reader();
        if gz {
            let decoder = GzDecoder::new(reader);
            extracted_paths = extract_members(decoder, local_root, &mut dir_cache, sink)?;
        } else {
            extracted_paths = extract_members(reader, local_root, &mut dir_cache, sink)?;
        }
    }

    let (stderr_tail, code) = handle.finish()?;
    let stderr_text = String::from_utf8_lossy(&stderr_tail);
    for line in stderr_text.lines() {
        if !is_benign_tar_stderr(line) {
            tracing::warn!("tar: {line}");
        }
    }

    if extracted_paths.is_empty() && code != 0 {
        return Err(SyncError::Protocol(format!("tar exited {code} with no members extracted")));
    }

    Ok(TarOutcome {
        extracted: extracted_paths.len() as u64,
        extracted_paths,
        fallback_paths: Vec::new(),
    })
}

/// Writes each regular-file member to local disk, returning the relative
/// paths actually written. The caller still verifies size against the
/// expected Index entry; this only records what tar handed over.
fn extract_members(
    reader: impl std::io::Read,
    local_root: &Path,
    dir_cache: &mut std::collections::HashSet<PathBuf>,
    sink: &dyn ProgressSink,
) -> Result<Vec<String>, SyncError> {
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();
    let entries = archive.entries().map_err(|e| SyncError::Protocol(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let raw_path = entry.path().map_err(|e| SyncError::Protocol(e.to_string()))?.to_path_buf();
        let rel_str = raw_path.to_string_lossy();
        let Some(rel) = crate::transport::normalize_rel_path(&rel_str) else { continue };
        let dest = local_root.join(&rel);
        if let Some(parent) = dest.parent() {
            if !dir_cache.contains(parent) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::TransientTransport(e.to_string()))?;
                dir_cache.insert(parent.to_path_buf());
            }
        }
        let tmp = dest.with_file_name(format!(
            "{}.part",
            dest.file_name().and_then(|n| n.to_str()).unwrap_or("extract")
        ));
        {
            let mut out = std::fs::File::create(&tmp)
                .map_err(|e| SyncError::TransientTransport(e.to_string()))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| SyncError::TransientTransport(e.to_string()))?;
            out.sync_all().map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        }
        std::fs::rename(&tmp, &dest).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        if written.len() % 100 == 0 {
            sink.emit(ProgressEvent::TransferCompleted { rel_path: rel.clone() });
        }
        written.push(rel);
    }
    Ok(written)
}
