//! Integrity Verifier (C4), grounded exactly on `modules/checksum_utils.py`:
//! hash-then-size-with-tolerance, remote hash probed once via `command -v`
//! and cached, smart rescan on size mismatch to tell a changed-in-flight
//! remote file apart from a genuine corruption.

use std::io::Read;
use std::sync::Mutex;

use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::SyncError;
use crate::model::HashAlgorithm;
use crate::transport::Transport;

pub struct VerifyOutcome {
    pub ok: bool,
    pub message: String,
    /// Set when rule 4 (smart rescan) detected the remote file changed size
    /// between scan and transfer; the caller should record this size instead
    /// of treating the mismatch as corruption.
    pub corrected_size: Option<u64>,
}

/// Caches, per transport session, whether a remote hash utility for a given
/// algorithm was found — avoids re-probing `command -v` for every file.
#[derive(Default)]
pub struct RemoteHashProbeCache {
    found: Mutex<std::collections::HashMap<&'static str, Option<String>>>,
}

impl RemoteHashProbeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn command_for(&self, transport: &mut dyn Transport, algo: HashAlgorithm) -> Option<String> {
        let key = algo.as_str();
        if let Some(cached) = self.found.lock().unwrap().get(key) {
            return cached.clone();
        }
        let candidate = format!("{key}sum");
        let probe = format!("command -v {candidate}");
        let found = match transport.exec(&probe) {
            Ok(handle) => match handle.finish() {
                Ok((out, _code)) => {
                    let text = String::from_utf8_lossy(&out);
                    if text.trim().is_empty() { None } else { Some(candidate.clone()) }
                }
                Err(_) => None,
            },
            Err(_) => None,
        };
        self.found.lock().unwrap().insert(key, found.clone());
        found
    }
}

pub fn local_hash(path: &std::path::Path, algorithm: HashAlgorithm) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 65536];
    let hex = match algorithm {
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            format!("{:x}", hasher.finalize())
        }
    };
    Ok(hex)
}

/// `<algo>sum "<path>"` output parsed as hex digest, optionally followed by
/// whitespace and a filename (§6 on-the-wire expectation).
fn remote_hash(
    transport: &mut dyn Transport,
    probe: &RemoteHashProbeCache,
    remote_path: &str,
    algorithm: HashAlgorithm,
) -> Option<String> {
    let cmd = probe.command_for(transport, algorithm)?;
    let handle = transport.exec(&format!("{cmd} \"{remote_path}\"")).ok()?;
    let (out, _code) = handle.finish().ok()?;
    let text = String::from_utf8_lossy(&out);
    let first_line = text.lines().next()?.trim();
    first_line.split_whitespace().next().map(|s| s.to_string())
}

pub fn verify(
    transport: &mut dyn Transport,
    probe: &RemoteHashProbeCache,
    local_path: &std::path::Path,
    remote_path: &str,
    expected_size: u64,
    expected_hash: Option<(&str, HashAlgorithm)>,
) -> VerifyOutcome {
    if !local_path.exists() {
        return VerifyOutcome { ok: false, message: "file doesn't exist".into(), corrected_size: None };
    }
    let local_size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);

    if let Some((expected, algo)) = expected_hash {
        match local_hash(local_path, algo) {
            Ok(hash) if hash.eq_ignore_ascii_case(expected) => {
                return VerifyOutcome {
                    ok: true,
                    message: format!("hash verified ({})", algo.as_str()),
                    corrected_size: None,
                };
            }
            Ok(hash) => {
                return VerifyOutcome {
                    ok: false,
                    message: format!("hash mismatch: expected {expected}, got {hash}"),
                    corrected_size: None,
                };
            }
            Err(_) => {}
        }
    }

    if transport.has_shell() {
        if let Some(remote_digest) = remote_hash(transport, probe, remote_path, HashAlgorithm::Md5) {
            if let Ok(local_digest) = local_hash(local_path, HashAlgorithm::Md5) {
                if local_digest.eq_ignore_ascii_case(&remote_digest) {
                    return VerifyOutcome {
                        ok: true,
                        message: "remote hash verified (md5)".into(),
                        corrected_size: None,
                    };
                }
                return VerifyOutcome {
                    ok: false,
                    message: format!("remote hash mismatch: remote={remote_digest}, local={local_digest}"),
                    corrected_size: None,
                };
            }
        }
    }

    let tolerance = ((expected_size as f64 * 0.001) as u64).max(10);
    let delta = local_size.abs_diff(expected_size);
    if delta <= tolerance {
        return VerifyOutcome {
            ok: true,
            message: format!("size verified (tolerance: {tolerance} bytes)"),
            corrected_size: None,
        };
    }

    // Rule 4: smart rescan — the remote file may have changed since it was
    // scanned. Re-stat; if the remote size also moved, it's a legitimate
    // change-in-flight rather than corruption.
    if let Ok(Some(fresh)) = transport.stat(remote_path) {
        if fresh.size != expected_size {
            return VerifyOutcome {
                ok: true,
                message: "remote file changed between scan and transfer".into(),
                corrected_size: Some(fresh.size),
            };
        }
    }

    VerifyOutcome {
        ok: false,
        message: format!("size mismatch: expected {expected_size}, got {local_size} (tolerance: {tolerance})"),
        corrected_size: None,
    }
}
