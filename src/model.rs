//! Shared data types for the mirror engine: the remote/local index entry,
//! checkpoints, and error records persisted by the state store.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A checksum tag plus its hex digest, as recorded for a [`FileEntry`] or
/// produced by the integrity verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "md5" => Some(HashAlgorithm::Md5),
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// One entry in the remote (or stored) index: a relative path plus the
/// metadata needed to decide whether a local copy is up to date.
///
/// `rel_path` is always forward-slash normalized with no leading `./` and no
/// `.`/`..` components — callers must normalize before constructing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub rel_path: String,
    pub size: u64,
    /// Canonical 14-digit `YYYYMMDDHHMMSS` UTC string when derived from a
    /// timestamp, else the server-provided string verbatim.
    pub modify: String,
    pub checksum: Option<Checksum>,
}

impl FileEntry {
    pub fn new(rel_path: impl Into<String>, size: u64, modify: impl Into<String>) -> Self {
        Self { rel_path: rel_path.into(), size, modify: modify.into(), checksum: None }
    }

    /// Two entries are considered equal for diff purposes iff their sizes and
    /// modify strings match, or — when both carry a checksum — the checksums
    /// match instead.
    pub fn matches(&self, other: &FileEntry) -> bool {
        if let (Some(a), Some(b)) = (&self.checksum, &other.checksum) {
            return a == b;
        }
        self.size == other.size && self.modify == other.modify
    }
}

/// Format a Unix epoch-seconds timestamp as the canonical 14-digit string.
pub fn format_epoch_seconds(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .unwrap_or_else(Utc::now)
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// A full remote/stored index, keyed by relative path. Ordered so streaming
/// diffs and tests produce deterministic output.
pub type Index = BTreeMap<String, FileEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    InProgress,
    Completed,
    CompletedWithErrors,
    Partial,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::CompletedWithErrors => "completed_with_errors",
            CheckpointStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => CheckpointStatus::Completed,
            "completed_with_errors" => CheckpointStatus::CompletedWithErrors,
            "partial" => CheckpointStatus::Partial,
            _ => CheckpointStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub sync_id: String,
    pub timestamp: String,
    pub files_processed: u64,
    pub files_total: u64,
    pub bytes_transferred: u64,
    pub status: CheckpointStatus,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub sync_id: String,
    pub rel_path: String,
    pub message: String,
    pub retry_count: u32,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub count: u64,
    pub total_bytes: u64,
    pub last_sync: Option<String>,
    pub store_size_on_disk: u64,
}

/// Result of diffing a remote index against the store.
#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub to_download: Vec<(String, u64)>,
    pub to_delete: Vec<String>,
    pub total_bytes: u64,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
