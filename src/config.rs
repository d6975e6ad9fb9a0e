//! Configuration surface for one sync run (§6). A single `SyncConfig` value
//! is constructed explicitly and passed into the orchestrator; there is no
//! process-wide singleton the way the CLI front-end used a global `Config`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::HashAlgorithm;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Sftp,
    Ftp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub remote_root: String,
    pub local_root: PathBuf,

    pub workers: usize,
    pub max_retries: u32,
    pub verify_integrity: bool,
    pub use_hash_verification: bool,
    pub hash_algorithm: HashAlgorithm,

    pub use_incremental_scan: bool,
    pub incremental_threshold_hours: u32,

    pub checkpoint_interval: u64,
    pub exclude_patterns: Vec<String>,
    pub handle_deletions: bool,
    pub bulk_threshold: usize,

    #[serde(skip)]
    pub state_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Sftp,
            host: String::new(),
            port: 22,
            user: String::new(),
            password: None,
            remote_root: "/".to_string(),
            local_root: PathBuf::from("."),
            workers: 4,
            max_retries: 3,
            verify_integrity: true,
            use_hash_verification: false,
            hash_algorithm: HashAlgorithm::Md5,
            use_incremental_scan: true,
            incremental_threshold_hours: 24,
            checkpoint_interval: 1000,
            exclude_patterns: default_exclude_patterns(),
            handle_deletions: true,
            bulk_threshold: 500,
        }
    }
}

/// The exclusion tokens named in §6, recognized out of the box; callers may
/// extend or replace this list.
pub fn default_exclude_patterns() -> Vec<String> {
    [
        "*.log", "*.tmp", "*.pyc", ".git/", ".svn/", "node_modules/", "__pycache__/", "cache/",
        "tmp/", "temp/", ".DS_Store", "Thumbs.db", ".idea/", ".vscode/", ".sessions/", "sessions/",
        "sess_",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl SyncConfig {
    /// Workers are capped lower for SFTP because each worker owns a full SSH
    /// session, which is heavier than an FTP control connection.
    pub fn effective_workers(&self) -> usize {
        match self.transport {
            TransportKind::Sftp => self.workers.min(5).max(1),
            TransportKind::Ftp => self.workers.max(1),
        }
    }

    pub fn stagger_delay(&self) -> std::time::Duration {
        match self.transport {
            TransportKind::Sftp => std::time::Duration::from_millis(500),
            TransportKind::Ftp => std::time::Duration::from_millis(100),
        }
    }

    /// Derive the on-disk state store path for this project: the remote
    /// project identity (host + remote root, slashes replaced) under the
    /// configured state directory, falling back to `$HOME/.remote-mirror`.
    pub fn state_store_path(&self) -> anyhow::Result<PathBuf> {
        let base = match &self.state_dir {
            Some(p) => p.clone(),
            None => {
                let home = dirs::home_dir()
                    .ok_or_else(|| crate::error::SyncError::Fatal("no home dir".into()))?;
                home.join(".remote-mirror")
            }
        };
        std::fs::create_dir_all(&base)?;
        let slug = format!("{}{}", self.host, self.remote_root)
            .replace(['/', '\\', ':'], "_")
            .trim_matches('_')
            .to_string();
        Ok(base.join(format!("{slug}.db")))
    }
}
