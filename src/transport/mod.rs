//! Transport abstraction (C1): one capability interface over FTP and SFTP so
//! the scanner, verifier, pool, and tar streamer never depend on `ssh2` or
//! `suppaftp` directly — mirrors the seam the teacher draws with
//! `transfer::sftp_like::SftpLike`, generalized to cover listing and shell
//! exec as well as file reads.

pub mod ftp;
pub mod sftp;

use std::io::Read;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Link,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Server-provided mtime string, verbatim (epoch seconds as text for the
    /// shell-find strategy, or whatever the listing format yields).
    pub mtime: Option<String>,
}

/// A started shell command: write-end of stdin, and the collected
/// stdout/stderr/exit-code once the command finishes.
pub trait ExecHandle: Send {
    fn write_stdin(&mut self, data: &[u8]) -> Result<(), SyncError>;
    fn close_stdin(&mut self) -> Result<(), SyncError>;
    fn read_stdout(&mut self) -> Result<Vec<u8>, SyncError>;
    fn read_stdout_to(&mut self, sink: &mut dyn std::io::Write) -> Result<(), SyncError>;
    /// Live handle onto stdout for streaming consumers (e.g. tar
    /// extraction) that must not buffer the whole stream first.
    fn reader(&mut self) -> &mut dyn Read;
    fn finish(self: Box<Self>) -> Result<(Vec<u8>, i32), SyncError>;
}

/// Unified capability interface over FTP and SFTP (§4.1).
pub trait Transport: Send {
    /// True iff `exec` is usable on this backend.
    fn has_shell(&self) -> bool;

    /// List one directory's immediate children. Implementations must hide
    /// `.`/`..` and mark symlinks as `EntryKind::Link` rather than silently
    /// resolving them.
    fn list(&mut self, dir: &str) -> Result<Vec<ListEntry>, SyncError>;

    /// Stat a single path; `None` means the path does not exist.
    fn stat(&mut self, path: &str) -> Result<Option<ListEntry>, SyncError>;

    /// Open a remote file for streaming read.
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError>;

    /// Cheap liveness probe on the control channel.
    fn noop(&mut self) -> Result<(), SyncError>;

    /// Run a shell command, returning a handle over its stdin/stdout. Only
    /// meaningful when `has_shell()` is true.
    fn exec(&mut self, cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        let _ = cmd;
        Err(SyncError::Unsupported("exec"))
    }

    fn mtime(&mut self, path: &str) -> Result<Option<String>, SyncError> {
        Ok(self.stat(path)?.and_then(|e| e.mtime))
    }
}

/// Factory for reconnecting a dropped transport, used by the scanner's
/// single-reconnect-then-skip policy and by pool workers.
pub trait TransportFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError>;
}

pub fn normalize_rel_path(raw: &str) -> Option<String> {
    let mut parts = Vec::new();
    for comp in raw.split('/') {
        match comp {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_leading_dot_and_slashes() {
        assert_eq!(normalize_rel_path("./a/b"), Some("a/b".to_string()));
        assert_eq!(normalize_rel_path("/a//b/"), Some("a/b".to_string()));
    }

    #[test]
    fn normalize_rejects_parent_traversal() {
        assert_eq!(normalize_rel_path("a/../b"), None);
        assert_eq!(normalize_rel_path("../escape"), None);
    }
}
