//! Structured error taxonomy for the mirror engine. Each transport backend
//! wraps its own error type into this enum exactly once, at the boundary —
//! nothing downstream matches on error message substrings.

/// Repository-wide structured error for a single sync run or operation.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Connection/channel died or an operation timed out; recoverable by
    /// reconnecting.
    TransientTransport(String),
    /// Local file content does not match the expected remote content after
    /// every verification tier has been exhausted.
    IntegrityMismatch { rel_path: String, detail: String },
    PathNotFound(String),
    PermissionDenied(String),
    /// No pool completion observed within the configured stall timeout.
    Stalled { last_progress_secs: u64 },
    /// The scanner could not enumerate every directory; the resulting index
    /// is usable but not guaranteed complete.
    ScanPartial { directories_skipped: u32 },
    /// Unrecoverable precondition failure; the run must abort before any
    /// transfer begins.
    Fatal(String),
    /// Malformed response from the remote server that the backend could not
    /// parse (garbled listing, unexpected reply code, etc).
    Protocol(String),
    /// The transport backend does not support the requested capability
    /// (e.g. `exec` on the FTP backend).
    Unsupported(&'static str),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use SyncError::*;
        match self {
            TransientTransport(msg) => write!(f, "transient transport error: {msg}"),
            IntegrityMismatch { rel_path, detail } => {
                write!(f, "integrity mismatch for {rel_path}: {detail}")
            }
            PathNotFound(p) => write!(f, "remote path not found: {p}"),
            PermissionDenied(p) => write!(f, "permission denied: {p}"),
            Stalled { last_progress_secs } => {
                write!(f, "no progress for {last_progress_secs}s, transfer stalled")
            }
            ScanPartial { directories_skipped } => {
                write!(f, "scan incomplete, {directories_skipped} directories skipped")
            }
            Fatal(msg) => write!(f, "fatal: {msg}"),
            Protocol(msg) => write!(f, "protocol error: {msg}"),
            Unsupported(what) => write!(f, "unsupported on this transport: {what}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl SyncError {
    /// Whether this error is worth retrying before a transfer has begun
    /// (connecting, stat-ing, listing). Conservative: only transport-layer
    /// failures are retriable, never taxonomy/validation failures.
    pub fn is_retriable_pre_transfer(&self) -> bool {
        matches!(self, SyncError::TransientTransport(_))
    }

    /// Whether this error is worth retrying once a transfer is in flight
    /// (reading, writing, verifying).
    pub fn is_retriable_during_transfer(&self) -> bool {
        matches!(self, SyncError::TransientTransport(_) | SyncError::IntegrityMismatch { .. })
    }
}

/// Known substrings that mark a transport failure as connection loss rather
/// than a logical error — used only at the transport boundary when wrapping
/// a backend library's raw error, never by core logic.
const CONNECTION_LOSS_MARKERS: &[&str] = &[
    "broken pipe",
    "reset by peer",
    "socket closed",
    "timed out",
    "channel closed",
    "eof",
    "transport",
    "connection refused",
    "not connected",
];

pub fn looks_like_connection_loss(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    CONNECTION_LOSS_MARKERS.iter().any(|m| lower.contains(m))
}
