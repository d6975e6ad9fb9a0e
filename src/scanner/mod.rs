//! Remote Scanner (C3): produces the current remote index via the cheapest
//! strategy the transport supports (§4.3).

pub mod full_recursive;
pub mod incremental;
pub mod shell_find;

use std::time::{Duration, SystemTime};

use crate::error::SyncError;
use crate::model::Index;
use crate::transport::{Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ShellFind,
    Incremental,
    FullRecursive,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::ShellFind => "shell_find",
            Strategy::Incremental => "incremental",
            Strategy::FullRecursive => "full_recursive",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub dirs_scanned: u64,
    pub files_found: u64,
    pub cache_hits: u64,
    pub reconnections: u32,
    pub scan_errors: u32,
    pub strategy_used: Option<&'static str>,
}

pub struct ScanOutcome {
    pub index: Index,
    pub stats: ScanStats,
    /// False when every directory was fully enumerated; a caller must not
    /// advance `last_full_scan` when this is false (§4.3c).
    pub complete: bool,
}

/// Prior scan bookkeeping the orchestrator carries between runs to decide
/// whether the incremental strategy is eligible.
pub struct ScanCache {
    pub last_full_scan: Option<SystemTime>,
    pub previous_index: Index,
}

pub struct Scanner {
    pub use_incremental: bool,
    pub incremental_threshold: Duration,
}

impl Scanner {
    pub fn new(use_incremental: bool, incremental_threshold_hours: u32) -> Self {
        Self {
            use_incremental,
            incremental_threshold: Duration::from_secs(incremental_threshold_hours as u64 * 3600),
        }
    }

    /// Smart strategy selection (§4.3): shell-find when available, else
    /// incremental when the cache is fresh, else full recursive.
    pub fn scan(
        &self,
        transport: &mut Box<dyn Transport>,
        factory: &dyn TransportFactory,
        remote_root: &str,
        cache: &ScanCache,
    ) -> Result<ScanOutcome, SyncError> {
        if transport.has_shell() {
            match shell_find::scan(&mut **transport, remote_root) {
                Ok(mut outcome) => {
                    outcome.stats.strategy_used = Some(Strategy::ShellFind.as_str());
                    return Ok(outcome);
                }
                Err(_) => {
                    // Strategy failure: fall through to incremental/full.
                }
            }
        }

        let cache_is_fresh = cache
            .last_full_scan
            .and_then(|t| t.elapsed().ok())
            .map(|age| age <= self.incremental_threshold)
            .unwrap_or(false);

        if self.use_incremental && cache_is_fresh && !cache.previous_index.is_empty() {
            let mut outcome =
                incremental::scan(&mut **transport, remote_root, &cache.previous_index)?;
            outcome.stats.strategy_used = Some(Strategy::Incremental.as_str());
            return Ok(outcome);
        }

        let mut outcome = full_recursive::scan(transport, factory, remote_root)?;
        outcome.stats.strategy_used = Some(Strategy::FullRecursive.as_str());
        Ok(outcome)
    }
}
