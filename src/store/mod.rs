//! State Store (C2): durable path→FileEntry index plus checkpoints and an
//! error log, backed by SQLite. Schema grounded on
//! `modules/state_manager.py`; `rusqlite` usage pattern grounded on
//! `server::ServerCollection`'s `CREATE TABLE IF NOT EXISTS` + batched
//! `INSERT OR REPLACE` style in the teacher crate (see §3.1 of the spec).

use rusqlite::{Connection, params};

use crate::error::SyncError;
use crate::model::{
    Checkpoint, CheckpointStatus, DiffOutcome, ErrorRecord, FileEntry, HashAlgorithm, Index,
    StoreStatistics, now_rfc3339,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS file_state (
    rel_path TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    modify TEXT NOT NULL,
    checksum_algo TEXT,
    checksum_hex TEXT,
    last_sync TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    files_processed INTEGER NOT NULL,
    files_total INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_sync_id ON sync_checkpoints(sync_id);
CREATE TABLE IF NOT EXISTS sync_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sync_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    rel_path TEXT NOT NULL,
    error_message TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_errors_sync_id ON sync_errors(sync_id);
";

pub struct StateStore {
    conn: Connection,
    batch_size: usize,
}

fn wrap(e: rusqlite::Error) -> SyncError {
    SyncError::Fatal(format!("state store: {e}"))
}

impl StateStore {
    pub fn open(path: &std::path::Path, batch_size: usize) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(wrap)?;
        conn.execute_batch(SCHEMA).map_err(wrap)?;
        Ok(Self { conn, batch_size: batch_size.max(1) })
    }

    pub fn open_in_memory(batch_size: usize) -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(wrap)?;
        conn.execute_batch(SCHEMA).map_err(wrap)?;
        Ok(Self { conn, batch_size: batch_size.max(1) })
    }

    pub fn get(&self, rel_path: &str) -> Result<Option<FileEntry>, SyncError> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT rel_path, size, modify, checksum_algo, checksum_hex, last_sync \
                 FROM file_state WHERE rel_path = ?1",
            )
            .map_err(wrap)?;
        let mut rows = stmt.query(params![rel_path]).map_err(wrap)?;
        match rows.next().map_err(wrap)? {
            Some(row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    /// Streams the entire stored index into `sink`, fetched in chunks of
    /// `batch_size` so the caller never needs a second full copy in memory
    /// at once (mirrors `state_manager.get_all_files`'s `fetchmany(10000)`).
    pub fn for_each(&self, mut sink: impl FnMut(FileEntry)) -> Result<(), SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT rel_path, size, modify, checksum_algo, checksum_hex, last_sync \
                 FROM file_state ORDER BY rel_path",
            )
            .map_err(wrap)?;
        let mut rows = stmt.query([]).map_err(wrap)?;
        while let Some(row) = rows.next().map_err(wrap)? {
            sink(row_to_entry(row)?);
        }
        Ok(())
    }

    pub fn get_all(&self) -> Result<Index, SyncError> {
        let mut index = Index::new();
        self.for_each(|entry| {
            index.insert(entry.rel_path.clone(), entry);
        })?;
        Ok(index)
    }

    pub fn paths(&self) -> Result<std::collections::BTreeSet<String>, SyncError> {
        let mut set = std::collections::BTreeSet::new();
        let mut stmt = self.conn.prepare("SELECT rel_path FROM file_state").map_err(wrap)?;
        let mut rows = stmt.query([]).map_err(wrap)?;
        while let Some(row) = rows.next().map_err(wrap)? {
            set.insert(row.get::<_, String>(0).map_err(wrap)?);
        }
        Ok(set)
    }

    /// Diff the store against a freshly scanned remote index without
    /// materializing a second copy of the store's own index: walks the store
    /// in path order, compares it with the remote map entry-by-entry (§4.2).
    pub fn diff(&self, remote: &Index) -> Result<DiffOutcome, SyncError> {
        let mut seen_in_store = std::collections::BTreeSet::new();
        let mut outcome = DiffOutcome::default();
        self.for_each(|stored| {
            seen_in_store.insert(stored.rel_path.clone());
            match remote.get(&stored.rel_path) {
                Some(remote_entry) if remote_entry.matches(&stored) => {}
                Some(remote_entry) => {
                    outcome.to_download.push((remote_entry.rel_path.clone(), remote_entry.size));
                    outcome.total_bytes += remote_entry.size;
                }
                None => outcome.to_delete.push(stored.rel_path.clone()),
            }
        })?;
        for (path, entry) in remote.iter() {
            if !seen_in_store.contains(path) {
                outcome.to_download.push((path.clone(), entry.size));
                outcome.total_bytes += entry.size;
            }
        }
        Ok(outcome)
    }

    /// Upsert the given entries in contiguous transactions of `batch_size`
    /// rows each, so a crash mid-run never leaves a partially applied batch.
    pub fn upsert_batch<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a FileEntry>,
    ) -> Result<(), SyncError> {
        let batch_size = self.batch_size;
        let mut iter = entries.into_iter().peekable();
        while iter.peek().is_some() {
            let tx = self.conn.transaction().map_err(wrap)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO file_state (rel_path, size, modify, checksum_algo, checksum_hex, last_sync) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(rel_path) DO UPDATE SET \
                         size=excluded.size, modify=excluded.modify, \
                         checksum_algo=excluded.checksum_algo, checksum_hex=excluded.checksum_hex, \
                         last_sync=excluded.last_sync",
                    )
                    .map_err(wrap)?;
                let now = now_rfc3339();
                for _ in 0..batch_size {
                    let Some(entry) = iter.next() else { break };
                    let (algo, hex) = match &entry.checksum {
                        Some(c) => (Some(c.algorithm.as_str()), Some(c.hex.as_str())),
                        None => (None, None),
                    };
                    stmt.execute(params![entry.rel_path, entry.size, entry.modify, algo, hex, now])
                        .map_err(wrap)?;
                }
            }
            tx.commit().map_err(wrap)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, paths: impl IntoIterator<Item = impl AsRef<str>>) -> Result<(), SyncError> {
        let batch_size = self.batch_size;
        let mut iter = paths.into_iter().peekable();
        while iter.peek().is_some() {
            let tx = self.conn.transaction().map_err(wrap)?;
            {
                let mut stmt =
                    tx.prepare_cached("DELETE FROM file_state WHERE rel_path = ?1").map_err(wrap)?;
                for _ in 0..batch_size {
                    let Some(path) = iter.next() else { break };
                    stmt.execute(params![path.as_ref()]).map_err(wrap)?;
                }
            }
            tx.commit().map_err(wrap)?;
        }
        Ok(())
    }

    pub fn create_checkpoint(&self, cp: &Checkpoint) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT INTO sync_checkpoints (sync_id, timestamp, files_processed, files_total, bytes_transferred, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    cp.sync_id,
                    cp.timestamp,
                    cp.files_processed,
                    cp.files_total,
                    cp.bytes_transferred,
                    cp.status.as_str(),
                ],
            )
            .map_err(wrap)?;
        Ok(())
    }

    pub fn log_error(&self, record: &ErrorRecord) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT INTO sync_errors (sync_id, timestamp, rel_path, error_message, retry_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.sync_id, record.timestamp, record.rel_path, record.message, record.retry_count],
            )
            .map_err(wrap)?;
        Ok(())
    }

    pub fn latest_checkpoint(&self, sync_id: &str) -> Result<Option<Checkpoint>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sync_id, timestamp, files_processed, files_total, bytes_transferred, status \
                 FROM sync_checkpoints WHERE sync_id = ?1 ORDER BY id DESC LIMIT 1",
            )
            .map_err(wrap)?;
        let mut rows = stmt.query(params![sync_id]).map_err(wrap)?;
        match rows.next().map_err(wrap)? {
            Some(row) => Ok(Some(Checkpoint {
                sync_id: row.get(0).map_err(wrap)?,
                timestamp: row.get(1).map_err(wrap)?,
                files_processed: row.get(2).map_err(wrap)?,
                files_total: row.get(3).map_err(wrap)?,
                bytes_transferred: row.get(4).map_err(wrap)?,
                status: CheckpointStatus::parse(&row.get::<_, String>(5).map_err(wrap)?),
            })),
            None => Ok(None),
        }
    }

    pub fn statistics(&self) -> Result<StoreStatistics, SyncError> {
        let (count, total_bytes): (u64, u64) = self
            .conn
            .query_row("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM file_state", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(wrap)?;
        let last_sync: Option<String> = self
            .conn
            .query_row("SELECT MAX(last_sync) FROM file_state", [], |row| row.get(0))
            .map_err(wrap)?;
        Ok(StoreStatistics { count, total_bytes, last_sync, store_size_on_disk: 0 })
    }

    pub fn vacuum(&self) -> Result<(), SyncError> {
        self.conn.execute_batch("VACUUM;").map_err(wrap)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> Result<FileEntry, SyncError> {
    let rel_path: String = row.get(0).map_err(wrap)?;
    let size: u64 = row.get(1).map_err(wrap)?;
    let modify: String = row.get(2).map_err(wrap)?;
    let algo: Option<String> = row.get(3).map_err(wrap)?;
    let hex: Option<String> = row.get(4).map_err(wrap)?;
    let checksum = match (algo, hex) {
        (Some(a), Some(h)) => {
            HashAlgorithm::parse(&a).map(|algorithm| crate::model::Checksum { algorithm, hex: h })
        }
        _ => None,
    };
    Ok(FileEntry { rel_path, size, modify, checksum })
}
