//! End-to-end scenarios for the Sync Orchestrator (§8), driven against an
//! in-memory `MockTransport` rather than a live FTP/SFTP server. Grounded on
//! `hostpilot::transfer::workers::mock_io::PartialReader` for the fake
//! transport shape and on `other_examples`' `remote_storage::simulate_failures`
//! for the call-counted fault injection used in scenario 4.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use remote_mirror::config::{SyncConfig, TransportKind};
use remote_mirror::error::SyncError;
use remote_mirror::orchestrator;
use remote_mirror::progress::NullSink;
use remote_mirror::transport::{EntryKind, ExecHandle, ListEntry, Transport, TransportFactory};

#[derive(Default)]
struct MockBackend {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockBackend {
    fn insert(&self, path: &str, content: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), content.to_vec());
    }

    fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }
}

fn list_dir(files: &BTreeMap<String, Vec<u8>>, dir: &str) -> Vec<ListEntry> {
    let dir = dir.trim_matches('/');
    let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
    let mut seen_dirs = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for (path, content) in files.iter() {
        let Some(rest) = path.strip_prefix(prefix.as_str()) else { continue };
        if rest.is_empty() {
            continue;
        }
        match rest.split_once('/') {
            Some((first, _)) => {
                if seen_dirs.insert(first.to_string()) {
                    out.push(ListEntry {
                        name: first.to_string(),
                        kind: EntryKind::Dir,
                        size: 0,
                        mtime: None,
                    });
                }
            }
            None => {
                out.push(ListEntry {
                    name: rest.to_string(),
                    kind: EntryKind::File,
                    size: content.len() as u64,
                    mtime: Some("20260101000000".to_string()),
                });
            }
        }
    }
    out
}

struct MockTransport {
    backend: Arc<MockBackend>,
}

impl Transport for MockTransport {
    fn has_shell(&self) -> bool {
        false
    }

    fn list(&mut self, dir: &str) -> Result<Vec<ListEntry>, SyncError> {
        Ok(list_dir(&self.backend.files.lock().unwrap(), dir))
    }

    fn stat(&mut self, path: &str) -> Result<Option<ListEntry>, SyncError> {
        let key = path.trim_start_matches('/');
        let files = self.backend.files.lock().unwrap();
        Ok(files.get(key).map(|content| ListEntry {
            name: key.rsplit('/').next().unwrap_or(key).to_string(),
            kind: EntryKind::File,
            size: content.len() as u64,
            mtime: Some("20260101000000".to_string()),
        }))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let key = path.trim_start_matches('/');
        let files = self.backend.files.lock().unwrap();
        let content = files.get(key).cloned().ok_or_else(|| SyncError::PathNotFound(path.to_string()))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn noop(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    fn exec(&mut self, _cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        Err(SyncError::Unsupported("exec"))
    }
}

struct MockFactory {
    backend: Arc<MockBackend>,
}

impl TransportFactory for MockFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        Ok(Box::new(MockTransport { backend: self.backend.clone() }))
    }
}

/// Wraps a `MockFactory`, failing the Nth `open_read` call across every
/// connection it hands out, to simulate a control channel drop mid-run.
struct FlakyFactory {
    inner: MockFactory,
    fail_at_call: usize,
    call_count: Arc<AtomicUsize>,
}

struct FlakyTransport {
    inner: MockTransport,
    fail_at_call: usize,
    call_count: Arc<AtomicUsize>,
}

impl Transport for FlakyTransport {
    fn has_shell(&self) -> bool {
        self.inner.has_shell()
    }
    fn list(&mut self, dir: &str) -> Result<Vec<ListEntry>, SyncError> {
        self.inner.list(dir)
    }
    fn stat(&mut self, path: &str) -> Result<Option<ListEntry>, SyncError> {
        self.inner.stat(path)
    }
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_at_call {
            return Err(SyncError::TransientTransport("connection reset by peer".to_string()));
        }
        self.inner.open_read(path)
    }
    fn noop(&mut self) -> Result<(), SyncError> {
        self.inner.noop()
    }
    fn exec(&mut self, cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        self.inner.exec(cmd)
    }
}

impl TransportFactory for FlakyFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        let inner = MockTransport { backend: self.inner.backend.clone() };
        Ok(Box::new(FlakyTransport {
            inner,
            fail_at_call: self.fail_at_call,
            call_count: self.call_count.clone(),
        }))
    }
}

fn base_config(local_root: &std::path::Path, state_dir: &std::path::Path) -> SyncConfig {
    SyncConfig {
        transport: TransportKind::Sftp,
        host: "mock".to_string(),
        port: 22,
        user: "mock".to_string(),
        password: None,
        remote_root: String::new(),
        local_root: local_root.to_path_buf(),
        workers: 2,
        max_retries: 3,
        verify_integrity: true,
        use_hash_verification: false,
        hash_algorithm: remote_mirror::model::HashAlgorithm::Md5,
        use_incremental_scan: true,
        incremental_threshold_hours: 24,
        checkpoint_interval: 1000,
        exclude_patterns: remote_mirror::config::default_exclude_patterns(),
        handle_deletions: true,
        bulk_threshold: 100_000,
        state_dir: Some(state_dir.to_path_buf()),
    }
}

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("remote-mirror-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Scenario 1: empty remote yields an empty local tree and zero transfers.
#[test]
fn scenario_empty_remote_is_a_no_op() {
    let local = temp_dir("s1-local");
    let state = temp_dir("s1-state");
    let backend = Arc::new(MockBackend::default());
    let factory = Arc::new(MockFactory { backend });
    let config = base_config(&local, &state);

    let summary = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();
    assert_eq!(summary.files_transferred, 0);
    assert_eq!(summary.bytes_transferred, 0);
    assert!(summary.errors.is_empty());
}

/// Scenario 2: first run downloads everything; second run is a no-op.
#[test]
fn scenario_first_run_downloads_second_run_is_idempotent() {
    let local = temp_dir("s2-local");
    let state = temp_dir("s2-state");
    let backend = Arc::new(MockBackend::default());
    backend.insert("a.txt", b"hello");
    backend.insert("d/b.txt", b"yes");
    let factory = Arc::new(MockFactory { backend });
    let config = base_config(&local, &state);

    let first = orchestrator::run_with_factory(&config, factory.clone(), Arc::new(NullSink)).unwrap();
    assert_eq!(first.files_transferred, 2);
    assert_eq!(std::fs::read(local.join("a.txt")).unwrap(), b"hello");
    assert_eq!(std::fs::read(local.join("d/b.txt")).unwrap(), b"yes");

    let second = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();
    assert_eq!(second.files_transferred, 0);
    assert_eq!(second.bytes_transferred, 0);
}

/// Scenario 3: a remote file is removed and another added between runs; the
/// second run deletes the stale local file and downloads the new one.
#[test]
fn scenario_second_run_reconciles_additions_and_removals() {
    let local = temp_dir("s3-local");
    let state = temp_dir("s3-state");
    let backend = Arc::new(MockBackend::default());
    backend.insert("a.txt", b"hello");
    backend.insert("d/b.txt", b"yes");
    let factory = Arc::new(MockFactory { backend: backend.clone() });
    let config = base_config(&local, &state);

    orchestrator::run_with_factory(&config, factory.clone(), Arc::new(NullSink)).unwrap();

    backend.remove("d/b.txt");
    backend.insert("d/c.txt", b"done");

    let second = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();
    assert_eq!(second.files_transferred, 1);
    assert_eq!(second.files_deleted, 1);
    assert!(!local.join("d/b.txt").exists());
    assert_eq!(std::fs::read(local.join("d/c.txt")).unwrap(), b"done");
}

/// Scenario 4: the transport drops mid-run; the pool reconnects and every
/// file still arrives.
#[test]
fn scenario_connection_drop_mid_run_recovers_via_reconnect() {
    let local = temp_dir("s4-local");
    let state = temp_dir("s4-state");
    let backend = Arc::new(MockBackend::default());
    for i in 0..10 {
        backend.insert(&format!("f{i}.bin"), format!("payload-{i}").as_bytes());
    }
    let factory = Arc::new(FlakyFactory {
        inner: MockFactory { backend },
        fail_at_call: 1,
        call_count: Arc::new(AtomicUsize::new(0)),
    });
    let mut config = base_config(&local, &state);
    config.workers = 1;

    let summary = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();
    assert_eq!(summary.files_transferred, 10);
    for i in 0..10 {
        assert!(local.join(format!("f{i}.bin")).exists());
    }
}

/// Wraps a `MockTransport`, growing one backend entry the call after it is
/// listed — simulating a remote file that changes size between scan and
/// transfer without needing two separate orchestrator runs.
struct GrowthTransport {
    inner: MockTransport,
    target_path: String,
    grown_content: Vec<u8>,
    triggered: Arc<AtomicBool>,
}

impl Transport for GrowthTransport {
    fn has_shell(&self) -> bool {
        self.inner.has_shell()
    }
    fn list(&mut self, dir: &str) -> Result<Vec<remote_mirror::transport::ListEntry>, SyncError> {
        let out = self.inner.list(dir)?;
        if !self.triggered.swap(true, Ordering::SeqCst) {
            self.inner.backend.insert(&self.target_path, &self.grown_content);
        }
        Ok(out)
    }
    fn stat(&mut self, path: &str) -> Result<Option<remote_mirror::transport::ListEntry>, SyncError> {
        self.inner.stat(path)
    }
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        self.inner.open_read(path)
    }
    fn noop(&mut self) -> Result<(), SyncError> {
        self.inner.noop()
    }
    fn exec(&mut self, cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        self.inner.exec(cmd)
    }
}

struct GrowthFactory {
    backend: Arc<MockBackend>,
    target_path: String,
    grown_content: Vec<u8>,
    triggered: Arc<AtomicBool>,
}

impl TransportFactory for GrowthFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        Ok(Box::new(GrowthTransport {
            inner: MockTransport { backend: self.backend.clone() },
            target_path: self.target_path.clone(),
            grown_content: self.grown_content.clone(),
            triggered: self.triggered.clone(),
        }))
    }
}

/// Scenario 6: the remote file grows from 1000 to 1200 bytes between the
/// scan (which records the old size in the Index) and the transfer/verify
/// step. The integrity verifier's smart rescan must treat this as success
/// with a corrected size rather than corruption.
#[test]
fn scenario_remote_file_grows_mid_transfer_triggers_smart_rescan() {
    let local = temp_dir("s6-local");
    let state = temp_dir("s6-state");
    let backend = Arc::new(MockBackend::default());
    backend.insert("grows.bin", &vec![0u8; 1000]);
    let factory = Arc::new(GrowthFactory {
        backend,
        target_path: "grows.bin".to_string(),
        grown_content: vec![1u8; 1200],
        triggered: Arc::new(AtomicBool::new(false)),
    });
    let config = base_config(&local, &state);

    let summary = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();
    assert_eq!(summary.files_transferred, 1);
    assert!(summary.errors.is_empty());
    assert_eq!(summary.bytes_transferred, 1200);
    assert_eq!(std::fs::metadata(local.join("grows.bin")).unwrap().len(), 1200);

    let store_path = config.state_store_path().unwrap();
    let store = remote_mirror::store::StateStore::open(&store_path, 500).unwrap();
    let recorded = store.get_all().unwrap();
    assert_eq!(recorded.get("grows.bin").unwrap().size, 1200);
}

/// A shell-capable fake backing scenario 5: answers the `$HOME`/`ls -a`
/// probes `shell_find::resolve_real_root` issues, fails every writable-tmp
/// probe (simulating a read-only `/tmp`, `/var/tmp`, and cwd), and turns a
/// tier-2 argv tar batch into an in-memory archive built from its own files.
struct ShellTransport {
    backend: Arc<MockBackend>,
    home: String,
}

struct ShellExecHandle {
    data: Cursor<Vec<u8>>,
    exit_code: i32,
}

impl ExecHandle for ShellExecHandle {
    fn write_stdin(&mut self, _data: &[u8]) -> Result<(), SyncError> {
        Ok(())
    }
    fn close_stdin(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
    fn read_stdout(&mut self) -> Result<Vec<u8>, SyncError> {
        let mut buf = Vec::new();
        self.data.read_to_end(&mut buf).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        Ok(buf)
    }
    fn read_stdout_to(&mut self, sink: &mut dyn std::io::Write) -> Result<(), SyncError> {
        std::io::copy(&mut self.data, sink)
            .map(|_| ())
            .map_err(|e| SyncError::TransientTransport(e.to_string()))
    }
    fn reader(&mut self) -> &mut dyn Read {
        &mut self.data
    }
    fn finish(mut self: Box<Self>) -> Result<(Vec<u8>, i32), SyncError> {
        let mut buf = Vec::new();
        self.data.read_to_end(&mut buf).map_err(|e| SyncError::TransientTransport(e.to_string()))?;
        Ok((buf, self.exit_code))
    }
}

/// Fixed so the shell-find output's parsed mtime (`format_epoch_seconds`)
/// matches what the pre-seeded store rows below use as `modify`.
const SHELL_SCAN_EPOCH: i64 = 1_767_225_600;

impl Transport for ShellTransport {
    fn has_shell(&self) -> bool {
        true
    }
    fn list(&mut self, dir: &str) -> Result<Vec<remote_mirror::transport::ListEntry>, SyncError> {
        Ok(list_dir(&self.backend.files.lock().unwrap(), dir))
    }
    fn stat(&mut self, path: &str) -> Result<Option<remote_mirror::transport::ListEntry>, SyncError> {
        let key = path.trim_start_matches('/');
        let files = self.backend.files.lock().unwrap();
        Ok(files.get(key).map(|content| remote_mirror::transport::ListEntry {
            name: key.rsplit('/').next().unwrap_or(key).to_string(),
            kind: EntryKind::File,
            size: content.len() as u64,
            mtime: Some("20260101000000".to_string()),
        }))
    }
    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>, SyncError> {
        let key = path.trim_start_matches('/');
        let files = self.backend.files.lock().unwrap();
        let content = files.get(key).cloned().ok_or_else(|| SyncError::PathNotFound(path.to_string()))?;
        Ok(Box::new(Cursor::new(content)))
    }
    fn noop(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    fn exec(&mut self, cmd: &str) -> Result<Box<dyn ExecHandle>, SyncError> {
        let ok = |data: Vec<u8>| Ok(Box::new(ShellExecHandle { data: Cursor::new(data), exit_code: 0 }) as Box<dyn ExecHandle>);

        if cmd == "command -v tar" {
            return ok(b"/usr/bin/tar".to_vec());
        }
        if cmd.starts_with("printf '%s' \"$HOME\"") {
            return ok(self.home.as_bytes().to_vec());
        }
        if cmd.starts_with("ls -a ") {
            let names: std::collections::BTreeSet<String> =
                self.backend.files.lock().unwrap().keys().cloned().collect();
            return ok(names.into_iter().collect::<Vec<_>>().join("\n").into_bytes());
        }
        if cmd.contains(".mirror_probe.") {
            // Every writable-tmp candidate reports read-only.
            return Ok(Box::new(ShellExecHandle { data: Cursor::new(Vec::new()), exit_code: 1 }));
        }
        if cmd.starts_with(&format!("find -L \"{}\"", self.home)) {
            let files = self.backend.files.lock().unwrap();
            let mut out = String::new();
            for (path, content) in files.iter() {
                out.push_str(&format!("{path}\t{}\t{SHELL_SCAN_EPOCH}.0\n", content.len()));
            }
            return ok(out.into_bytes());
        }
        let batch_prefix = format!("tar -C \"{}\" -cf - --ignore-failed-read -h ", self.home);
        if let Some(rest) = cmd.strip_prefix(&batch_prefix) {
            let files = self.backend.files.lock().unwrap();
            let mut builder = tar::Builder::new(Vec::new());
            for p in rest.split_whitespace() {
                if let Some(content) = files.get(p) {
                    let mut header = tar::Header::new_gnu();
                    header.set_size(content.len() as u64);
                    header.set_mode(0o644);
                    header.set_cksum();
                    builder
                        .append_data(&mut header, p, &content[..])
                        .map_err(|e| SyncError::Protocol(e.to_string()))?;
                }
            }
            builder.finish().map_err(|e| SyncError::Protocol(e.to_string()))?;
            let data = builder.into_inner().map_err(|e| SyncError::Protocol(e.to_string()))?;
            return ok(data);
        }
        Err(SyncError::Unsupported("exec"))
    }
}

struct ShellFactory {
    backend: Arc<MockBackend>,
    home: String,
}

impl TransportFactory for ShellFactory {
    fn connect(&self) -> Result<Box<dyn Transport>, SyncError> {
        Ok(Box::new(ShellTransport { backend: self.backend.clone(), home: self.home.clone() }))
    }
}

/// Scenario 5: selective tar mode with 501 files to fetch on a server whose
/// writable-tmp candidates are all read-only. Tier 1 is skipped entirely;
/// tier 2's argv batches extract every file, and verification finds no
/// mismatches.
#[test]
fn scenario_selective_tar_falls_back_to_tier2_batches_when_tmp_is_read_only() {
    let local = temp_dir("s5-local");
    let state = temp_dir("s5-state");
    let backend = Arc::new(MockBackend::default());
    let home = "/home/mock".to_string();

    const TOTAL: usize = 700;
    const ALREADY_SYNCED: usize = 199;
    for i in 0..TOTAL {
        backend.insert(&format!("f{i:03}.bin"), &vec![(i % 251) as u8; 64]);
    }

    let config = {
        let mut c = base_config(&local, &state);
        c.bulk_threshold = 500;
        c
    };

    // Pre-seed the state store with the files already in sync, so the diff
    // only flags the remaining 501 as needing a transfer (ratio 501/700 is
    // below the full-tree threshold, routing into selective mode).
    let store_path = config.state_store_path().unwrap();
    {
        let mut store = remote_mirror::store::StateStore::open(&store_path, 500).unwrap();
        let modify = remote_mirror::model::format_epoch_seconds(SHELL_SCAN_EPOCH);
        let entries: Vec<_> = (0..ALREADY_SYNCED)
            .map(|i| remote_mirror::model::FileEntry::new(format!("f{i:03}.bin"), 64, modify.clone()))
            .collect();
        store.upsert_batch(entries.iter()).unwrap();
    }

    let factory = Arc::new(ShellFactory { backend, home });
    let summary = orchestrator::run_with_factory(&config, factory, Arc::new(NullSink)).unwrap();

    assert_eq!(summary.files_transferred, (TOTAL - ALREADY_SYNCED) as u64);
    assert!(summary.errors.is_empty());
    for i in ALREADY_SYNCED..TOTAL {
        let path = local.join(format!("f{i:03}.bin"));
        assert!(path.exists(), "missing {path:?}");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
    }
}
