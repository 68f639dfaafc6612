mod common;

use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use common::{fill, fixture};
use slice_recorder::config::SyncConfig;
use slice_recorder::slice::SlicePayload;
use slice_recorder::sync::{LocalTransport, PeerStore, PulledSlice, RetryPolicy, Transport};
use slice_recorder::{
    Error, MemoryRepository, Recording, RecordingConfig, RecordingContext, Role, SyncMode, Syncer, TransferError,
};

fn fast(attempts: usize) -> RetryPolicy {
    RetryPolicy {
        attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn peer() -> (tempfile::TempDir, Arc<PeerStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PeerStore::new(dir.path()));
    (dir, store)
}

fn local_syncer(store: &Arc<PeerStore>) -> Syncer {
    Syncer::new(Arc::new(LocalTransport::new(Arc::clone(store))), &SyncConfig::default()).with_policy(fast(1))
}

fn consumer_context(dir: &std::path::Path) -> RecordingContext {
    RecordingContext::new(RecordingConfig::with_data_dir(dir), Arc::new(MemoryRepository::new()))
}

fn non_empty_slices(rec: &Recording) -> usize {
    rec.columns().values().flat_map(|c| c.slices()).filter(|s| !s.is_empty()).count()
}

/// Wraps [`LocalTransport`] and fails calls on demand.
struct Flaky {
    inner: LocalTransport,
    fail_metadata: AtomicBool,
    fail_every_other: AtomicBool,
    failures_left: AtomicUsize,
    slice_calls: AtomicUsize,
}

impl Flaky {
    fn new(store: &Arc<PeerStore>) -> Self {
        Self {
            inner: LocalTransport::new(Arc::clone(store)),
            fail_metadata: AtomicBool::new(false),
            fail_every_other: AtomicBool::new(false),
            failures_left: AtomicUsize::new(0),
            slice_calls: AtomicUsize::new(0),
        }
    }
}

fn unavailable() -> TransferError {
    TransferError::Status { status: 503, message: "unavailable".into() }
}

#[async_trait]
impl Transport for Flaky {
    async fn push_metadata(&self, id: &str, metadata: &Value) -> Result<(), TransferError> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(TransferError::Network("connection refused".into()));
        }
        self.inner.push_metadata(id, metadata).await
    }

    async fn push_slice(&self, id: &str, payload: &SlicePayload) -> Result<(), TransferError> {
        let call = self.slice_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || (self.fail_every_other.load(Ordering::SeqCst) && call % 2 == 0) {
            return Err(unavailable());
        }
        self.inner.push_slice(id, payload).await
    }

    async fn pull_metadata(&self, id: &str) -> Result<Value, TransferError> {
        self.inner.pull_metadata(id).await
    }

    async fn pull_slice(&self, id: &str, hash: &str) -> Result<PulledSlice, TransferError> {
        self.inner.pull_slice(id, hash).await
    }
}

#[tokio::test]
async fn test_full_sync_and_pull() {
    let fx = fixture(8);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..20, |i| 50.0 + i as f64);
    for i in 0..6 {
        rec.append_combined("acc", &[i as f64, 1.0, -(i as f64)], i as f64).unwrap();
    }
    rec.close().unwrap();

    let (_peer_dir, store) = peer();
    let syncer = local_syncer(&store);
    let report = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(report.is_success());
    assert!(report.all_sent);
    assert_eq!(report.sent, non_empty_slices(&rec));

    // Nothing left to send.
    let again = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert_eq!(again.sent, 0);
    assert!(again.all_sent);

    let consumer_dir = tempfile::tempdir().unwrap();
    let ctx = consumer_context(consumer_dir.path());
    let mut pulled = syncer.pull(rec.id(), &ctx).await.unwrap();
    assert_eq!(pulled.role(), Role::Consumer);
    assert!(pulled.is_closed());
    assert_eq!(pulled.values("heart_rate").unwrap(), rec.values("heart_rate").unwrap());
    assert_eq!(pulled.times("acc_z").unwrap(), rec.times("acc_x").unwrap());
    assert_eq!(pulled.values("acc_z").unwrap(), rec.values("acc_z").unwrap());
    assert_eq!(pulled.totals(), rec.totals());

    // The pulled copy can be reopened from its own repository.
    let mut reopened = Recording::open(&ctx, rec.id(), Role::Consumer).unwrap();
    assert_eq!(reopened.values("heart_rate").unwrap().len(), 20);
}

#[tokio::test]
async fn test_partial_sync_follows_open_recording() {
    let fx = fixture(24);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..5, |_| 60.0);

    let (_peer_dir, store) = peer();
    let syncer = local_syncer(&store);
    let report = syncer.sync(&mut rec, SyncMode::Partial).await.unwrap();
    assert!(report.is_success());
    assert!(!report.all_sent);

    let first = rec.column("heart_rate").unwrap().value_slices()[0].hash().to_string();
    let peer_file = store.root().join(rec.id()).join(format!("{}.bin", first));
    assert_eq!(fs::metadata(&peer_file).unwrap().len(), 5);
    assert_eq!(rec.column("heart_rate").unwrap().value_slices()[0].send_pointer(), 5);

    fill(&mut rec, "heart_rate", 5..30, |_| 61.0);
    syncer.sync(&mut rec, SyncMode::Partial).await.unwrap();
    let column = rec.column("heart_rate").unwrap();
    assert_eq!(fs::metadata(&peer_file).unwrap().len(), 24);
    assert!(column.value_slices()[0].is_sent());
    assert!(!column.value_slices()[1].is_sent());
    assert_eq!(column.value_slices()[1].send_pointer(), 6);

    let report = syncer.close(&mut rec).await.unwrap();
    assert!(report.is_success());
    assert!(report.all_sent);
    assert!(!peer_file.exists());
    assert!(store.root().join(rec.id()).join(format!("{}.bin.lz4", first)).exists());
}

#[tokio::test]
async fn test_full_sync_sends_each_slice_once() {
    let fx = fixture(8);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..10, |i| 60.0 + i as f64);

    let (_peer_dir, store) = peer();
    let flaky = Arc::new(Flaky::new(&store));
    let syncer = Syncer::new(flaky.clone(), &SyncConfig::default()).with_policy(fast(1));

    // One full value slice plus ten single-sample time slices.
    let open = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(open.is_success());
    assert_eq!(open.sent, 11);
    assert!(!open.all_sent);

    let closed = syncer.close(&mut rec).await.unwrap();
    assert!(closed.all_sent);
    assert_eq!(closed.sent, 1);
    assert_eq!(flaky.slice_calls.load(Ordering::SeqCst), non_empty_slices(&rec));

    let held: Vec<String> = fs::read_dir(store.root().join(rec.id()))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".bin"))
        .collect();
    assert_eq!(held.len(), non_empty_slices(&rec));
    assert!(held.iter().all(|name| name.ends_with(".bin.lz4")), "{:?}", held);
}

#[tokio::test]
async fn test_interrupted_sync_resumes() {
    let fx = fixture(8);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..30, |i| (i * 3 % 200) as f64);
    fill(&mut rec, "temperature", 0..9, |i| 36.0 + i as f64 / 10.0);
    rec.close().unwrap();

    let (_peer_dir, store) = peer();
    let flaky = Arc::new(Flaky::new(&store));
    flaky.fail_every_other.store(true, Ordering::SeqCst);
    let syncer = Syncer::new(flaky.clone(), &SyncConfig::default()).with_policy(fast(1));

    let interrupted = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(interrupted.metadata_pushed);
    assert!(!interrupted.failed.is_empty());
    assert!(!interrupted.all_sent);
    assert_eq!(interrupted.sent + interrupted.failed.len(), non_empty_slices(&rec));

    flaky.fail_every_other.store(false, Ordering::SeqCst);
    let resumed = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(resumed.is_success());
    assert!(resumed.all_sent);
    assert_eq!(resumed.sent, interrupted.failed.len());

    // The peer holds exactly the local files, byte for byte.
    let peer_rec_dir = store.root().join(rec.id());
    let mut expected = BTreeSet::new();
    for slice in rec.columns().values().flat_map(|c| c.slices()) {
        let name = slice.file_name();
        assert_eq!(fs::read(peer_rec_dir.join(&name)).unwrap(), fs::read(slice.path(&rec.dir())).unwrap());
        expected.insert(name);
    }
    let held: BTreeSet<String> = fs::read_dir(&peer_rec_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".bin"))
        .collect();
    assert_eq!(held, expected);

    let consumer_dir = tempfile::tempdir().unwrap();
    let mut pulled = syncer.pull(rec.id(), &consumer_context(consumer_dir.path())).await.unwrap();
    assert_eq!(pulled.values("temperature").unwrap(), rec.values("temperature").unwrap());
}

#[tokio::test]
async fn test_metadata_failure_sends_nothing() {
    let fx = fixture(8);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..10, |_| 60.0);
    rec.close().unwrap();

    let (_peer_dir, store) = peer();
    let flaky = Arc::new(Flaky::new(&store));
    flaky.fail_metadata.store(true, Ordering::SeqCst);
    let syncer = Syncer::new(flaky.clone(), &SyncConfig::default()).with_policy(fast(2));

    let report = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(!report.metadata_pushed);
    assert_eq!(report.sent, 0);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "metadata");
    assert_eq!(flaky.slice_calls.load(Ordering::SeqCst), 0);
    assert!(!store.root().join(rec.id()).exists());
    assert!(!rec.check_all_slices_sent(false));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fx = fixture(8);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..10, |_| 60.0);
    rec.close().unwrap();

    let (_peer_dir, store) = peer();
    let flaky = Arc::new(Flaky::new(&store));
    flaky.failures_left.store(2, Ordering::SeqCst);
    let syncer = Syncer::new(flaky.clone(), &SyncConfig::default()).with_policy(fast(3));

    let report = syncer.sync(&mut rec, SyncMode::Full).await.unwrap();
    assert!(report.is_success());
    assert!(report.all_sent);
    assert_eq!(flaky.slice_calls.load(Ordering::SeqCst), non_empty_slices(&rec) + 2);
}

#[tokio::test]
async fn test_pull_unknown_recording() {
    let (_peer_dir, store) = peer();
    let syncer = local_syncer(&store);
    let consumer_dir = tempfile::tempdir().unwrap();
    let err = syncer.pull("dev-missing000", &consumer_context(consumer_dir.path())).await.unwrap_err();
    assert!(matches!(err, Error::Transfer(TransferError::Status { status: 404, .. })));
}

#[test]
fn test_no_target_means_no_syncer() {
    assert!(Syncer::from_config(&SyncConfig::default()).unwrap().is_none());
    let config = SyncConfig { target: Some("http://peer.local:9000/".into()), ..SyncConfig::default() };
    assert!(Syncer::from_config(&config).unwrap().is_some());
}

fn payload(hash: &str, partial: bool, offset: usize, bytes: Vec<u8>) -> SlicePayload {
    let end = offset + bytes.len();
    SlicePayload {
        hash: hash.to_string(),
        filename: format!("{}.bin", hash),
        partial,
        offset,
        bytes,
        send_pointer_after: end,
    }
}

fn status_of(result: Result<(), TransferError>) -> Option<u16> {
    match result {
        Err(TransferError::Status { status, .. }) => Some(status),
        _ => None,
    }
}

#[test]
fn test_peer_validates_uploads() {
    let fx = fixture(24);
    let mut rec = fx.recording();
    fill(&mut rec, "heart_rate", 0..5, |i| i as f64);
    rec.flush().unwrap();
    let hash = rec.column("heart_rate").unwrap().value_slices()[0].hash().to_string();

    let (_peer_dir, store) = peer();
    // Slices are refused until metadata declares them.
    assert_eq!(status_of(store.receive_slice(rec.id(), &payload(&hash, true, 0, vec![0; 5]))), Some(404));
    store.receive_metadata(rec.id(), &rec.metadata().unwrap()).unwrap();

    // Gap: nothing is held yet.
    assert_eq!(status_of(store.receive_slice(rec.id(), &payload(&hash, true, 3, vec![3, 4]))), Some(409));
    // Overrun: five samples declared.
    assert_eq!(status_of(store.receive_slice(rec.id(), &payload(&hash, true, 0, vec![0; 6]))), Some(409));
    // Undeclared slice.
    assert_eq!(status_of(store.receive_slice(rec.id(), &payload("0badf00d", true, 0, vec![0]))), Some(409));

    store.receive_slice(rec.id(), &payload(&hash, true, 0, vec![0, 1, 2])).unwrap();
    store.receive_slice(rec.id(), &payload(&hash, true, 2, vec![2, 3, 4])).unwrap();
    let held = store.slice(rec.id(), &hash).unwrap();
    assert_eq!(held.filename, format!("{}.bin", hash));
    assert_eq!(held.bytes, vec![0, 1, 2, 3, 4]);

    // A full upload must match the declared size exactly.
    assert_eq!(status_of(store.receive_slice(rec.id(), &payload(&hash, false, 0, vec![0; 4]))), Some(409));
    store.receive_slice(rec.id(), &payload(&hash, false, 0, vec![0, 1, 2, 3, 4])).unwrap();

    assert!(store.remove(rec.id()).unwrap());
    assert!(!store.remove(rec.id()).unwrap());
}
