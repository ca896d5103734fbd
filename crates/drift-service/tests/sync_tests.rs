//! Agent ↔ server synchronisation tests.
//!
//! Tests cover:
//!  1. First scan sends coverage and uploads content
//!  2. Edits produce drift; history reconstructs every version
//!  3. Planned-changes definitions are not alertable
//!  4. Redelivery is idempotent, concurrent delivery appends once
//!  5. Lost agent state and re-baseline fall back to coverage
//!  6. Transient transport failures are retried, including a lost ack
//!  7. Scheduler wake-up and shutdown
//!  8. Unreadable files are not reported as removed

use async_trait::async_trait;
use drift_core::changeset::{Category, ChangeKind};
use drift_core::content_store::ContentStore;
use drift_core::definition::{Definition, HandlingMode, PathFilter};
use drift_core::hasher::{ContentHasher, Digest};
use drift_core::settings::TransportSettings;
use drift_core::snapshot::{
    CancelToken, FsWalker, Snapshotter, TreeWalker, WalkOutcome, WalkedFile,
};
use drift_core::store::FsChangeSetStore;
use drift_service::agent::{AgentStateStore, DriftAgent, ScanOutcome};
use drift_service::journal::IngestJournal;
use drift_service::scheduler::{spawn_scheduler, ScanCallback};
use drift_service::server::{IngestOutcome, IngestReceipt, SyncServer};
use drift_service::transport::{LocalTransport, Transport, TransportError};
use parking_lot::Mutex;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

struct Fixture {
    _dir: TempDir,
    tree: PathBuf,
    server: Arc<SyncServer>,
    journal: Arc<IngestJournal>,
    state_dir: PathBuf,
}

fn write(base: &Path, rel: &str, content: &str) {
    let path = base.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn fixture(mode: HandlingMode) -> Fixture {
    let dir = tempdir().unwrap();
    let tree = dir.path().join("tree");
    write(&tree, "server.xml", "<server port=\"8080\"/>");
    write(&tree, "conf/app.properties", "threads=4");

    let store = FsChangeSetStore::open(dir.path().join("changesets")).unwrap();
    let content = ContentStore::open(dir.path().join("content"), ContentHasher::default()).unwrap();
    let server = Arc::new(SyncServer::new(Arc::new(store), content));
    server
        .register_definition(Definition::new("app", &tree).with_handling_mode(mode))
        .unwrap();
    let journal = Arc::new(IngestJournal::open(dir.path().join("journal/ingest.log")).unwrap());
    server.listeners().register(journal.clone()).unwrap();

    let state_dir = dir.path().join("agent");
    Fixture {
        tree,
        server,
        journal,
        state_dir,
        _dir: dir,
    }
}

fn fast_retry() -> TransportSettings {
    TransportSettings {
        max_attempts: 4,
        backoff_ms: vec![1, 2, 5],
    }
}

fn agent_with(fx: &Fixture, transport: Arc<dyn Transport>) -> DriftAgent<FsWalker> {
    DriftAgent::new(
        Snapshotter::new(FsWalker, ContentHasher::default()),
        transport,
        AgentStateStore::open(&fx.state_dir).unwrap(),
        fast_retry(),
    )
}

fn agent(fx: &Fixture) -> DriftAgent<FsWalker> {
    agent_with(fx, Arc::new(LocalTransport::new(fx.server.clone())))
}

fn definition(fx: &Fixture) -> Definition {
    fx.server.definition("app").unwrap()
}

// ─── Test 1: first scan ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_scan_sends_coverage_and_content() {
    let fx = fixture(HandlingMode::Normal);
    let agent = agent(&fx);

    let outcome = agent
        .run_scan(&definition(&fx), &CancelToken::new(), false)
        .await
        .unwrap();
    assert_eq!(outcome.version, 0);
    assert_eq!(outcome.category, Category::Coverage);
    assert_eq!(outcome.entries, 2);
    assert_eq!(outcome.uploaded, 2);

    let state = fx.server.effective_state("app", 0).unwrap();
    let digest = *state.get("conf/app.properties").unwrap();
    assert_eq!(fx.server.content(&digest).unwrap(), b"threads=4");
    assert_eq!(agent.state().load("app").unwrap().snapshot, state);
}

// ─── Test 2: drift and history ──────────────────────────────────────────────

#[tokio::test]
async fn test_edits_produce_drift_and_reconstruct() {
    let fx = fixture(HandlingMode::Normal);
    let agent = agent(&fx);
    let def = definition(&fx);
    let cancel = CancelToken::new();

    agent.run_scan(&def, &cancel, false).await.unwrap();
    write(&fx.tree, "conf/app.properties", "threads=8");
    write(&fx.tree, "conf/extra.properties", "debug=false");
    let v1 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!(v1.category, Category::Drift);
    assert_eq!(v1.entries, 2);
    assert_eq!(v1.uploaded, 2);

    fs::remove_file(fx.tree.join("server.xml")).unwrap();
    let v2 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v2.version, v2.entries, v2.uploaded), (2, 1, 0));

    // nothing changed: an empty drift still marks a version
    let v3 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v3.version, v3.entries), (3, 0));

    let state = fx.server.effective_state("app", 3).unwrap();
    let paths: Vec<&str> = state.iter().map(|(p, _)| p).collect();
    assert_eq!(paths, vec!["conf/app.properties", "conf/extra.properties"]);
    assert_eq!(fx.server.effective_state("app", 0).unwrap().len(), 2);
    assert_eq!(fx.server.history("app").unwrap().len(), 4);

    let journal = fx.journal.read_recent(None).unwrap();
    assert_eq!(journal.len(), 4);
    let alertable: Vec<bool> = journal.iter().rev().map(|e| e.alertable).collect();
    assert_eq!(alertable, vec![false, true, true, false]);
    assert_eq!(fx.journal.verify().unwrap(), 4);
}

// ─── Test 3: planned changes ────────────────────────────────────────────────

#[tokio::test]
async fn test_planned_changes_are_not_alertable() {
    let fx = fixture(HandlingMode::PlannedChanges);
    let agent = agent(&fx);
    let def = definition(&fx);
    let cancel = CancelToken::new();

    agent.run_scan(&def, &cancel, false).await.unwrap();
    write(&fx.tree, "server.xml", "<server port=\"9090\"/>");
    agent.run_scan(&def, &cancel, false).await.unwrap();

    let journal = fx.journal.read_recent(None).unwrap();
    assert_eq!(journal.len(), 2);
    assert!(journal.iter().all(|e| !e.alertable));
}

// ─── Test 4: idempotent and concurrent delivery ─────────────────────────────

#[tokio::test]
async fn test_redelivery_is_a_noop() {
    let fx = fixture(HandlingMode::Normal);
    let def = definition(&fx);
    let snapshot = Snapshotter::new(FsWalker, ContentHasher::default())
        .snapshot_definition(&def, &CancelToken::new())
        .unwrap()
        .snapshot;
    let cs = drift_core::ChangeSet::new(
        "app",
        def.base_dir_string(),
        Category::Coverage,
        0,
        drift_core::differ::coverage(&snapshot),
    );
    let encoded = drift_core::codec::encode(&cs).unwrap();

    let transport = Arc::new(LocalTransport::new(fx.server.clone()));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let transport = transport.clone();
        let encoded = encoded.clone();
        tasks.push(tokio::spawn(async move { transport.transmit(encoded).await }));
    }
    let mut appended = 0;
    for task in tasks {
        let receipt = task.await.unwrap().unwrap();
        assert_eq!(receipt.version, 0);
        if receipt.outcome == IngestOutcome::Appended {
            appended += 1;
        }
    }
    assert_eq!(appended, 1);
    assert_eq!(fx.server.next_version("app").unwrap(), 1);
    assert_eq!(fx.journal.read_recent(None).unwrap().len(), 1);

    // a different change-set claiming the stored version is refused
    let conflicting = drift_core::ChangeSet::new("app", def.base_dir_string(), Category::Coverage, 0, vec![]);
    let err = transport
        .transmit(drift_core::codec::encode(&conflicting).unwrap())
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}

// ─── Test 5: coverage fallbacks ─────────────────────────────────────────────

#[tokio::test]
async fn test_lost_state_and_rebaseline_send_coverage() {
    let fx = fixture(HandlingMode::Normal);
    let agent = agent(&fx);
    let def = definition(&fx);
    let cancel = CancelToken::new();

    agent.run_scan(&def, &cancel, false).await.unwrap();
    agent.state().clear("app").unwrap();
    let v1 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v1.version, v1.category), (1, Category::Coverage));

    let v2 = agent.run_scan(&def, &cancel, true).await.unwrap();
    assert_eq!((v2.version, v2.category), (2, Category::Coverage));
    write(&fx.tree, "new.txt", "fresh");
    let v3 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v3.version, v3.category, v3.entries), (3, Category::Drift, 1));

    assert_eq!(fx.server.effective_state("app", 3).unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_scan_sends_nothing() {
    let fx = fixture(HandlingMode::Normal);
    let agent = agent(&fx);
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(agent.run_scan(&definition(&fx), &cancel, false).await.is_err());
    assert_eq!(fx.server.next_version("app").unwrap(), 0);
    assert_eq!(agent.state().load("app").unwrap().version, None);
}

// ─── Test 6: flaky transport ────────────────────────────────────────────────

/// Fails the first `failures` transmissions with a retryable error before
/// they reach the server, and drops the receipt of the next `lost_acks`
/// transmissions after the server has taken them.
struct FlakyTransport {
    inner: LocalTransport,
    failures: AtomicU32,
    lost_acks: AtomicU32,
    uploads: Mutex<Vec<Digest>>,
    receipts: Mutex<Vec<IngestOutcome>>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn next_version(&self, definition: &str) -> Result<u32, TransportError> {
        self.inner.next_version(definition).await
    }

    async fn transmit(&self, encoded: String) -> Result<IngestReceipt, TransportError> {
        if take_one(&self.failures) {
            return Err(TransportError::Retryable("connection reset".into()));
        }
        let receipt = self.inner.transmit(encoded).await?;
        self.receipts.lock().push(receipt.outcome);
        if take_one(&self.lost_acks) {
            return Err(TransportError::Retryable("connection closed before reply".into()));
        }
        Ok(receipt)
    }

    async fn upload_content(&self, digest: Digest, data: Vec<u8>) -> Result<(), TransportError> {
        self.uploads.lock().push(digest);
        self.inner.upload_content(digest, data).await
    }
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let fx = fixture(HandlingMode::Normal);
    let flaky = Arc::new(FlakyTransport {
        inner: LocalTransport::new(fx.server.clone()),
        failures: AtomicU32::new(2),
        lost_acks: AtomicU32::new(0),
        uploads: Mutex::new(vec![]),
        receipts: Mutex::new(vec![]),
    });
    let agent = agent_with(&fx, flaky.clone());

    let outcome = agent
        .run_scan(&definition(&fx), &CancelToken::new(), false)
        .await
        .unwrap();
    assert_eq!(outcome.version, 0);
    assert_eq!(flaky.uploads.lock().len(), 2);

    flaky.failures.store(10, Ordering::SeqCst);
    assert!(agent
        .run_scan(&definition(&fx), &CancelToken::new(), false)
        .await
        .is_err());
    // nothing acknowledged on failure
    assert_eq!(agent.state().load("app").unwrap().version, Some(0));
}

#[tokio::test]
async fn test_lost_ack_is_retried_as_duplicate() {
    let fx = fixture(HandlingMode::Normal);
    let flaky = Arc::new(FlakyTransport {
        inner: LocalTransport::new(fx.server.clone()),
        failures: AtomicU32::new(0),
        lost_acks: AtomicU32::new(0),
        uploads: Mutex::new(vec![]),
        receipts: Mutex::new(vec![]),
    });
    let agent = agent_with(&fx, flaky.clone());
    let def = definition(&fx);
    let cancel = CancelToken::new();
    agent.run_scan(&def, &cancel, false).await.unwrap();
    flaky.receipts.lock().clear();

    write(&fx.tree, "server.xml", "<server port=\"9443\"/>");
    flaky.lost_acks.store(1, Ordering::SeqCst);
    let v1 = agent.run_scan(&def, &cancel, false).await.unwrap();

    // delivered once, acknowledged on the redelivery
    assert_eq!(
        *flaky.receipts.lock(),
        vec![IngestOutcome::Appended, IngestOutcome::Duplicate]
    );
    assert_eq!((v1.version, v1.category, v1.outcome), (1, Category::Drift, IngestOutcome::Duplicate));
    assert_eq!(fx.server.history("app").unwrap().len(), 2);
    assert_eq!(fx.journal.read_recent(None).unwrap().len(), 2);
    assert_eq!(agent.state().load("app").unwrap().version, Some(1));

    // the agent stays in step and keeps sending drift
    write(&fx.tree, "conf/app.properties", "threads=16");
    let v2 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v2.version, v2.category, v2.outcome), (2, Category::Drift, IngestOutcome::Appended));
}

// ─── Test 7: scheduler ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_scheduler_scans_on_start_and_wake() {
    let fx = fixture(HandlingMode::Normal);
    let agent = Arc::new(agent(&fx));
    let seen: Arc<Mutex<Vec<ScanOutcome>>> = Arc::new(Mutex::new(vec![]));
    let sink = seen.clone();
    let callback: ScanCallback = Arc::new(move |o: &ScanOutcome| sink.lock().push(o.clone()));

    let (tasks, handle) = spawn_scheduler(
        agent,
        vec![(definition(&fx), Duration::from_secs(3600))],
        2,
        Some(callback),
    );

    wait_for(|| seen.lock().len() == 1).await;
    assert!(handle.request_rebaseline("app"));
    wait_for(|| seen.lock().len() == 2).await;
    assert!(!handle.wake("unknown"));

    handle.shutdown();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
    let seen = seen.lock();
    assert_eq!(seen[0].category, Category::Coverage);
    assert_eq!((seen[1].version, seen[1].category), (1, Category::Coverage));
}

// ─── Test 8: unreadable files ───────────────────────────────────────────────

/// Filesystem walker that refuses to open one chosen file, like a file held
/// under an exclusive lock.
#[derive(Clone, Default)]
struct LockingWalker {
    locked: Arc<Mutex<Option<String>>>,
}

impl TreeWalker for LockingWalker {
    fn walk(&self, base: &Path, filter: &PathFilter) -> drift_core::Result<WalkOutcome> {
        FsWalker.walk(base, filter)
    }

    fn open(&self, file: &WalkedFile) -> io::Result<Box<dyn Read + Send>> {
        if self.locked.lock().as_deref() == Some(file.relative.as_str()) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is locked"));
        }
        FsWalker.open(file)
    }
}

#[tokio::test]
async fn test_locked_file_is_not_reported_as_removed() {
    let fx = fixture(HandlingMode::Normal);
    let walker = LockingWalker::default();
    let agent = DriftAgent::new(
        Snapshotter::new(walker.clone(), ContentHasher::default()),
        Arc::new(LocalTransport::new(fx.server.clone())),
        AgentStateStore::open(&fx.state_dir).unwrap(),
        fast_retry(),
    );
    let def = definition(&fx);
    let cancel = CancelToken::new();
    agent.run_scan(&def, &cancel, false).await.unwrap();
    let before = *fx.server.effective_state("app", 0).unwrap().get("server.xml").unwrap();

    *walker.locked.lock() = Some("server.xml".into());
    write(&fx.tree, "conf/app.properties", "threads=2");
    let v1 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v1.version, v1.entries, v1.warnings.len()), (1, 1, 1));
    let cs = fx.server.change_set("app", 1).unwrap();
    assert!(cs.entries().all(|(_, e)| e.kind == ChangeKind::Changed));
    assert_eq!(fx.server.effective_state("app", 1).unwrap().get("server.xml"), Some(&before));

    *walker.locked.lock() = None;
    let v2 = agent.run_scan(&def, &cancel, false).await.unwrap();
    assert_eq!((v2.version, v2.entries, v2.warnings.len()), (2, 0, 0));
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
