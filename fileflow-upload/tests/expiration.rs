use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::ManualClock;
use fileflow_outbox::MemoryOutboxStore;
use tokio::sync::oneshot;

use fileflow_upload::{
    CommitOutcome, ExpirationConfig, ExpirationListener, ExpirationRegistry, ExpiredCursor, MemoryObjectStorage,
    MemorySessionStore, MemoryTtlCache, PartSet, ReconciliationSweep, SessionCommit, SessionCoordinator, SessionId,
    SessionKind, SessionStatus, SessionStore, SweepReport, UploadConfig, UploadError, UploadRequest, UploadResult,
    UploadSession,
};

/// Delegating store whose commits fail for one chosen session.
struct FailingCommits {
    inner: MemorySessionStore,
    poisoned: parking_lot::Mutex<Option<SessionId>>,
}

#[async_trait]
impl SessionStore for FailingCommits {
    async fn insert_or_get(&self, session: UploadSession) -> UploadResult<(UploadSession, bool)> {
        self.inner.insert_or_get(session).await
    }

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.inner.get(id).await
    }

    async fn get_parts(&self, id: &SessionId) -> UploadResult<PartSet> {
        self.inner.get_parts(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> UploadResult<Option<UploadSession>> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn commit(&self, commit: SessionCommit) -> UploadResult<CommitOutcome> {
        if self.poisoned.lock().as_ref() == Some(&commit.session.id) {
            return Err(UploadError::TransientStorage {
                reason: "database unavailable".into(),
            });
        }
        self.inner.commit(commit).await
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&ExpiredCursor>,
        limit: usize,
    ) -> UploadResult<Vec<UploadSession>> {
        self.inner.find_expired(now, after, limit).await
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    cache: Arc<MemoryTtlCache>,
    store: Arc<FailingCommits>,
    coordinator: Arc<SessionCoordinator>,
}

fn harness() -> Harness {
    let clock = ManualClock::starting_now();
    let outbox = Arc::new(MemoryOutboxStore::with_clock(clock.clone()));
    let cache = Arc::new(MemoryTtlCache::with_clock(clock.clone()));
    let store = Arc::new(FailingCommits {
        inner: MemorySessionStore::new(outbox.clone()),
        poisoned: parking_lot::Mutex::new(None),
    });
    let config = UploadConfig::default()
        .with_single_session_ttl(Duration::from_secs(3600))
        .with_multipart_session_ttl(Duration::from_secs(3600));

    let coordinator = SessionCoordinator::new(
        store.clone(),
        Arc::new(MemoryObjectStorage::new()),
        outbox,
        ExpirationRegistry::new(cache.clone()),
    )
    .with_config(config)
    .with_clock(clock.clone());

    Harness {
        clock,
        cache,
        store,
        coordinator: Arc::new(coordinator),
    }
}

fn request(name: &str) -> UploadRequest {
    UploadRequest::new("tenant-a", name, "application/pdf", 1024)
}

async fn sweep(h: &Harness, page_size: usize) -> SweepReport {
    ReconciliationSweep::new(
        h.coordinator.clone(),
        ExpirationConfig::default().with_sweep_page_size(page_size),
    )
    .sweep()
    .await
    .unwrap()
}

#[tokio::test]
async fn test_sweep_expires_session_after_ttl() {
    let h = harness();
    let session = h.coordinator.create_single(request("a.pdf")).await.unwrap();
    let registry = h.coordinator.expirations();
    assert!(registry.is_registered(SessionKind::Single, &session.id).await);

    h.clock.advance(chrono::Duration::minutes(59));
    assert_eq!(sweep(&h, 100).await, SweepReport::default());

    h.clock.advance(chrono::Duration::minutes(2));
    let report = sweep(&h, 100).await;
    assert_eq!(report.scanned, 1);
    assert_eq!(report.expired, 1);

    let stored = h.coordinator.get_session(&session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);
    assert!(h.cache.is_empty());
    assert!(!registry.is_registered(SessionKind::Single, &session.id).await);
}

#[tokio::test]
async fn test_sweep_skips_closed_and_unexpired_sessions() {
    let h = harness();
    let done = h.coordinator.create_single(request("done.pdf")).await.unwrap();
    h.coordinator.activate_single(&done.id).await.unwrap();
    h.coordinator.complete_single(&done.id, "etag").await.unwrap();
    let aborted = h.coordinator.create_single(request("gone.pdf")).await.unwrap();
    h.coordinator.abort(&aborted.id).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(30));
    let fresh = h.coordinator.create_single(request("fresh.pdf")).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(31));

    assert_eq!(sweep(&h, 100).await, SweepReport::default());
    assert_eq!(h.coordinator.get_session(&fresh.id).await.unwrap().status, SessionStatus::Preparing);
}

#[tokio::test]
async fn test_one_failing_session_does_not_stall_the_sweep() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..5 {
        let s = h.coordinator.create_single(request(&format!("f{i}.pdf"))).await.unwrap();
        ids.push(s.id);
        h.clock.advance(chrono::Duration::seconds(1));
    }
    *h.store.poisoned.lock() = Some(ids[1].clone());
    h.clock.advance(chrono::Duration::hours(2));

    let report = sweep(&h, 2).await;
    assert_eq!(
        report,
        SweepReport {
            scanned: 5,
            expired: 4,
            failed: 1
        }
    );
    assert_eq!(h.coordinator.get_session(&ids[1]).await.unwrap().status, SessionStatus::Preparing);

    // Next run picks it up once the store recovers
    *h.store.poisoned.lock() = None;
    let report = sweep(&h, 2).await;
    assert_eq!(report.expired, 1);
}

#[tokio::test]
async fn test_expired_cache_key_reaches_the_listener() {
    let h = harness();
    let session = h.coordinator.create_single(request("l.pdf")).await.unwrap();

    let listener = Arc::new(ExpirationListener::new(h.coordinator.clone(), h.cache.clone()));
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn({
        let listener = listener.clone();
        async move { listener.run(stop_rx).await }
    });
    // let the listener subscribe
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.clock.advance(chrono::Duration::minutes(61));
    let evicted = h.cache.evict_expired();
    assert_eq!(evicted, vec![ExpirationRegistry::cache_key(SessionKind::Single, &session.id)]);

    let mut status = SessionStatus::Preparing;
    for _ in 0..100 {
        status = h.coordinator.get_session(&session.id).await.unwrap().status;
        if status == SessionStatus::Expired {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, SessionStatus::Expired);

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_listener_tolerates_bad_and_early_keys() {
    let h = harness();
    let listener = ExpirationListener::new(h.coordinator.clone(), h.cache.clone());
    let session = h.coordinator.create_single(request("early.pdf")).await.unwrap();

    assert!(!listener.handle_key("some-other-app:key").await);
    assert!(!listener.handle_key("SINGLE:upl_doesnotexist").await);

    // Not yet past expires_at: left for a later notice or the sweep
    let key = ExpirationRegistry::cache_key(SessionKind::Single, &session.id);
    assert!(!listener.handle_key(&key).await);
    assert_eq!(h.coordinator.get_session(&session.id).await.unwrap().status, SessionStatus::Preparing);

    h.clock.advance(chrono::Duration::hours(2));
    assert!(listener.handle_key(&key).await);
    assert!(listener.handle_key(&key).await);
    assert_eq!(h.coordinator.get_session(&session.id).await.unwrap().status, SessionStatus::Expired);
}

#[tokio::test]
async fn test_expire_requires_passing_expiry() {
    let h = harness();
    let session = h.coordinator.create_single(request("x.pdf")).await.unwrap();

    assert!(matches!(
        h.coordinator.expire(&session.id).await,
        Err(UploadError::NotYetExpired { .. })
    ));

    h.clock.set(session.expires_at);
    assert!(matches!(
        h.coordinator.expire(&session.id).await,
        Err(UploadError::NotYetExpired { .. })
    ));

    h.clock.advance(chrono::Duration::milliseconds(1));
    let expired = h.coordinator.expire(&session.id).await.unwrap();
    assert_eq!(expired.status, SessionStatus::Expired);
}
