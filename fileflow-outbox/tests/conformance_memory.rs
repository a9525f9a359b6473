use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fileflow_core::{Clock, ManualClock};
use parking_lot::Mutex;
use tokio_stream::StreamExt;

use fileflow_outbox::{
    webhook_key, ChannelSink, DispatchConfig, MemoryOutboxStore, MemoryTaskStore, NewDownloadTask, NewOutboxMessage,
    OutboxDispatcher, OutboxEvent, OutboxKind, OutboxMessage, OutboxSink, OutboxStatus, OutboxStore,
    PayloadRef, RetryPolicy, SinkError, SinkRegistry, StaleRecovery, StaleRecoveryConfig, TaskStatus,
    TaskStore, ZombieConfig, ZombieReaper,
};

/// Sink that records deliveries and can be told to fail.
struct RecordingSink {
    delivered: Mutex<Vec<String>>,
    fail_with: Mutex<Option<SinkError>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    fn failing(error: SinkError) -> Arc<Self> {
        let sink = Self::new();
        *sink.fail_with.lock() = Some(error);
        sink
    }
}

#[async_trait]
impl OutboxSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), SinkError> {
        self.delivered.lock().push(message.payload.subject.clone());
        match self.fail_with.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn upload_completed(session: &str) -> NewOutboxMessage {
    NewOutboxMessage::queue_dispatch(
        format!("upload-completed:{}", session),
        PayloadRef::new(session).with_attribute("event", "upload.completed"),
    )
}

fn registry(sink: Arc<dyn OutboxSink>) -> SinkRegistry {
    SinkRegistry::new().with_sink(OutboxKind::QueueDispatch, sink)
}

/// C1. Two dispatchers racing on one PENDING message: exactly one claims it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_dispatchers_claim_once() {
    let store = Arc::new(MemoryOutboxStore::new());
    let sink = RecordingSink::new();

    // Arrange: one message, two independent dispatcher instances sharing the store
    let id = store.enqueue(upload_completed("upl_race")).await.unwrap();
    let a = Arc::new(OutboxDispatcher::new(store.clone(), registry(sink.clone())));
    let b = Arc::new(OutboxDispatcher::new(store.clone(), registry(sink.clone())));

    // Act
    let ta = tokio::spawn({
        let a = a.clone();
        async move { a.run_tick().await }
    });
    let tb = tokio::spawn({
        let b = b.clone();
        async move { b.run_tick().await }
    });
    let ra = ta.await.unwrap().unwrap();
    let rb = tb.await.unwrap().unwrap();

    // Assert: one claim in total, delivered once, SENT
    assert_eq!(ra.claimed + rb.claimed, 1);
    assert_eq!(sink.delivered.lock().as_slice(), ["upl_race"]);
    assert_eq!(store.get(&id).await.unwrap().status, OutboxStatus::Sent);
}

/// C1b. Same race at the store level: both read the row, one update wins
#[tokio::test]
async fn test_conditional_claim_has_single_winner() {
    let store = Arc::new(MemoryOutboxStore::new());
    store.enqueue(upload_completed("upl_race")).await.unwrap();

    // Both claimants observe the same PENDING row at the same version
    let seen_by_a = store.find_pending(10).await.unwrap().remove(0);
    let seen_by_b = store.find_pending(10).await.unwrap().remove(0);
    assert_eq!(seen_by_a, seen_by_b);

    let now = Utc::now();
    let (wa, wb) = tokio::join!(
        store.try_claim(&seen_by_a.id, seen_by_a.status, seen_by_a.version, now),
        store.try_claim(&seen_by_b.id, seen_by_b.status, seen_by_b.version, now),
    );
    let winners = [wa.unwrap(), wb.unwrap()].iter().filter(|w| w.is_some()).count();
    assert_eq!(winners, 1);
}

/// C2. A non-stale PROCESSING message cannot be claimed again
#[tokio::test]
async fn test_processing_message_is_not_reclaimed() {
    let store = Arc::new(MemoryOutboxStore::new());
    let id = store.enqueue(upload_completed("upl_1")).await.unwrap();

    let claimed = store
        .try_claim(&id, OutboxStatus::Pending, 0, Utc::now())
        .await
        .unwrap()
        .unwrap();

    // Another dispatcher only sees PENDING/FAILED candidates
    assert!(store.find_pending(10).await.unwrap().is_empty());
    assert!(store
        .find_retryable(&RetryPolicy::default(), Utc::now() + chrono::Duration::days(1), 10)
        .await
        .unwrap()
        .is_empty());

    // And a claim with its old view affects zero rows
    let again = store
        .try_claim(&id, OutboxStatus::Pending, claimed.version - 1, Utc::now())
        .await
        .unwrap();
    assert!(again.is_none());
}

/// C3. PENDING never goes to SENT without passing through PROCESSING
#[tokio::test]
async fn test_sent_is_always_preceded_by_claim() {
    let store = Arc::new(MemoryOutboxStore::new());
    let mut events = store.event_stream();
    let sink = RecordingSink::new();
    let dispatcher = OutboxDispatcher::new(store.clone(), registry(sink));

    store.enqueue(upload_completed("upl_1")).await.unwrap();
    store.enqueue(upload_completed("upl_2")).await.unwrap();
    let report = dispatcher.run_tick().await.unwrap();
    assert_eq!(report.sent, 2);

    let mut names = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.next()).await {
        names.push((event.message_id().clone(), event.event_name()));
    }

    for (id, name) in &names {
        if *name == "sent" {
            let claimed_at = names.iter().position(|(i, n)| i == id && *n == "claimed");
            let sent_at = names.iter().position(|(i, n)| i == id && *n == "sent");
            assert!(claimed_at.is_some());
            assert!(claimed_at < sent_at);
        }
    }
    assert_eq!(names.iter().filter(|(_, n)| *n == "sent").count(), 2);
}

/// C4. Dead letters are broadcast and never claimed again
#[tokio::test]
async fn test_dead_letter_event_and_exclusion() {
    let clock = ManualClock::starting_now();
    let store = Arc::new(MemoryOutboxStore::with_clock(clock.clone()));
    let mut events = store.event_stream();
    let sink = RecordingSink::failing(SinkError::Rejected { status: 503 });
    let config = DispatchConfig::default().with_retry(RetryPolicy::default().with_max_retry_count(1));
    let dispatcher = OutboxDispatcher::with_config(store.clone(), registry(sink.clone()), config)
        .with_clock(clock.clone());

    let id = store.enqueue(upload_completed("upl_dead")).await.unwrap();
    let report = dispatcher.run_tick().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    clock.advance(chrono::Duration::days(7));
    assert_eq!(dispatcher.run_tick().await.unwrap().claimed, 0);
    assert_eq!(sink.delivered.lock().len(), 1);

    let mut saw_dead_letter = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), events.next()).await {
        if let OutboxEvent::DeadLettered { message_id, retry_count, .. } = event {
            assert_eq!(message_id, id);
            assert_eq!(retry_count, 1);
            saw_dead_letter = true;
        }
    }
    assert!(saw_dead_letter);
}

/// C5. A crashed dispatcher's claim is recovered and redelivered
#[test_log::test(tokio::test)]
async fn test_stale_claim_is_recovered_then_delivered() {
    let clock = ManualClock::starting_now();
    let store = Arc::new(MemoryOutboxStore::with_clock(clock.clone()));
    let (sink, mut rx) = ChannelSink::bounded(8);
    let dispatcher = OutboxDispatcher::new(store.clone(), registry(Arc::new(sink))).with_clock(clock.clone());
    let recovery = StaleRecovery::new(
        store.clone(),
        StaleRecoveryConfig::default().with_stale_threshold(Duration::from_secs(30 * 60)),
    )
    .with_clock(clock.clone());

    // Arrange: claimed by a dispatcher that never resolved it
    let id = store.enqueue(upload_completed("upl_crash")).await.unwrap();
    store
        .try_claim(&id, OutboxStatus::Pending, 0, clock.now())
        .await
        .unwrap()
        .unwrap();

    // Not stale yet
    clock.advance(chrono::Duration::minutes(29));
    assert_eq!(recovery.recover().await.unwrap(), 0);

    // Act
    clock.advance(chrono::Duration::minutes(2));
    assert_eq!(recovery.recover().await.unwrap(), 1);
    let report = dispatcher.run_tick().await.unwrap();

    // Assert
    assert_eq!(report.sent, 1);
    let message = store.get(&id).await.unwrap();
    assert_eq!(message.status, OutboxStatus::Sent);
    assert_eq!(message.retry_count, 0);
    assert_eq!(rx.recv().await.unwrap().id, id);
}

/// Z1. Zombie download is requeued with attempt + 1, then dead-lettered
#[tokio::test]
async fn test_zombie_task_requeue_and_exhaustion() {
    let clock = ManualClock::starting_now();
    let outbox = Arc::new(MemoryOutboxStore::with_clock(clock.clone()));
    let store = Arc::new(MemoryTaskStore::with_clock(outbox.clone(), clock.clone()));
    let reaper = ZombieReaper::new(store.clone(), ZombieConfig::default()).with_clock(clock.clone());

    let task = store
        .create(
            NewDownloadTask::new("t1", "https://src.test/big.mov", "media", "t1/big.mov")
                .with_webhook("https://client.test/downloads")
                .with_max_attempts(2),
        )
        .await
        .unwrap();
    assert_eq!(task.created_at, clock.now());

    // First run hangs
    store.claim_next_queued(clock.now()).await.unwrap().unwrap();
    clock.advance(chrono::Duration::minutes(11));
    let report = reaper.reap().await.unwrap();
    assert_eq!(report.requeued, 1);
    let requeued = store.get(&task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.attempt, 1);

    // Second (last) run hangs too
    store.claim_next_queued(clock.now()).await.unwrap().unwrap();
    clock.advance(chrono::Duration::minutes(5));
    assert_eq!(reaper.reap().await.unwrap().requeued, 0);
    clock.advance(chrono::Duration::minutes(6));
    let report = reaper.reap().await.unwrap();
    assert_eq!(report.dead_lettered, 1);

    let failed = store.get(&task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("exhausted after 2 attempts (stuck in DOWNLOADING)")
    );

    // Requeues stay silent; exhaustion notifies the webhook once
    let messages = outbox.all();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, OutboxKind::Webhook);
    assert_eq!(messages[0].idempotency_key, webhook_key(&task.id));
    assert_eq!(messages[0].payload.attribute("event"), Some("download.failed"));
    assert_eq!(messages[0].payload.attribute("url"), Some("https://client.test/downloads"));
}

/// Z2. A task that finishes between the scan and the update is left alone
#[tokio::test]
async fn test_zombie_lost_race_is_skipped() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let store = Arc::new(MemoryTaskStore::new(outbox.clone()));
    store
        .create(NewDownloadTask::new("t1", "https://src.test/a", "media", "t1/a").with_webhook("https://client.test/dl"))
        .await
        .unwrap();
    let started = Utc::now() - chrono::Duration::hours(1);
    let claimed = store.claim_next_queued(started).await.unwrap().unwrap();

    let stuck = store.find_stuck(Utc::now(), 10).await.unwrap();
    assert_eq!(stuck.len(), 1);

    store.complete(&claimed.id, claimed.version, Utc::now()).await.unwrap();
    let outcome = store
        .requeue_stuck(&claimed.id, claimed.version, "stuck".into(), Utc::now())
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(store.get(&claimed.id).await.unwrap().status, TaskStatus::Completed);

    let dead = store
        .dead_letter_stuck(&claimed.id, claimed.version, "stuck".into(), Utc::now())
        .await
        .unwrap();
    assert!(dead.is_none());
    let events: Vec<_> = outbox.all().iter().map(|m| m.payload.attribute("event").map(str::to_string)).collect();
    assert_eq!(events, vec![Some("download.completed".to_string())]);
}

/// Z3. Finished downloads write their webhook message in the same store write
#[tokio::test]
async fn test_download_outcomes_stage_webhook_messages() {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let store = MemoryTaskStore::new(outbox.clone());
    let hook = "https://client.test/dl";

    let ok = store
        .create(NewDownloadTask::new("t1", "https://src.test/ok", "media", "t1/ok").with_webhook(hook))
        .await
        .unwrap();
    let claimed = store.claim_next_queued(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, ok.id);
    assert!(outbox.all().is_empty());
    store.complete(&claimed.id, claimed.version, Utc::now()).await.unwrap();

    let bad = store
        .create(NewDownloadTask::new("t1", "https://src.test/bad", "media", "t1/bad").with_webhook(hook))
        .await
        .unwrap();
    let claimed = store.claim_next_queued(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, bad.id);
    store.fail(&claimed.id, claimed.version, "403 from source".into(), Utc::now()).await.unwrap();

    store
        .create(NewDownloadTask::new("t1", "https://src.test/quiet", "media", "t1/quiet"))
        .await
        .unwrap();
    let claimed = store.claim_next_queued(Utc::now()).await.unwrap().unwrap();
    store.complete(&claimed.id, claimed.version, Utc::now()).await.unwrap();

    let messages = outbox.all();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.kind == OutboxKind::Webhook && m.status == OutboxStatus::Pending));
    let ok_msg = outbox.find_by_idempotency_key(&webhook_key(&ok.id)).await.unwrap().unwrap();
    assert_eq!(ok_msg.payload.attribute("event"), Some("download.completed"));
    let bad_msg = outbox.find_by_idempotency_key(&webhook_key(&bad.id)).await.unwrap().unwrap();
    assert_eq!(bad_msg.payload.attribute("event"), Some("download.failed"));
    assert_eq!(bad_msg.payload.attribute("error"), Some("403 from source"));
}
