use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::{SharedClock, SystemClock};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::{
    backend::{BoxStream, OutboxStore},
    backoff::RetryPolicy,
    types::{MessageId, NewOutboxMessage, OutboxEvent, OutboxMessage, OutboxStatus, StatusCounts},
    OutboxError, OutboxResult,
};

struct StoredMessage {
    /// Insertion order; breaks created_at ties
    seq: u64,
    message: OutboxMessage,
}

#[derive(Default)]
struct OutboxTable {
    messages: HashMap<MessageId, StoredMessage>,
    idempotency: HashMap<String, MessageId>,
    next_seq: u64,
}

impl OutboxTable {
    fn insert(&mut self, new: NewOutboxMessage, now: DateTime<Utc>) -> (MessageId, bool) {
        if let Some(existing) = self.idempotency.get(&new.idempotency_key) {
            return (existing.clone(), false);
        }
        let id = MessageId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.idempotency.insert(new.idempotency_key.clone(), id.clone());
        self.messages.insert(
            id.clone(),
            StoredMessage {
                seq,
                message: OutboxMessage::new(id.clone(), new, now),
            },
        );
        (id, true)
    }

    fn oldest_first<F>(&self, limit: usize, mut keep: F) -> Vec<OutboxMessage>
    where
        F: FnMut(&OutboxMessage) -> bool,
    {
        let mut matching: Vec<&StoredMessage> = self
            .messages
            .values()
            .filter(|stored| keep(&stored.message))
            .collect();
        matching.sort_by_key(|stored| (stored.message.created_at, stored.seq));
        matching
            .into_iter()
            .take(limit)
            .map(|stored| stored.message.clone())
            .collect()
    }

    fn checked_mut(&mut self, id: &MessageId, expected_version: u64) -> OutboxResult<&mut OutboxMessage> {
        let stored = self
            .messages
            .get_mut(id)
            .ok_or_else(|| OutboxError::MessageNotFound(id.to_string()))?;
        if stored.message.version != expected_version {
            return Err(OutboxError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: stored.message.version,
            });
        }
        Ok(&mut stored.message)
    }
}

/// In-memory outbox for tests and single-node development
#[derive(Clone)]
pub struct MemoryOutboxStore {
    table: Arc<RwLock<OutboxTable>>,
    clock: SharedClock,
    event_broadcaster: broadcast::Sender<OutboxEvent>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);
        Self {
            table: Arc::new(RwLock::new(OutboxTable::default())),
            clock,
            event_broadcaster,
        }
    }

    /// Insert messages as part of an enclosing domain commit.
    ///
    /// Synchronous so callers can invoke it while holding their own lock,
    /// making the domain write and the outbox write one unit.
    pub fn insert_staged(&self, messages: Vec<NewOutboxMessage>) -> Vec<MessageId> {
        let now = self.clock.now();
        let mut events = Vec::new();
        let ids = {
            let mut table = self.table.write();
            messages
                .into_iter()
                .map(|new| {
                    let kind = new.kind;
                    let (id, inserted) = table.insert(new, now);
                    if inserted {
                        events.push(OutboxEvent::Enqueued {
                            message_id: id.clone(),
                            kind,
                            at: now,
                        });
                    }
                    id
                })
                .collect()
        };
        for event in events {
            let _ = self.event_broadcaster.send(event);
        }
        ids
    }

    /// Whether a key is already taken (staged commits check before writing).
    pub fn contains_key(&self, idempotency_key: &str) -> bool {
        self.table.read().idempotency.contains_key(idempotency_key)
    }

    /// Raw receiver, for callers that want lag errors surfaced.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboxEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Every message, oldest first (test and admin helper).
    pub fn all(&self) -> Vec<OutboxMessage> {
        self.table.read().oldest_first(usize::MAX, |_| true)
    }

    fn emit(&self, event: OutboxEvent) {
        let _ = self.event_broadcaster.send(event);
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> OutboxResult<MessageId> {
        let mut ids = self.insert_staged(vec![message]);
        ids.pop()
            .ok_or_else(|| OutboxError::Internal("enqueue produced no id".to_string()))
    }

    async fn get(&self, id: &MessageId) -> OutboxResult<OutboxMessage> {
        self.table
            .read()
            .messages
            .get(id)
            .map(|stored| stored.message.clone())
            .ok_or_else(|| OutboxError::MessageNotFound(id.to_string()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> OutboxResult<Option<OutboxMessage>> {
        let table = self.table.read();
        Ok(table
            .idempotency
            .get(key)
            .and_then(|id| table.messages.get(id))
            .map(|stored| stored.message.clone()))
    }

    async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        Ok(self
            .table
            .read()
            .oldest_first(limit, |m| m.status == OutboxStatus::Pending))
    }

    async fn find_retryable(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        Ok(self.table.read().oldest_first(limit, |m| policy.is_due(m, now)))
    }

    async fn try_claim(
        &self,
        id: &MessageId,
        expected_status: OutboxStatus,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<Option<OutboxMessage>> {
        if !expected_status.is_claimable() {
            return Err(OutboxError::InvalidTransition {
                id: id.to_string(),
                current: expected_status,
                requested: OutboxStatus::Processing,
            });
        }

        let claimed = {
            let mut table = self.table.write();
            let stored = table
                .messages
                .get_mut(id)
                .ok_or_else(|| OutboxError::MessageNotFound(id.to_string()))?;
            let message = &mut stored.message;
            if message.status != expected_status || message.version != expected_version {
                // zero rows affected
                None
            } else {
                message.mark_processing(now);
                Some(message.clone())
            }
        };

        if let Some(ref message) = claimed {
            self.emit(OutboxEvent::Claimed {
                message_id: message.id.clone(),
                at: now,
            });
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: &MessageId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<OutboxMessage> {
        let sent = {
            let mut table = self.table.write();
            let message = table.checked_mut(id, expected_version)?;
            if message.status != OutboxStatus::Processing {
                return Err(OutboxError::InvalidTransition {
                    id: id.to_string(),
                    current: message.status,
                    requested: OutboxStatus::Sent,
                });
            }
            message.mark_sent(now);
            message.clone()
        };

        self.emit(OutboxEvent::Sent {
            message_id: sent.id.clone(),
            at: now,
        });
        Ok(sent)
    }

    async fn mark_failed(
        &self,
        id: &MessageId,
        expected_version: u64,
        error: String,
        dead_letter: bool,
        now: DateTime<Utc>,
    ) -> OutboxResult<OutboxMessage> {
        let failed = {
            let mut table = self.table.write();
            let message = table.checked_mut(id, expected_version)?;
            if message.status != OutboxStatus::Processing {
                return Err(OutboxError::InvalidTransition {
                    id: id.to_string(),
                    current: message.status,
                    requested: OutboxStatus::Failed,
                });
            }
            message.mark_failed(error.clone(), now);
            message.clone()
        };

        let event = if dead_letter {
            OutboxEvent::DeadLettered {
                message_id: failed.id.clone(),
                retry_count: failed.retry_count,
                error,
                at: now,
            }
        } else {
            OutboxEvent::Failed {
                message_id: failed.id.clone(),
                retry_count: failed.retry_count,
                error,
                at: now,
            }
        };
        self.emit(event);
        Ok(failed)
    }

    async fn find_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        Ok(self.table.read().oldest_first(limit, |m| {
            m.status == OutboxStatus::Processing
                && m.processing_started_at.map_or(true, |at| at < started_before)
        }))
    }

    async fn reset_stale(
        &self,
        id: &MessageId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool> {
        let reset = {
            let mut table = self.table.write();
            let stored = table
                .messages
                .get_mut(id)
                .ok_or_else(|| OutboxError::MessageNotFound(id.to_string()))?;
            let message = &mut stored.message;
            if message.status != OutboxStatus::Processing || message.version != expected_version {
                false
            } else {
                message.reset_to_pending(now);
                true
            }
        };

        if reset {
            self.emit(OutboxEvent::Recovered {
                message_id: id.clone(),
                at: now,
            });
        }
        Ok(reset)
    }

    async fn find_dead_letters(
        &self,
        max_retry_count: u32,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>> {
        Ok(self
            .table
            .read()
            .oldest_first(limit, |m| m.is_dead_lettered(max_retry_count)))
    }

    async fn count_by_status(&self) -> OutboxResult<StatusCounts> {
        let table = self.table.read();
        let mut counts = StatusCounts::default();
        for stored in table.messages.values() {
            counts.add(stored.message.status);
        }
        Ok(counts)
    }

    fn event_stream(&self) -> BoxStream<OutboxEvent> {
        let receiver = self.event_broadcaster.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PayloadRef;
    use fileflow_core::ManualClock;

    fn new_message(key: &str) -> NewOutboxMessage {
        NewOutboxMessage::queue_dispatch(key, PayloadRef::new("upl_1"))
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_existing_id() {
        let store = MemoryOutboxStore::new();

        let first = store.enqueue(new_message("upload-completed:upl_1")).await.unwrap();
        let second = store.enqueue(new_message("upload-completed:upl_1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_by_status().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn pending_is_returned_oldest_first_even_with_equal_timestamps() {
        let clock = ManualClock::starting_now();
        let store = MemoryOutboxStore::with_clock(clock.clone());

        let a = store.enqueue(new_message("a")).await.unwrap();
        let b = store.enqueue(new_message("b")).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let c = store.enqueue(new_message("c")).await.unwrap();

        let pending: Vec<MessageId> = store
            .find_pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(pending, vec![a, b, c]);
        assert_eq!(store.find_pending(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn claim_with_stale_version_affects_nothing() {
        let store = MemoryOutboxStore::new();
        let id = store.enqueue(new_message("k")).await.unwrap();
        let now = Utc::now();

        let claimed = store
            .try_claim(&id, OutboxStatus::Pending, 0, now)
            .await
            .unwrap()
            .expect("first claim wins");
        assert_eq!(claimed.status, OutboxStatus::Processing);

        let again = store.try_claim(&id, OutboxStatus::Pending, 0, now).await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn cannot_claim_from_processing_or_sent() {
        let store = MemoryOutboxStore::new();
        let id = store.enqueue(new_message("k")).await.unwrap();

        let err = store
            .try_claim(&id, OutboxStatus::Processing, 0, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn mark_sent_requires_processing_and_matching_version() {
        let store = MemoryOutboxStore::new();
        let id = store.enqueue(new_message("k")).await.unwrap();
        let now = Utc::now();

        let err = store.mark_sent(&id, 0, now).await.unwrap_err();
        assert!(matches!(err, OutboxError::InvalidTransition { .. }));

        let claimed = store
            .try_claim(&id, OutboxStatus::Pending, 0, now)
            .await
            .unwrap()
            .unwrap();
        let err = store.mark_sent(&id, claimed.version + 7, now).await.unwrap_err();
        assert!(matches!(err, OutboxError::VersionConflict { .. }));

        let sent = store.mark_sent(&id, claimed.version, now).await.unwrap();
        assert_eq!(sent.status, OutboxStatus::Sent);
        assert_eq!(sent.processed_at, Some(now));
    }

    #[tokio::test]
    async fn staged_inserts_broadcast_enqueued_once() {
        let store = MemoryOutboxStore::new();
        let mut events = store.event_stream();

        let ids = store.insert_staged(vec![new_message("x"), new_message("x")]);
        assert_eq!(ids[0], ids[1]);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name(), "enqueued");
        assert!(store.contains_key("x"));
        assert_eq!(store.all().len(), 1);
    }
}
