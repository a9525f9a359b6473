pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;

use crate::{
    backoff::RetryPolicy,
    types::{MessageId, NewOutboxMessage, OutboxEvent, OutboxMessage, OutboxStatus, StatusCounts},
    OutboxResult,
};

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives for the outbox.
///
/// Every mutating call is conditional on the caller's view of the message
/// (status and version), so several dispatchers can share one store.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a PENDING message. Re-using an idempotency key returns the
    /// existing message id and inserts nothing.
    async fn enqueue(&self, message: NewOutboxMessage) -> OutboxResult<MessageId>;

    async fn get(&self, id: &MessageId) -> OutboxResult<OutboxMessage>;

    async fn find_by_idempotency_key(&self, key: &str) -> OutboxResult<Option<OutboxMessage>>;

    /// PENDING messages, oldest first.
    async fn find_pending(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>>;

    /// FAILED messages with budget left whose backoff has elapsed, oldest first.
    async fn find_retryable(
        &self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>>;

    /// Atomically move a message to PROCESSING if it is still in
    /// `expected_status` at `expected_version`. `None` means another
    /// claimant won.
    async fn try_claim(
        &self,
        id: &MessageId,
        expected_status: OutboxStatus,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<Option<OutboxMessage>>;

    async fn mark_sent(
        &self,
        id: &MessageId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<OutboxMessage>;

    /// Record a failed delivery. `dead_letter` only changes which event is
    /// broadcast; the status is FAILED either way.
    async fn mark_failed(
        &self,
        id: &MessageId,
        expected_version: u64,
        error: String,
        dead_letter: bool,
        now: DateTime<Utc>,
    ) -> OutboxResult<OutboxMessage>;

    /// PROCESSING messages claimed before `started_before`.
    async fn find_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>>;

    /// Conditionally reset a stale PROCESSING message to PENDING.
    /// Returns false if it changed since it was read.
    async fn reset_stale(
        &self,
        id: &MessageId,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> OutboxResult<bool>;

    /// FAILED messages whose retry budget is spent.
    async fn find_dead_letters(
        &self,
        max_retry_count: u32,
        limit: usize,
    ) -> OutboxResult<Vec<OutboxMessage>>;

    async fn count_by_status(&self) -> OutboxResult<StatusCounts>;

    /// Event stream for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<OutboxEvent>;
}
