use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{MessageId, NewOutboxMessage, OutboxKind, PayloadRef};

/// Outbox message lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Written alongside the domain change, waiting for the dispatcher
    Pending,
    /// Claimed by a dispatcher; the sink call is in flight
    Processing,
    /// Delivered (terminal)
    Sent,
    /// Last delivery failed; retried with backoff until the retry budget runs out
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    /// Statuses a dispatcher may claim from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted outbox envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub kind: OutboxKind,
    pub idempotency_key: String,
    pub payload: PayloadRef,
    pub status: OutboxStatus,
    /// Number of FAILED outcomes so far
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Bumped on every write; conditional updates compare against it
    pub version: u64,
}

impl OutboxMessage {
    pub fn new(id: MessageId, message: NewOutboxMessage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: message.kind,
            idempotency_key: message.idempotency_key,
            payload: message.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processed_at: None,
            version: 0,
        }
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.processing_started_at = Some(now);
        self.touch(now);
    }

    pub(crate) fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.processed_at = Some(now);
        self.last_error = None;
        self.touch(now);
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = OutboxStatus::Failed;
        self.retry_count += 1;
        self.last_error = Some(error);
        self.touch(now);
    }

    /// Stale recovery: back to PENDING, retry budget untouched.
    pub(crate) fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.processing_started_at = None;
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }

    /// True when the message has used up its retry budget.
    pub fn is_dead_lettered(&self, max_retry_count: u32) -> bool {
        self.status == OutboxStatus::Failed && self.retry_count >= max_retry_count
    }
}

/// Per-status counts for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.sent + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Processing => self.processing += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboxMessage {
        OutboxMessage::new(
            MessageId::new(),
            NewOutboxMessage::queue_dispatch("k", PayloadRef::new("upl_1")),
            Utc::now(),
        )
    }

    #[test]
    fn failure_bumps_retry_count_and_version() {
        let mut msg = message();
        let now = Utc::now();
        msg.mark_processing(now);
        msg.mark_failed("HTTP 500".to_string(), now);

        assert_eq!(msg.status, OutboxStatus::Failed);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.version, 2);
        assert_eq!(msg.last_error.as_deref(), Some("HTTP 500"));
        assert!(!msg.is_dead_lettered(3));
    }

    #[test]
    fn stale_reset_keeps_retry_count() {
        let mut msg = message();
        let now = Utc::now();
        msg.mark_processing(now);
        msg.mark_failed("x".to_string(), now);
        msg.mark_processing(now);
        msg.reset_to_pending(now);

        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.retry_count, 1);
        assert!(msg.processing_started_at.is_none());
    }

    #[test]
    fn only_pending_and_failed_are_claimable() {
        assert!(OutboxStatus::Pending.is_claimable());
        assert!(OutboxStatus::Failed.is_claimable());
        assert!(!OutboxStatus::Processing.is_claimable());
        assert!(!OutboxStatus::Sent.is_claimable());
        assert!(OutboxStatus::Sent.is_terminal());
    }
}
