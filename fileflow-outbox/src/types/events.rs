use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, OutboxKind};

/// Outbox lifecycle events for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboxEvent {
    Enqueued {
        message_id: MessageId,
        kind: OutboxKind,
        at: DateTime<Utc>,
    },
    Claimed {
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    Sent {
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    Failed {
        message_id: MessageId,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },
    /// Retry budget exhausted; needs an operator
    DeadLettered {
        message_id: MessageId,
        retry_count: u32,
        error: String,
        at: DateTime<Utc>,
    },
    /// Stale PROCESSING message reset to PENDING
    Recovered {
        message_id: MessageId,
        at: DateTime<Utc>,
    },
}

impl OutboxEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Claimed { .. } => "claimed",
            Self::Sent { .. } => "sent",
            Self::Failed { .. } => "failed",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Recovered { .. } => "recovered",
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Enqueued { message_id, .. }
            | Self::Claimed { message_id, .. }
            | Self::Sent { message_id, .. }
            | Self::Failed { message_id, .. }
            | Self::DeadLettered { message_id, .. }
            | Self::Recovered { message_id, .. } => message_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Claimed { at, .. }
            | Self::Sent { at, .. }
            | Self::Failed { at, .. }
            | Self::DeadLettered { at, .. }
            | Self::Recovered { at, .. } => *at,
        }
    }
}
