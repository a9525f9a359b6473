use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{SessionId, SessionKind};

/// Domain events produced by session transitions.
///
/// The coordinator persists these with the new session value in one commit
/// and derives outbox messages from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Activated {
        session_id: SessionId,
        kind: SessionKind,
        at: DateTime<Utc>,
    },
    /// An ACTIVE single upload got a fresh presigned URL
    UrlReissued {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
    PartRecorded {
        session_id: SessionId,
        part_number: u32,
        at: DateTime<Utc>,
    },
    Completed {
        session_id: SessionId,
        kind: SessionKind,
        etag: Option<String>,
        at: DateTime<Utc>,
    },
    Aborted {
        session_id: SessionId,
        reason: String,
        at: DateTime<Utc>,
    },
    Expired {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "upload.activated",
            Self::UrlReissued { .. } => "upload.url_reissued",
            Self::PartRecorded { .. } => "upload.part_recorded",
            Self::Completed { .. } => "upload.completed",
            Self::Aborted { .. } => "upload.aborted",
            Self::Expired { .. } => "upload.expired",
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Activated { session_id, .. }
            | Self::UrlReissued { session_id, .. }
            | Self::PartRecorded { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Aborted { session_id, .. }
            | Self::Expired { session_id, .. } => session_id,
        }
    }

    /// True for events that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Aborted { .. } | Self::Expired { .. }
        )
    }
}
