//! Session persistence.
//!
//! Session mutations go through [`SessionStore::commit`], which checks the
//! caller's expected version and writes the new session value, its parts and
//! any outbox messages as one unit.

mod memory;

pub use memory::MemorySessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_outbox::{MessageId, NewOutboxMessage};

use crate::{
    parts::PartSet,
    session::UploadSession,
    types::SessionId,
    UploadResult,
};

/// Everything one state change writes
#[derive(Debug, Clone)]
pub struct SessionCommit {
    pub session: UploadSession,
    /// Version the caller read; the commit fails if the stored one differs
    pub expected_version: u64,
    /// Replaces the stored part set when present
    pub parts: Option<PartSet>,
    pub outbox: Vec<NewOutboxMessage>,
}

impl SessionCommit {
    pub fn new(session: UploadSession, expected_version: u64) -> Self {
        Self {
            session,
            expected_version,
            parts: None,
            outbox: Vec::new(),
        }
    }

    pub fn with_parts(mut self, parts: PartSet) -> Self {
        self.parts = Some(parts);
        self
    }

    pub fn with_outbox(mut self, messages: Vec<NewOutboxMessage>) -> Self {
        self.outbox = messages;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Stored value, with its new version
    pub session: UploadSession,
    /// One id per staged message, in order
    pub message_ids: Vec<MessageId>,
}

/// Keyset position for paging through expired sessions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiredCursor {
    pub expires_at: DateTime<Utc>,
    pub id: SessionId,
}

impl ExpiredCursor {
    pub fn after(session: &UploadSession) -> Self {
        Self {
            expires_at: session.expires_at,
            id: session.id.clone(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session unless its idempotency key is taken. Returns the
    /// stored session and whether it was created by this call.
    async fn insert_or_get(&self, session: UploadSession) -> UploadResult<(UploadSession, bool)>;

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession>;

    /// Part set of a multipart session; empty for single uploads.
    async fn get_parts(&self, id: &SessionId) -> UploadResult<PartSet>;

    async fn find_by_idempotency_key(&self, key: &str) -> UploadResult<Option<UploadSession>>;

    /// Version-checked write. A stale `expected_version` yields
    /// `ConcurrentModification` and writes nothing.
    async fn commit(&self, commit: SessionCommit) -> UploadResult<CommitOutcome>;

    /// PREPARING or ACTIVE sessions with `expires_at < now`, ordered by
    /// `(expires_at, id)` and strictly after `after`.
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&ExpiredCursor>,
        limit: usize,
    ) -> UploadResult<Vec<UploadSession>>;
}
