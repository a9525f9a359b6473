use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_outbox::MemoryOutboxStore;
use parking_lot::RwLock;

use super::{CommitOutcome, ExpiredCursor, SessionCommit, SessionStore};
use crate::{
    parts::PartSet,
    session::UploadSession,
    types::SessionId,
    UploadError, UploadResult,
};

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, UploadSession>,
    parts: HashMap<SessionId, PartSet>,
    idempotency: HashMap<String, SessionId>,
}

/// In-memory session store sharing its commits with a [`MemoryOutboxStore`].
///
/// Outbox rows are staged while the session table's write lock is held, so
/// no reader sees a committed session without its messages.
#[derive(Clone)]
pub struct MemorySessionStore {
    table: Arc<RwLock<SessionTable>>,
    outbox: Arc<MemoryOutboxStore>,
}

impl MemorySessionStore {
    pub fn new(outbox: Arc<MemoryOutboxStore>) -> Self {
        Self {
            table: Arc::new(RwLock::new(SessionTable::default())),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<MemoryOutboxStore> {
        &self.outbox
    }

    pub fn len(&self) -> usize {
        self.table.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_or_get(&self, mut session: UploadSession) -> UploadResult<(UploadSession, bool)> {
        let mut table = self.table.write();
        if let Some(existing) = table.idempotency.get(&session.idempotency_key) {
            let stored = table
                .sessions
                .get(existing)
                .cloned()
                .ok_or_else(|| UploadError::not_found(existing))?;
            return Ok((stored, false));
        }
        session.version = 1;
        table
            .idempotency
            .insert(session.idempotency_key.clone(), session.id.clone());
        table.sessions.insert(session.id.clone(), session.clone());
        Ok((session, true))
    }

    async fn get(&self, id: &SessionId) -> UploadResult<UploadSession> {
        self.table
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::not_found(id))
    }

    async fn get_parts(&self, id: &SessionId) -> UploadResult<PartSet> {
        let table = self.table.read();
        if !table.sessions.contains_key(id) {
            return Err(UploadError::not_found(id));
        }
        Ok(table.parts.get(id).cloned().unwrap_or_default())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> UploadResult<Option<UploadSession>> {
        let table = self.table.read();
        Ok(table
            .idempotency
            .get(key)
            .and_then(|id| table.sessions.get(id))
            .cloned())
    }

    async fn commit(&self, commit: SessionCommit) -> UploadResult<CommitOutcome> {
        let SessionCommit {
            mut session,
            expected_version,
            parts,
            outbox,
        } = commit;

        let mut table = self.table.write();
        let current = table
            .sessions
            .get(&session.id)
            .ok_or_else(|| UploadError::not_found(&session.id))?;
        if current.version != expected_version {
            return Err(UploadError::concurrent(&session.id));
        }

        session.version = expected_version + 1;
        if let Some(parts) = parts {
            table.parts.insert(session.id.clone(), parts);
        }
        table.sessions.insert(session.id.clone(), session.clone());
        let message_ids = if outbox.is_empty() {
            Vec::new()
        } else {
            self.outbox.insert_staged(outbox)
        };

        Ok(CommitOutcome { session, message_ids })
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        after: Option<&ExpiredCursor>,
        limit: usize,
    ) -> UploadResult<Vec<UploadSession>> {
        let table = self.table.read();
        let mut expired: Vec<&UploadSession> = table
            .sessions
            .values()
            .filter(|s| s.status.is_open() && s.expires_at < now)
            .filter(|s| match after {
                Some(cursor) => (s.expires_at, &s.id) > (cursor.expires_at, &cursor.id),
                None => true,
            })
            .collect();
        expired.sort_by(|a, b| (a.expires_at, &a.id).cmp(&(b.expires_at, &b.id)));
        Ok(expired.into_iter().take(limit).cloned().collect())
    }
}
