//! # Session coordinator
//!
//! Drives sessions through their lifecycle. Every mutation follows the same
//! shape: read the session, compute the next value with the pure transition
//! functions, make any object-storage call outside the commit, then commit
//! with the version that was read. A racing writer turns the late commit
//! into `ConcurrentModification` instead of overwriting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fileflow_core::{SharedClock, SystemClock};
use fileflow_outbox::{NewOutboxMessage, OutboxError, OutboxStore, PayloadRef};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::UploadConfig,
    expiration::ExpirationRegistry,
    parts::{CompletedPart, PartSet},
    receipt::{callback_key, completion_key, CompletionReceipt},
    session::{SessionDetail, SessionStatus, Transition, UploadSession},
    storage::{ObjectStoragePort, StorageError},
    store::{SessionCommit, SessionStore},
    types::{
        DatePartitionedKeys, MultipartRequest, ObjectLocation, ReportedPart, SessionId, SessionKind,
        StorageKeyStrategy, UploadRequest,
    },
    UploadError, UploadResult,
};

const CLIENT_ABORT_REASON: &str = "aborted by client";

pub struct SessionCoordinator {
    sessions: Arc<dyn SessionStore>,
    storage: Arc<dyn ObjectStoragePort>,
    outbox: Arc<dyn OutboxStore>,
    expirations: ExpirationRegistry,
    keys: Arc<dyn StorageKeyStrategy>,
    config: UploadConfig,
    clock: SharedClock,
}

impl SessionCoordinator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        storage: Arc<dyn ObjectStoragePort>,
        outbox: Arc<dyn OutboxStore>,
        expirations: ExpirationRegistry,
    ) -> Self {
        Self {
            sessions,
            storage,
            outbox,
            expirations,
            keys: Arc::new(DatePartitionedKeys),
            config: UploadConfig::default(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_config(mut self, config: UploadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn StorageKeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn expirations(&self) -> &ExpirationRegistry {
        &self.expirations
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // Single uploads

    /// Persist a PREPARING single-upload session. No credential is issued.
    #[instrument(skip(self, request), fields(tenant = %request.tenant_id))]
    pub async fn create_single(&self, request: UploadRequest) -> UploadResult<UploadSession> {
        self.validate(&request)?;
        if let Some(existing) = self.find_replay(&request, SessionKind::Single).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let detail = SessionDetail::Single {
            presigned_url: None,
            url_expires_at: None,
            etag: None,
        };
        let session = self.new_session(&request, detail, self.config.single_session_ttl, now)?;
        let (session, created) = self.sessions.insert_or_get(session).await?;
        if !created {
            return replayable(session, SessionKind::Single);
        }

        self.register_expiration(&session, now).await;
        info!(session_id = %session.id, location = %session.location, "Created single upload session");
        Ok(session)
    }

    /// Issue the presigned PUT URL. An ACTIVE session with a live URL is
    /// returned as is; an expired URL is replaced.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn activate_single(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        let session = self.sessions.get(session_id).await?;
        expect_kind(&session, SessionKind::Single)?;
        session.ensure_activatable()?;

        let now = self.clock.now();
        if session.is_past_expiry(now) {
            return Err(UploadError::SessionExpired {
                session_id: session.id.to_string(),
            });
        }
        if session.has_valid_url(now) {
            debug!("Presigned URL still valid");
            return Ok(session);
        }

        let ttl = self.config.single_url_ttl;
        let url = match self
            .call_storage(
                "presign_put_url",
                self.storage.presign_put_url(&session.location, &session.content_type, ttl),
            )
            .await
        {
            Ok(url) => url,
            Err(e) => return Err(self.storage_failure(&session, e, now).await),
        };

        let transition = session.activate_single(url, now + to_chrono(ttl)?, now)?;
        let outcome = self
            .sessions
            .commit(SessionCommit::new(transition.session, session.version))
            .await?;
        info!(status = %outcome.session.status, "Issued presigned PUT URL");
        Ok(outcome.session)
    }

    /// Client finished its PUT. Completing twice returns the first receipt.
    #[instrument(skip(self, etag), fields(session_id = %session_id))]
    pub async fn complete_single(&self, session_id: &SessionId, etag: &str) -> UploadResult<CompletionReceipt> {
        let session = self.sessions.get(session_id).await?;
        expect_kind(&session, SessionKind::Single)?;
        if session.status == SessionStatus::Completed {
            return self.existing_receipt(session).await;
        }
        if etag.trim().is_empty() {
            return Err(UploadError::validation("etag must not be empty"));
        }

        let now = self.clock.now();
        let transition = session.complete(Some(etag.to_string()), now)?;
        self.commit_completion(&session, transition).await
    }

    // Multipart uploads

    /// Create the session, open the multipart upload and presign every
    /// part. Repeating a client idempotency key resumes a PREPARING session
    /// and returns an ACTIVE one unchanged.
    #[instrument(skip(self, request), fields(tenant = %request.upload.tenant_id))]
    pub async fn create_and_activate_multipart(&self, request: MultipartRequest) -> UploadResult<UploadSession> {
        let MultipartRequest { upload, part_size } = request;
        self.validate(&upload)?;
        let (part_size, part_count) = self.plan_parts(upload.declared_size, part_size)?;

        let session = match self.find_replay(&upload, SessionKind::Multipart).await? {
            Some(existing) => existing,
            None => {
                let now = self.clock.now();
                let detail = SessionDetail::Multipart {
                    upload_handle: None,
                    part_size,
                    part_count,
                    final_etag: None,
                };
                let fresh = self.new_session(&upload, detail, self.config.multipart_session_ttl, now)?;
                let (stored, created) = self.sessions.insert_or_get(fresh).await?;
                if !created {
                    replayable(stored, SessionKind::Multipart)?
                } else {
                    info!(session_id = %stored.id, part_count, part_size, "Created multipart upload session");
                    stored
                }
            }
        };

        match session.status {
            SessionStatus::Preparing => self.activate_multipart(session).await,
            _ => Ok(session),
        }
    }

    async fn activate_multipart(&self, session: UploadSession) -> UploadResult<UploadSession> {
        let now = self.clock.now();
        if session.is_past_expiry(now) {
            return Err(UploadError::SessionExpired {
                session_id: session.id.to_string(),
            });
        }

        let handle = match self
            .call_storage(
                "initiate_multipart",
                self.storage.initiate_multipart(&session.location, &session.content_type),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => return Err(self.storage_failure(&session, e, now).await),
        };

        let part_count = session.part_count().unwrap_or(0);
        let mut urls = Vec::with_capacity(part_count as usize);
        for part_number in 1..=part_count {
            let presign = self.storage.presign_part_url(
                &session.location,
                &handle,
                part_number,
                self.config.part_url_ttl,
            );
            match self.call_storage("presign_part_url", presign).await {
                Ok(url) => urls.push(url),
                Err(e) => {
                    self.abort_handle(&session, &handle).await;
                    return Err(self.storage_failure(&session, e, now).await);
                }
            }
        }

        let transition = session.activate_multipart(handle.clone(), now)?;
        let commit = SessionCommit::new(transition.session, session.version).with_parts(PartSet::seed(urls));
        let outcome = match self.sessions.commit(commit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abort_handle(&session, &handle).await;
                return Err(e);
            }
        };

        self.register_expiration(&outcome.session, now).await;
        info!(session_id = %outcome.session.id, part_count, "Multipart upload active");
        Ok(outcome.session)
    }

    /// Record one uploaded part. Lost version races are retried from a
    /// fresh read.
    #[instrument(skip(self, etag), fields(session_id = %session_id))]
    pub async fn mark_part_uploaded(
        &self,
        session_id: &SessionId,
        part_number: u32,
        etag: &str,
        size: u64,
    ) -> UploadResult<CompletedPart> {
        let attempts = self.config.conflict_retries.max(1);
        for attempt in 1..=attempts {
            let session = self.sessions.get(session_id).await?;
            expect_kind(&session, SessionKind::Multipart)?;

            let now = self.clock.now();
            let transition = session.record_part(part_number, now)?;
            let mut parts = self.sessions.get_parts(session_id).await?;
            let recorded = parts.record(part_number, etag, size, now)?.clone();

            let commit = SessionCommit::new(transition.session, session.version).with_parts(parts);
            match self.sessions.commit(commit).await {
                Ok(_) => {
                    debug!(attempt, "Part recorded");
                    return Ok(recorded);
                }
                Err(UploadError::ConcurrentModification { .. }) if attempt < attempts => {
                    debug!(attempt, "Part commit lost a version race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(UploadError::concurrent(session_id))
    }

    /// Finalize the object. Transient storage failures leave the session
    /// ACTIVE for a retry; permanent ones abort it.
    #[instrument(skip(self, reported), fields(session_id = %session_id))]
    pub async fn complete_multipart(
        &self,
        session_id: &SessionId,
        reported: &[ReportedPart],
    ) -> UploadResult<CompletionReceipt> {
        let session = self.sessions.get(session_id).await?;
        expect_kind(&session, SessionKind::Multipart)?;
        if session.status == SessionStatus::Completed {
            return self.existing_receipt(session).await;
        }

        let now = self.clock.now();
        session.ensure_accepting("complete", now)?;
        let parts = self.sessions.get_parts(session_id).await?;
        parts.verify_reported(reported)?;
        let tags = parts.ordered_tags()?;
        let handle = session
            .upload_handle()
            .ok_or_else(|| UploadError::validation("multipart session has no upload handle"))?
            .to_string();

        let etag = match self
            .call_storage(
                "complete_multipart",
                self.storage.complete_multipart(&session.location, &handle, &tags),
            )
            .await
        {
            Ok(etag) => etag,
            Err(e) => {
                if !e.is_transient() {
                    self.abort_handle(&session, &handle).await;
                }
                return Err(self.storage_failure(&session, e, now).await);
            }
        };

        let transition = session.complete(Some(etag), now)?;
        self.commit_completion(&session, transition).await
    }

    // Either kind

    /// Client-requested abort. Already ABORTED is a no-op.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn abort(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        let session = self.sessions.get(session_id).await?;
        let now = self.clock.now();
        let transition = session.abort(CLIENT_ABORT_REASON, now)?;
        if transition.is_noop() {
            return Ok(session);
        }

        if let Some(handle) = session.upload_handle() {
            match self
                .call_storage("abort_multipart", self.storage.abort_multipart(&session.location, handle))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Storage abort failed, session unchanged");
                    return Err(e.into());
                }
                Err(e) => warn!(error = %e, "Storage rejected abort, aborting session anyway"),
            }
        }

        let outcome = self
            .sessions
            .commit(SessionCommit::new(transition.session, session.version))
            .await?;
        self.expirations.remove(session.kind(), &session.id).await;
        info!("Upload aborted");
        Ok(outcome.session)
    }

    /// Time-driven expiry, called by the expiration listener and sweep.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn expire(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        let session = self.sessions.get(session_id).await?;
        let now = self.clock.now();
        let transition = session.expire(now)?;
        if transition.is_noop() {
            return Ok(session);
        }

        if let Some(handle) = session.upload_handle() {
            self.abort_handle(&session, handle).await;
        }

        let outcome = self
            .sessions
            .commit(SessionCommit::new(transition.session, session.version))
            .await?;
        self.expirations.remove(session.kind(), &session.id).await;
        info!(expires_at = %session.expires_at, "Upload session expired");
        Ok(outcome.session)
    }

    pub async fn get_session(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        self.sessions.get(session_id).await
    }

    pub async fn get_parts(&self, session_id: &SessionId) -> UploadResult<Vec<CompletedPart>> {
        let parts = self.sessions.get_parts(session_id).await?;
        Ok(parts.iter().cloned().collect())
    }

    // Internals

    fn validate(&self, request: &UploadRequest) -> UploadResult<()> {
        if request.tenant_id.is_blank() {
            return Err(UploadError::validation("tenant_id is required"));
        }
        if request.file_name.trim().is_empty() {
            return Err(UploadError::validation("file_name is required"));
        }
        if request.content_type.trim().is_empty() {
            return Err(UploadError::validation("content_type is required"));
        }
        if request.declared_size == 0 {
            return Err(UploadError::validation("declared_size must be greater than zero"));
        }
        if request.declared_size > self.config.max_declared_bytes {
            return Err(UploadError::validation(format!(
                "declared_size {} exceeds the maximum of {} bytes",
                request.declared_size, self.config.max_declared_bytes
            )));
        }
        if let Some(url) = &request.callback_url {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(UploadError::validation("callback_url must be an http(s) URL"));
            }
        }
        Ok(())
    }

    /// Part size and count for a declared size. Only the last part may be
    /// smaller than `min_part_bytes`.
    fn plan_parts(&self, declared_size: u64, requested: Option<u64>) -> UploadResult<(u64, u32)> {
        let min = self.config.min_part_bytes;
        let max_parts = u64::from(self.config.max_parts);
        let part_size = match requested {
            Some(0) => return Err(UploadError::validation("part_size must be greater than zero")),
            Some(size) if size < min && size < declared_size => {
                return Err(UploadError::validation(format!(
                    "part_size must be at least {min} bytes"
                )))
            }
            Some(size) => size,
            None => min.max(declared_size.div_ceil(max_parts)),
        };

        let count = declared_size.div_ceil(part_size);
        if count > max_parts {
            return Err(UploadError::validation(format!(
                "{count} parts exceeds the limit of {max_parts}"
            )));
        }
        Ok((part_size, count as u32))
    }

    /// Session already created under the request's client key, if any.
    async fn find_replay(&self, request: &UploadRequest, kind: SessionKind) -> UploadResult<Option<UploadSession>> {
        let Some(key) = request.client_idempotency_key() else {
            return Ok(None);
        };
        match self.sessions.find_by_idempotency_key(key).await? {
            Some(existing) => {
                debug!(session_id = %existing.id, "Idempotent create matched existing session");
                replayable(existing, kind).map(Some)
            }
            None => Ok(None),
        }
    }

    fn new_session(
        &self,
        request: &UploadRequest,
        detail: SessionDetail,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> UploadResult<UploadSession> {
        let id = SessionId::new();
        let bucket = request
            .bucket
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.config.default_bucket.clone());
        let key = self.keys.object_key(&request.tenant_id, &id, now);
        let idempotency_key = match request.client_idempotency_key() {
            Some(client) => client.to_string(),
            None => generated_key(&id),
        };

        Ok(UploadSession {
            id,
            tenant_id: request.tenant_id.clone(),
            idempotency_key,
            file_name: request.file_name.clone(),
            content_type: request.content_type.clone(),
            location: ObjectLocation::new(bucket, key),
            access: request.access,
            declared_size: request.declared_size,
            purpose: request.purpose.clone(),
            source: request.source.clone(),
            callback_url: request.callback_url.clone(),
            status: SessionStatus::Preparing,
            detail,
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(ttl)?,
            completed_at: None,
            abort_reason: None,
            version: 0,
        })
    }

    async fn call_storage<T, F>(&self, op: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.config.storage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::transient(format!(
                "{op} timed out after {:?}",
                self.config.storage_timeout
            ))),
        }
    }

    /// Map a storage failure to the caller's error. A permanent failure
    /// also aborts the session.
    async fn storage_failure(&self, session: &UploadSession, err: StorageError, now: DateTime<Utc>) -> UploadError {
        if err.is_transient() {
            warn!(session_id = %session.id, error = %err, "Transient storage failure, session unchanged");
            return err.into();
        }

        error!(session_id = %session.id, error = %err, "Permanent storage failure, aborting session");
        match session.abort(format!("storage: {err}"), now) {
            Ok(transition) if !transition.is_noop() => {
                let commit = SessionCommit::new(transition.session, session.version);
                match self.sessions.commit(commit).await {
                    Ok(_) => self.expirations.remove(session.kind(), &session.id).await,
                    Err(e) => warn!(session_id = %session.id, error = %e, "Could not abort session after storage failure"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %session.id, error = %e, "Session not abortable after storage failure"),
        }
        err.into()
    }

    async fn abort_handle(&self, session: &UploadSession, handle: &str) {
        let abort = self.storage.abort_multipart(&session.location, handle);
        if let Err(e) = self.call_storage("abort_multipart", abort).await {
            warn!(session_id = %session.id, error = %e, "Best-effort multipart abort failed");
        }
    }

    async fn register_expiration(&self, session: &UploadSession, now: DateTime<Utc>) {
        // One second of slack so the cache never fires before expires_at.
        let remaining = (session.expires_at - now).to_std().unwrap_or(Duration::ZERO) + Duration::from_secs(1);
        self.expirations.register(&session.id, session.kind(), remaining).await;
    }

    async fn commit_completion(&self, read: &UploadSession, transition: Transition) -> UploadResult<CompletionReceipt> {
        let messages = completion_messages(&transition.session);
        let commit = SessionCommit::new(transition.session, read.version).with_outbox(messages);

        match self.sessions.commit(commit).await {
            Ok(outcome) => {
                let message_id = outcome.message_ids.into_iter().next().ok_or_else(|| {
                    UploadError::Outbox(OutboxError::Internal("completion staged no outbox message".into()))
                })?;
                self.expirations.remove(read.kind(), &read.id).await;
                info!(session_id = %read.id, message_id = %message_id, "Upload completed");
                Ok(CompletionReceipt {
                    session: outcome.session,
                    message_id,
                })
            }
            Err(UploadError::ConcurrentModification { .. }) => {
                let current = self.sessions.get(&read.id).await?;
                if current.status == SessionStatus::Completed {
                    return self.existing_receipt(current).await;
                }
                Err(UploadError::concurrent(&read.id))
            }
            Err(e) => Err(e),
        }
    }

    async fn existing_receipt(&self, session: UploadSession) -> UploadResult<CompletionReceipt> {
        let key = completion_key(&session.id);
        match self.outbox.find_by_idempotency_key(&key).await? {
            Some(message) => {
                debug!(session_id = %session.id, "Completion replayed, returning original receipt");
                Ok(CompletionReceipt {
                    session,
                    message_id: message.id,
                })
            }
            None => Err(UploadError::Outbox(OutboxError::MessageNotFound(key))),
        }
    }
}

/// A replayed create only hands back sessions that can still be used.
fn replayable(session: UploadSession, kind: SessionKind) -> UploadResult<UploadSession> {
    expect_kind(&session, kind)?;
    match session.status {
        SessionStatus::Preparing | SessionStatus::Active => Ok(session),
        SessionStatus::Completed => Err(UploadError::SessionAlreadyCompleted {
            session_id: session.id.to_string(),
        }),
        status @ (SessionStatus::Aborted | SessionStatus::Expired) => Err(UploadError::invalid_status(status, "resume")),
    }
}

fn generated_key(id: &SessionId) -> String {
    format!("session:{id}")
}

fn expect_kind(session: &UploadSession, kind: SessionKind) -> UploadResult<()> {
    if session.kind() != kind {
        return Err(UploadError::validation(format!(
            "session {} is a {} upload",
            session.id,
            session.kind()
        )));
    }
    Ok(())
}

fn to_chrono(ttl: Duration) -> UploadResult<chrono::Duration> {
    chrono::Duration::from_std(ttl).map_err(|_| UploadError::validation(format!("duration {ttl:?} out of range")))
}

/// Asset registration, plus the client callback when one was given.
fn completion_messages(session: &UploadSession) -> Vec<NewOutboxMessage> {
    let mut payload = PayloadRef::new(session.id.as_str())
        .with_attribute("event", "upload.completed")
        .with_attribute("tenant_id", session.tenant_id.as_str())
        .with_attribute("kind", session.kind().as_str())
        .with_attribute("bucket", session.location.bucket.as_str())
        .with_attribute("key", session.location.key.as_str())
        .with_attribute("content_type", session.content_type.as_str())
        .with_attribute("size", session.declared_size.to_string())
        .with_attribute("access", session.access.as_str());
    if let Some(etag) = session.etag() {
        payload = payload.with_attribute("etag", etag);
    }

    let mut messages = vec![NewOutboxMessage::queue_dispatch(
        completion_key(&session.id),
        payload.clone(),
    )];
    if let Some(url) = &session.callback_url {
        messages.push(NewOutboxMessage::callback(callback_key(&session.id), url.as_str(), payload));
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        expiration::MemoryTtlCache,
        storage::{MemoryObjectStorage, StorageFault},
        store::MemorySessionStore,
    };
    use fileflow_outbox::MemoryOutboxStore;

    fn coordinator(storage: Arc<MemoryObjectStorage>) -> SessionCoordinator {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let sessions = Arc::new(MemorySessionStore::new(outbox.clone()));
        let cache = Arc::new(MemoryTtlCache::new());
        SessionCoordinator::new(sessions, storage, outbox, ExpirationRegistry::new(cache))
    }

    #[test]
    fn part_plan_respects_limits() {
        let c = coordinator(Arc::new(MemoryObjectStorage::new()));
        let min = c.config.min_part_bytes;

        assert_eq!(c.plan_parts(1, None).unwrap(), (min, 1));
        assert_eq!(c.plan_parts(min * 3, None).unwrap(), (min, 3));
        assert_eq!(c.plan_parts(min * 3 + 1, None).unwrap(), (min, 4));
        // A single small part is fine
        assert_eq!(c.plan_parts(100, Some(100)).unwrap(), (100, 1));
        assert!(c.plan_parts(min * 2, Some(min - 1)).is_err());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn permanent_presign_failure_is_logged_and_aborts() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let c = coordinator(storage.clone());
        let session = c
            .create_single(UploadRequest::new("t1", "a.txt", "text/plain", 3))
            .await
            .unwrap();

        storage.fail_next(StorageFault::PresignPut, StorageError::permanent("AccessDenied"));
        let err = c.activate_single(&session.id).await.unwrap_err();
        assert!(matches!(err, UploadError::PermanentStorage { .. }));
        assert_eq!(c.get_session(&session.id).await.unwrap().status, SessionStatus::Aborted);
        assert!(logs_contain("Permanent storage failure, aborting session"));
    }
}
