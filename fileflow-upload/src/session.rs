//! # Upload session state machine
//!
//! ```text
//! PREPARING --activate--> ACTIVE --complete--> COMPLETED
//!     |                     |----abort-----> ABORTED
//!     |                     '----expire----> EXPIRED
//!     '--abort / expire--> ABORTED / EXPIRED
//! ```
//!
//! [`UploadSession`] is an immutable value. Every operation returns a
//! [`Transition`]: the next value plus the events it produced, or a typed
//! error. Nothing here performs I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use fileflow_core::TenantId;
use serde::{Deserialize, Serialize};

use crate::{
    events::SessionEvent,
    types::{AccessType, ObjectLocation, SessionId, SessionKind},
    UploadError, UploadResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Persisted, no external credential issued yet
    Preparing,
    /// Presigned URL or multipart handle exists
    Active,
    Completed,
    Aborted,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Expired)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Preparing => "PREPARING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Preparing, Active)
                | (Preparing, Aborted)
                | (Preparing, Expired)
                | (Active, Completed)
                | (Active, Aborted)
                | (Active, Expired)
        )
    }

    /// Statuses the reconciliation sweep looks at.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Preparing | Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Variant-specific state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDetail {
    Single {
        presigned_url: Option<String>,
        url_expires_at: Option<DateTime<Utc>>,
        etag: Option<String>,
    },
    Multipart {
        upload_handle: Option<String>,
        part_size: u64,
        part_count: u32,
        final_etag: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    pub file_name: String,
    pub content_type: String,
    pub location: ObjectLocation,
    pub access: AccessType,
    pub declared_size: u64,
    pub purpose: Option<String>,
    pub source: Option<String>,
    pub callback_url: Option<String>,
    pub status: SessionStatus,
    pub detail: SessionDetail,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abort_reason: Option<String>,
    /// Set by the store on every commit
    pub version: u64,
}

/// Result of applying an operation to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub session: UploadSession,
    pub events: Vec<SessionEvent>,
}

impl Transition {
    fn changed(session: UploadSession, event: SessionEvent) -> Self {
        Self {
            session,
            events: vec![event],
        }
    }

    fn unchanged(session: &UploadSession) -> Self {
        Self {
            session: session.clone(),
            events: Vec::new(),
        }
    }

    /// Nothing to persist.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

impl UploadSession {
    pub fn kind(&self) -> SessionKind {
        match self.detail {
            SessionDetail::Single { .. } => SessionKind::Single,
            SessionDetail::Multipart { .. } => SessionKind::Multipart,
        }
    }

    pub fn part_count(&self) -> Option<u32> {
        match self.detail {
            SessionDetail::Multipart { part_count, .. } => Some(part_count),
            SessionDetail::Single { .. } => None,
        }
    }

    pub fn upload_handle(&self) -> Option<&str> {
        match &self.detail {
            SessionDetail::Multipart { upload_handle, .. } => upload_handle.as_deref(),
            SessionDetail::Single { .. } => None,
        }
    }

    pub fn presigned_url(&self) -> Option<&str> {
        match &self.detail {
            SessionDetail::Single { presigned_url, .. } => presigned_url.as_deref(),
            SessionDetail::Multipart { .. } => None,
        }
    }

    /// Final object ETag once COMPLETED.
    pub fn etag(&self) -> Option<&str> {
        match &self.detail {
            SessionDetail::Single { etag, .. } => etag.as_deref(),
            SessionDetail::Multipart { final_etag, .. } => final_etag.as_deref(),
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// ACTIVE single upload whose URL is still usable.
    pub fn has_valid_url(&self, now: DateTime<Utc>) -> bool {
        match &self.detail {
            SessionDetail::Single {
                presigned_url: Some(_),
                url_expires_at: Some(until),
                ..
            } => self.status == SessionStatus::Active && *until > now,
            _ => false,
        }
    }

    fn next(&self, status: SessionStatus, requested: &'static str, now: DateTime<Utc>) -> UploadResult<UploadSession> {
        if !self.status.can_transition_to(status) {
            return Err(UploadError::invalid_status(self.status, requested));
        }
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        Ok(next)
    }

    /// Check a session can be activated, before any credential is requested.
    pub fn ensure_activatable(&self) -> UploadResult<()> {
        match self.status {
            SessionStatus::Preparing | SessionStatus::Active => Ok(()),
            current => Err(UploadError::invalid_status(current, "activate")),
        }
    }

    /// PREPARING → ACTIVE with a presigned PUT URL. On an ACTIVE session
    /// only the URL is replaced.
    pub fn activate_single(&self, url: String, url_expires_at: DateTime<Utc>, now: DateTime<Utc>) -> UploadResult<Transition> {
        if self.kind() != SessionKind::Single {
            return Err(UploadError::validation("not a single upload session"));
        }
        self.ensure_activatable()?;

        let reissue = self.status == SessionStatus::Active;
        let mut next = if reissue {
            let mut same = self.clone();
            same.updated_at = now;
            same
        } else {
            self.next(SessionStatus::Active, "activate", now)?
        };
        if let SessionDetail::Single {
            presigned_url,
            url_expires_at: until,
            ..
        } = &mut next.detail
        {
            *presigned_url = Some(url);
            *until = Some(url_expires_at);
        }

        let event = if reissue {
            SessionEvent::UrlReissued {
                session_id: self.id.clone(),
                at: now,
            }
        } else {
            SessionEvent::Activated {
                session_id: self.id.clone(),
                kind: SessionKind::Single,
                at: now,
            }
        };
        Ok(Transition::changed(next, event))
    }

    /// PREPARING → ACTIVE once the multipart handle exists.
    pub fn activate_multipart(&self, handle: String, now: DateTime<Utc>) -> UploadResult<Transition> {
        if self.kind() != SessionKind::Multipart {
            return Err(UploadError::validation("not a multipart upload session"));
        }
        let mut next = self.next(SessionStatus::Active, "activate", now)?;
        if let SessionDetail::Multipart { upload_handle, .. } = &mut next.detail {
            *upload_handle = Some(handle);
        }
        Ok(Transition::changed(
            next,
            SessionEvent::Activated {
                session_id: self.id.clone(),
                kind: SessionKind::Multipart,
                at: now,
            },
        ))
    }

    /// ACTIVE and not past expiry: parts may be recorded, completion may run.
    pub fn ensure_accepting(&self, requested: &'static str, now: DateTime<Utc>) -> UploadResult<()> {
        if self.status != SessionStatus::Active {
            return Err(UploadError::invalid_status(self.status, requested));
        }
        if self.is_past_expiry(now) {
            return Err(UploadError::SessionExpired {
                session_id: self.id.to_string(),
            });
        }
        Ok(())
    }

    /// Bookkeeping transition for a recorded part; status is unchanged.
    pub fn record_part(&self, part_number: u32, now: DateTime<Utc>) -> UploadResult<Transition> {
        self.ensure_accepting("record a part", now)?;
        let mut next = self.clone();
        next.updated_at = now;
        Ok(Transition::changed(
            next,
            SessionEvent::PartRecorded {
                session_id: self.id.clone(),
                part_number,
                at: now,
            },
        ))
    }

    /// ACTIVE → COMPLETED.
    pub fn complete(&self, etag: Option<String>, now: DateTime<Utc>) -> UploadResult<Transition> {
        if self.status == SessionStatus::Completed {
            return Err(UploadError::SessionAlreadyCompleted {
                session_id: self.id.to_string(),
            });
        }
        self.ensure_accepting("complete", now)?;

        let mut next = self.next(SessionStatus::Completed, "complete", now)?;
        next.completed_at = Some(now);
        match &mut next.detail {
            SessionDetail::Single { etag: slot, .. } => *slot = etag.clone(),
            SessionDetail::Multipart { final_etag, .. } => *final_etag = etag.clone(),
        }
        Ok(Transition::changed(
            next,
            SessionEvent::Completed {
                session_id: self.id.clone(),
                kind: self.kind(),
                etag,
                at: now,
            },
        ))
    }

    /// → ABORTED. Already ABORTED is a no-op; COMPLETED is a conflict.
    pub fn abort<S: Into<String>>(&self, reason: S, now: DateTime<Utc>) -> UploadResult<Transition> {
        match self.status {
            SessionStatus::Aborted => return Ok(Transition::unchanged(self)),
            SessionStatus::Completed => {
                return Err(UploadError::SessionAlreadyCompleted {
                    session_id: self.id.to_string(),
                })
            }
            _ => {}
        }
        let reason = reason.into();
        let mut next = self.next(SessionStatus::Aborted, "abort", now)?;
        next.abort_reason = Some(reason.clone());
        Ok(Transition::changed(
            next,
            SessionEvent::Aborted {
                session_id: self.id.clone(),
                reason,
                at: now,
            },
        ))
    }

    /// → EXPIRED once past `expires_at`. EXPIRED and ABORTED are no-ops.
    pub fn expire(&self, now: DateTime<Utc>) -> UploadResult<Transition> {
        match self.status {
            SessionStatus::Expired | SessionStatus::Aborted => return Ok(Transition::unchanged(self)),
            SessionStatus::Completed => {
                return Err(UploadError::SessionAlreadyCompleted {
                    session_id: self.id.to_string(),
                })
            }
            _ => {}
        }
        if !self.is_past_expiry(now) {
            return Err(UploadError::NotYetExpired {
                session_id: self.id.to_string(),
            });
        }
        let next = self.next(SessionStatus::Expired, "expire", now)?;
        Ok(Transition::changed(
            next,
            SessionEvent::Expired {
                session_id: self.id.clone(),
                at: now,
            },
        ))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Duration;

    pub fn single(now: DateTime<Utc>) -> UploadSession {
        UploadSession {
            id: SessionId::new(),
            tenant_id: TenantId::new("t1"),
            idempotency_key: "t1:a.png:10:image/png".to_string(),
            file_name: "a.png".to_string(),
            content_type: "image/png".to_string(),
            location: ObjectLocation::new("media", "t1/a.png"),
            access: AccessType::Internal,
            declared_size: 10,
            purpose: None,
            source: None,
            callback_url: None,
            status: SessionStatus::Preparing,
            detail: SessionDetail::Single {
                presigned_url: None,
                url_expires_at: None,
                etag: None,
            },
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(15),
            completed_at: None,
            abort_reason: None,
            version: 0,
        }
    }

    pub fn multipart(now: DateTime<Utc>, part_count: u32) -> UploadSession {
        UploadSession {
            detail: SessionDetail::Multipart {
                upload_handle: None,
                part_size: 5 * 1024 * 1024,
                part_count,
                final_etag: None,
            },
            expires_at: now + Duration::hours(24),
            ..single(now)
        }
    }
}
