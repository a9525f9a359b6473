use fileflow_core::{Classified, ErrorKind};
use fileflow_outbox::OutboxError;
use thiserror::Error;

use crate::session::SessionStatus;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors returned by the session coordinator and its stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Upload session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session is {current}, cannot {requested}")]
    InvalidSessionStatus {
        current: SessionStatus,
        requested: &'static str,
    },

    #[error("Session {session_id} is already completed")]
    SessionAlreadyCompleted { session_id: String },

    #[error("Session {session_id} expired")]
    SessionExpired { session_id: String },

    #[error("Session {session_id} has not reached its expiry")]
    NotYetExpired { session_id: String },

    #[error("Part {part_number} was already uploaded")]
    DuplicatePartNumber { part_number: u32 },

    #[error("Part number {part_number} is outside 1..={total}")]
    InvalidPartNumber { part_number: u32, total: u32 },

    #[error("Not all parts uploaded: {completed}/{total}")]
    IncompleteParts { completed: u32, total: u32 },

    #[error("Session {session_id} was modified concurrently")]
    ConcurrentModification { session_id: String },

    #[error("Storage temporarily unavailable: {reason}")]
    TransientStorage { reason: String },

    #[error("Storage rejected the request: {reason}")]
    PermanentStorage { reason: String },

    #[error("Outbox write failed: {0}")]
    Outbox(#[from] OutboxError),
}

impl UploadError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found<S: ToString>(session_id: S) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn invalid_status(current: SessionStatus, requested: &'static str) -> Self {
        Self::InvalidSessionStatus { current, requested }
    }

    pub fn concurrent<S: ToString>(session_id: S) -> Self {
        Self::ConcurrentModification {
            session_id: session_id.to_string(),
        }
    }
}

impl Classified for UploadError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidPartNumber { .. } => ErrorKind::BadRequest,
            Self::SessionNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidSessionStatus { .. }
            | Self::SessionAlreadyCompleted { .. }
            | Self::NotYetExpired { .. }
            | Self::DuplicatePartNumber { .. }
            | Self::ConcurrentModification { .. } => ErrorKind::Conflict,
            Self::SessionExpired { .. } => ErrorKind::Gone,
            Self::IncompleteParts { .. } => ErrorKind::PreconditionFailed,
            Self::TransientStorage { .. } => ErrorKind::Unavailable,
            Self::PermanentStorage { .. } => ErrorKind::BadGateway,
            Self::Outbox(_) => ErrorKind::GeneralError,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage { .. } | Self::ConcurrentModification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_parts_renders_ratio() {
        let err = UploadError::IncompleteParts {
            completed: 4,
            total: 5,
        };
        assert_eq!(err.to_string(), "Not all parts uploaded: 4/5");
        assert_eq!(err.kind().status_code(), 412);
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(UploadError::TransientStorage { reason: "503".into() }.is_retryable());
        assert!(UploadError::concurrent("upl_1").is_retryable());
        assert!(!UploadError::PermanentStorage { reason: "403".into() }.is_retryable());
        assert!(!UploadError::DuplicatePartNumber { part_number: 1 }.is_retryable());
    }

    #[test]
    fn invalid_status_names_both_sides() {
        let err = UploadError::invalid_status(SessionStatus::Completed, "abort");
        assert_eq!(err.to_string(), "Session is COMPLETED, cannot abort");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
