use std::time::Duration;

use fileflow_core::{Classified, ErrorKind};
use thiserror::Error;

use crate::types::{OutboxKind, OutboxStatus};

/// Result type for outbox store operations
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Result type for download task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Store-level outbox errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("Outbox message not found: {0}")]
    MessageNotFound(String),

    #[error("Outbox message {id} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    #[error("Outbox message {id} is {current}, cannot move to {requested}")]
    InvalidTransition {
        id: String,
        current: OutboxStatus,
        requested: OutboxStatus,
    },

    #[error("Internal outbox error: {0}")]
    Internal(String),
}

impl Classified for OutboxError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::MessageNotFound(_) => ErrorKind::NotFound,
            Self::VersionConflict { .. } | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::GeneralError,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Delivery outcome reported by a sink. Recorded on the message, never thrown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The consumer answered but refused the message
    #[error("Rejected by consumer (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Sink call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Payload cannot be delivered: {0}")]
    InvalidPayload(String),

    #[error("No sink registered for {0}")]
    Unroutable(OutboxKind),
}

impl SinkError {
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

/// Download task store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Download task not found: {0}")]
    TaskNotFound(String),

    #[error("Download task {id} changed concurrently")]
    VersionConflict { id: String },

    #[error("Download task {id} is {current}, cannot {action}")]
    InvalidTransition {
        id: String,
        current: String,
        action: &'static str,
    },

    #[error("Invalid download task: {0}")]
    Invalid(String),
}

impl Classified for TaskError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::TaskNotFound(_) => ErrorKind::NotFound,
            Self::VersionConflict { .. } | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Invalid(_) => ErrorKind::BadRequest,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
