use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NewOutboxMessage, PayloadRef, TaskId};

/// Outbox idempotency key of a task's end-of-download webhook.
pub fn webhook_key(id: &TaskId) -> String {
    format!("download-webhook:{id}")
}

/// External download lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Downloading => "DOWNLOADING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request to fetch a remote URL into storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDownloadTask {
    pub tenant_id: String,
    pub source_url: String,
    pub target_bucket: String,
    pub target_key: String,
    pub webhook_url: Option<String>,
    pub max_attempts: u32,
}

impl NewDownloadTask {
    pub fn new<T, U, B, K>(tenant_id: T, source_url: U, target_bucket: B, target_key: K) -> Self
    where
        T: Into<String>,
        U: Into<String>,
        B: Into<String>,
        K: Into<String>,
    {
        Self {
            tenant_id: tenant_id.into(),
            source_url: source_url.into(),
            target_bucket: target_bucket.into(),
            target_key: target_key.into(),
            webhook_url: None,
            max_attempts: 3,
        }
    }

    pub fn with_webhook<S: Into<String>>(mut self, url: S) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub tenant_id: String,
    pub source_url: String,
    pub target_bucket: String,
    pub target_key: String,
    pub webhook_url: Option<String>,
    pub status: TaskStatus,
    /// Zero-based index of the current (or next) run
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl DownloadTask {
    pub fn new(id: TaskId, request: NewDownloadTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: request.tenant_id,
            source_url: request.source_url,
            target_bucket: request.target_bucket,
            target_key: request.target_key,
            webhook_url: request.webhook_url,
            status: TaskStatus::Queued,
            attempt: 0,
            max_attempts: request.max_attempts.max(1),
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            version: 0,
        }
    }

    /// The current run is the last one allowed.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt + 1 >= self.max_attempts
    }

    /// Webhook notification for a finished task that asked for one.
    pub fn webhook_message(&self) -> Option<NewOutboxMessage> {
        let url = self.webhook_url.as_deref()?;
        let event = match self.status {
            TaskStatus::Completed => "download.completed",
            TaskStatus::Failed => "download.failed",
            _ => return None,
        };
        let mut payload = PayloadRef::new(self.id.as_str())
            .with_attribute("event", event)
            .with_attribute("tenant_id", self.tenant_id.as_str())
            .with_attribute("status", self.status.name())
            .with_attribute("source_url", self.source_url.as_str())
            .with_attribute("bucket", self.target_bucket.as_str())
            .with_attribute("key", self.target_key.as_str())
            .with_attribute("attempt", self.attempt.to_string());
        if let Some(error) = &self.last_error {
            payload = payload.with_attribute("error", error.as_str());
        }
        Some(NewOutboxMessage::webhook(webhook_key(&self.id), url, payload))
    }

    pub(crate) fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Downloading;
        self.started_at = Some(now);
        self.touch(now);
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.last_error = None;
        self.touch(now);
    }

    pub(crate) fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error);
        self.touch(now);
    }

    pub(crate) fn requeue(&mut self, error: String, now: DateTime<Utc>) {
        self.status = TaskStatus::Queued;
        self.attempt += 1;
        self.started_at = None;
        self.last_error = Some(error);
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_advances_attempt_and_clears_start() {
        let now = Utc::now();
        let mut task = DownloadTask::new(
            TaskId::new(),
            NewDownloadTask::new("t1", "https://src.test/a.png", "media", "t1/a.png"),
            now,
        );
        task.start(now);
        assert_eq!(task.status, TaskStatus::Downloading);

        task.requeue("stuck".to_string(), now);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1);
        assert!(task.started_at.is_none());
        assert_eq!(task.version, 2);
    }

    #[test]
    fn webhook_only_for_finished_tasks_with_a_url() {
        let now = Utc::now();
        let request = NewDownloadTask::new("t1", "https://src.test/a.png", "media", "t1/a.png");
        let mut silent = DownloadTask::new(TaskId::new(), request.clone(), now);
        silent.start(now);
        silent.complete(now);
        assert!(silent.webhook_message().is_none());

        let mut task = DownloadTask::new(TaskId::new(), request.with_webhook("https://client.test/dl"), now);
        task.start(now);
        assert!(task.webhook_message().is_none());

        task.fail("404 from source".to_string(), now);
        let message = task.webhook_message().unwrap();
        assert_eq!(message.kind, crate::OutboxKind::Webhook);
        assert_eq!(message.idempotency_key, format!("download-webhook:{}", task.id));
        assert_eq!(message.payload.attribute("event"), Some("download.failed"));
        assert_eq!(message.payload.attribute("error"), Some("404 from source"));
        assert_eq!(message.payload.attribute("url"), Some("https://client.test/dl"));
    }

    #[test]
    fn last_attempt_is_relative_to_budget() {
        let mut task = DownloadTask::new(
            TaskId::new(),
            NewDownloadTask::new("t1", "u", "b", "k").with_max_attempts(2),
            Utc::now(),
        );
        assert!(!task.is_last_attempt());
        task.attempt = 1;
        assert!(task.is_last_attempt());
    }
}
