use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{DownloadTask, NewDownloadTask};
use crate::{types::TaskId, TaskResult};

/// Storage primitives for download tasks.
///
/// State-changing calls take the version the caller read; a mismatch is a
/// [`TaskError::VersionConflict`](crate::TaskError::VersionConflict), or
/// `None` for the recovery calls where losing a race is expected.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, request: NewDownloadTask) -> TaskResult<DownloadTask>;

    async fn get(&self, id: &TaskId) -> TaskResult<DownloadTask>;

    /// Oldest QUEUED task moved to DOWNLOADING, if any.
    async fn claim_next_queued(&self, now: DateTime<Utc>) -> TaskResult<Option<DownloadTask>>;

    async fn complete(&self, id: &TaskId, expected_version: u64, now: DateTime<Utc>) -> TaskResult<DownloadTask>;

    async fn fail(
        &self,
        id: &TaskId,
        expected_version: u64,
        error: String,
        now: DateTime<Utc>,
    ) -> TaskResult<DownloadTask>;

    /// DOWNLOADING tasks that started before `started_before`, oldest first.
    async fn find_stuck(&self, started_before: DateTime<Utc>, limit: usize) -> TaskResult<Vec<DownloadTask>>;

    /// DOWNLOADING → QUEUED with `attempt + 1`.
    async fn requeue_stuck(
        &self,
        id: &TaskId,
        expected_version: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<DownloadTask>>;

    /// DOWNLOADING → FAILED for a task out of attempts.
    async fn dead_letter_stuck(
        &self,
        id: &TaskId,
        expected_version: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<DownloadTask>>;
}
