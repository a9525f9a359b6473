use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fileflow_core::{SharedClock, SystemClock};
use parking_lot::RwLock;

use super::store::TaskStore;
use super::types::{DownloadTask, NewDownloadTask, TaskStatus};
use crate::{backend::memory::MemoryOutboxStore, types::TaskId, TaskError, TaskResult};

/// In-memory download task table.
///
/// A task with a webhook URL that reaches COMPLETED or FAILED stages its
/// WEBHOOK outbox message under the same write lock.
#[derive(Clone)]
pub struct MemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, DownloadTask>>>,
    outbox: Arc<MemoryOutboxStore>,
    clock: SharedClock,
}

impl MemoryTaskStore {
    pub fn new(outbox: Arc<MemoryOutboxStore>) -> Self {
        Self::with_clock(outbox, SystemClock::shared())
    }

    pub fn with_clock(outbox: Arc<MemoryOutboxStore>, clock: SharedClock) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            outbox,
            clock,
        }
    }

    pub fn outbox(&self) -> &Arc<MemoryOutboxStore> {
        &self.outbox
    }

    fn stage_webhook(&self, task: &DownloadTask) {
        if let Some(message) = task.webhook_message() {
            self.outbox.insert_staged(vec![message]);
        }
    }

    fn update<F>(&self, id: &TaskId, expected_version: u64, action: &'static str, f: F) -> TaskResult<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask) -> TaskResult<()>,
    {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;
        if task.version != expected_version {
            return Err(TaskError::VersionConflict { id: id.to_string() });
        }
        if task.status != TaskStatus::Downloading {
            return Err(TaskError::InvalidTransition {
                id: id.to_string(),
                current: task.status.to_string(),
                action,
            });
        }
        f(task)?;
        self.stage_webhook(task);
        Ok(task.clone())
    }

    /// Recovery variant: a lost race yields `None` instead of an error.
    fn update_if_unchanged<F>(&self, id: &TaskId, expected_version: u64, f: F) -> TaskResult<Option<DownloadTask>>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))?;
        if task.version != expected_version || task.status != TaskStatus::Downloading {
            return Ok(None);
        }
        f(task);
        self.stage_webhook(task);
        Ok(Some(task.clone()))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, request: NewDownloadTask) -> TaskResult<DownloadTask> {
        if request.source_url.trim().is_empty() {
            return Err(TaskError::Invalid("source_url is required".to_string()));
        }
        let task = DownloadTask::new(TaskId::new(), request, self.clock.now());
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &TaskId) -> TaskResult<DownloadTask> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound(id.to_string()))
    }

    async fn claim_next_queued(&self, now: DateTime<Utc>) -> TaskResult<Option<DownloadTask>> {
        let mut tasks = self.tasks.write();
        let next = tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by_key(|t| (t.created_at, t.id.clone()));
        Ok(next.map(|task| {
            task.start(now);
            task.clone()
        }))
    }

    async fn complete(&self, id: &TaskId, expected_version: u64, now: DateTime<Utc>) -> TaskResult<DownloadTask> {
        self.update(id, expected_version, "complete", |task| {
            task.complete(now);
            Ok(())
        })
    }

    async fn fail(
        &self,
        id: &TaskId,
        expected_version: u64,
        error: String,
        now: DateTime<Utc>,
    ) -> TaskResult<DownloadTask> {
        self.update(id, expected_version, "fail", |task| {
            task.fail(error, now);
            Ok(())
        })
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>, limit: usize) -> TaskResult<Vec<DownloadTask>> {
        let tasks = self.tasks.read();
        let mut stuck: Vec<DownloadTask> = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Downloading
                    && t.started_at.map_or(true, |at| at < started_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|t| (t.started_at, t.id.clone()));
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn requeue_stuck(
        &self,
        id: &TaskId,
        expected_version: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<DownloadTask>> {
        self.update_if_unchanged(id, expected_version, |task| task.requeue(reason, now))
    }

    async fn dead_letter_stuck(
        &self,
        id: &TaskId,
        expected_version: u64,
        reason: String,
        now: DateTime<Utc>,
    ) -> TaskResult<Option<DownloadTask>> {
        self.update_if_unchanged(id, expected_version, |task| task.fail(reason, now))
    }
}
