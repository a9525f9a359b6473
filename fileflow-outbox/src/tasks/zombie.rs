//! Zombie download recovery.
//!
//! A worker that crashes mid-download leaves its task in DOWNLOADING
//! forever. The reaper requeues tasks that have been downloading longer
//! than `timeout`, and fails the ones that were already on their last
//! attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fileflow_core::{FlowConfigSnapshot, PeriodicJob, SharedClock, SingleFlight, SystemClock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::store::TaskStore;
use crate::{metrics::DispatchMetrics, TaskResult};

#[derive(Debug, Clone)]
pub struct ZombieConfig {
    /// Must stay below the outbox stale threshold
    pub timeout: Duration,
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl ZombieConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            timeout: snapshot
                .get_duration_secs("zombie.timeout_secs")
                .unwrap_or(defaults.timeout),
            interval: snapshot
                .get_duration_secs("zombie.interval_secs")
                .unwrap_or(defaults.interval),
            batch_size: snapshot
                .get_usize("zombie.batch_size")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ZombieReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Finished or reclaimed between the read and the update
    pub skipped: usize,
}

pub struct ZombieReaper {
    store: Arc<dyn TaskStore>,
    config: ZombieConfig,
    clock: SharedClock,
    metrics: Option<Arc<DispatchMetrics>>,
    flight: SingleFlight,
}

impl ZombieReaper {
    pub fn new(store: Arc<dyn TaskStore>, config: ZombieConfig) -> Self {
        Self {
            store,
            config,
            clock: SystemClock::shared(),
            metrics: None,
            flight: SingleFlight::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run one reaper cycle
    pub async fn reap(&self) -> TaskResult<ZombieReport> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Zombie reaper already running, skipping");
            return Ok(ZombieReport::default());
        };

        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let stuck = self
            .store
            .find_stuck(now - timeout, self.config.batch_size)
            .await?;

        let mut report = ZombieReport::default();
        for task in stuck {
            let result = if task.is_last_attempt() {
                let reason = format!(
                    "exhausted after {} attempts (stuck in DOWNLOADING)",
                    task.attempt + 1
                );
                self.store
                    .dead_letter_stuck(&task.id, task.version, reason, now)
                    .await
                    .map(|updated| updated.map(|t| (false, t)))
            } else {
                let reason = format!("stuck in DOWNLOADING for over {:?}", self.config.timeout);
                self.store
                    .requeue_stuck(&task.id, task.version, reason, now)
                    .await
                    .map(|updated| updated.map(|t| (true, t)))
            };

            match result {
                Ok(Some((true, requeued))) => {
                    report.requeued += 1;
                    warn!(
                        task_id = %requeued.id,
                        attempt = requeued.attempt,
                        max_attempts = requeued.max_attempts,
                        "Requeued zombie download task"
                    );
                }
                Ok(Some((false, failed))) => {
                    report.dead_lettered += 1;
                    error!(
                        task_id = %failed.id,
                        source_url = %failed.source_url,
                        error = failed.last_error.as_deref().unwrap_or_default(),
                        "Download task exhausted its attempts"
                    );
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.skipped += 1;
                    warn!(task_id = %task.id, error = %e, "Failed to recover zombie task");
                }
            }
        }

        if report.requeued + report.dead_lettered > 0 {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                "Zombie reaper finished"
            );
            if let Some(metrics) = &self.metrics {
                metrics.add_tasks_requeued(report.requeued as u64);
                metrics.add_tasks_dead_lettered(report.dead_lettered as u64);
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for ZombieReaper {
    fn name(&self) -> &'static str {
        "zombie-reaper"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.reap().await?;
        Ok(())
    }
}
