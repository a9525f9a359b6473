//! # Outbox dispatcher
//!
//! One tick claims a batch, delivers each claimed message to the sink for
//! its kind and records the outcome:
//!
//! 1. PENDING messages oldest-first, then FAILED messages whose backoff
//!    has elapsed, up to `batch_size`.
//! 2. Each candidate is flipped to PROCESSING with a conditional update.
//!    A candidate another dispatcher already took is skipped.
//! 3. The sink is called under `sink_timeout` with no store lock held.
//! 4. Success marks SENT. Failure marks FAILED and bumps `retry_count`;
//!    reaching `max_retry_count` makes the message a dead letter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fileflow_core::{FlowConfigSnapshot, PeriodicJob, SharedClock, SingleFlight, SystemClock};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::OutboxStore,
    backoff::RetryPolicy,
    metrics::DispatchMetrics,
    sink::SinkRegistry,
    types::OutboxMessage,
    OutboxResult, SinkError,
};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: usize,
    /// Concurrent sink calls within one tick
    pub concurrency: usize,
    pub sink_timeout: Duration,
    pub tick_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 8,
            sink_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            batch_size: snapshot
                .get_usize("outbox.batch_size")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            concurrency: snapshot
                .get_usize("outbox.concurrency")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            sink_timeout: snapshot
                .get_duration_secs("outbox.sink_timeout_secs")
                .unwrap_or(defaults.sink_timeout),
            tick_interval: snapshot
                .get_duration_secs("outbox.tick_interval_secs")
                .unwrap_or(defaults.tick_interval),
            retry: RetryPolicy::from_snapshot(snapshot),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Another tick was still running on this node
    pub skipped: bool,
    pub claimed: usize,
    pub sent: usize,
    /// Failed with retries remaining
    pub failed: usize,
    pub dead_lettered: usize,
    /// Candidates another dispatcher claimed first
    pub lost_races: usize,
    /// Outcome could not be recorded (the message changed under us)
    pub abandoned: usize,
}

impl DispatchReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum Outcome {
    Sent,
    Failed,
    DeadLettered,
    Abandoned,
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    sinks: SinkRegistry,
    config: DispatchConfig,
    clock: SharedClock,
    metrics: Arc<DispatchMetrics>,
    flight: SingleFlight,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, sinks: SinkRegistry) -> Self {
        Self::with_config(store, sinks, DispatchConfig::default())
    }

    pub fn with_config(store: Arc<dyn OutboxStore>, sinks: SinkRegistry, config: DispatchConfig) -> Self {
        Self {
            store,
            sinks,
            config,
            clock: SystemClock::shared(),
            metrics: Arc::new(DispatchMetrics::new()),
            flight: SingleFlight::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.metrics.clone()
    }

    /// Messages whose retry budget is spent.
    pub async fn dead_letters(&self, limit: usize) -> OutboxResult<Vec<OutboxMessage>> {
        self.store
            .find_dead_letters(self.config.retry.max_retry_count, limit)
            .await
    }

    /// Run one claim/deliver/resolve pass.
    #[instrument(skip(self), name = "outbox.dispatch_tick")]
    pub async fn run_tick(&self) -> OutboxResult<DispatchReport> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Dispatch tick already running, skipping");
            return Ok(DispatchReport::skipped());
        };

        let now = self.clock.now();
        let batch_size = self.config.batch_size;

        let mut candidates = self.store.find_pending(batch_size).await?;
        let remaining = batch_size.saturating_sub(candidates.len());
        if remaining > 0 {
            candidates.extend(
                self.store
                    .find_retryable(&self.config.retry, now, remaining)
                    .await?,
            );
        }

        let mut report = DispatchReport::default();
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self
                .store
                .try_claim(&candidate.id, candidate.status, candidate.version, now)
                .await
            {
                Ok(Some(message)) => {
                    self.metrics.increment_claimed();
                    claimed.push(message);
                }
                Ok(None) => {
                    debug!(message_id = %candidate.id, "Outbox message claimed elsewhere");
                    self.metrics.increment_lost_races();
                    report.lost_races += 1;
                }
                Err(e) => {
                    warn!(message_id = %candidate.id, error = %e, "Failed to claim outbox message");
                }
            }
        }
        report.claimed = claimed.len();

        let outcomes: Vec<Outcome> = futures::stream::iter(claimed)
            .map(|message| self.dispatch_one(message))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Sent => report.sent += 1,
                Outcome::Failed => report.failed += 1,
                Outcome::DeadLettered => report.dead_lettered += 1,
                Outcome::Abandoned => report.abandoned += 1,
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Outbox dispatch tick finished"
            );
        }
        Ok(report)
    }

    async fn dispatch_one(&self, message: OutboxMessage) -> Outcome {
        let result = match self.sinks.get(message.kind) {
            None => Err(SinkError::Unroutable(message.kind)),
            Some(sink) => {
                match tokio::time::timeout(self.config.sink_timeout, sink.deliver(&message)).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout(self.config.sink_timeout)),
                }
            }
        };

        let now = self.clock.now();
        match result {
            Ok(()) => match self.store.mark_sent(&message.id, message.version, now).await {
                Ok(_) => {
                    self.metrics.increment_sent();
                    debug!(message_id = %message.id, kind = %message.kind, "Outbox message sent");
                    Outcome::Sent
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Delivered but could not mark outbox message sent");
                    Outcome::Abandoned
                }
            },
            Err(sink_error) => {
                let policy = &self.config.retry;
                let dead_letter = policy.is_exhausted(message.retry_count + 1);
                let reason = sink_error.to_string();

                match self
                    .store
                    .mark_failed(&message.id, message.version, reason.clone(), dead_letter, now)
                    .await
                {
                    Ok(failed) if dead_letter => {
                        self.metrics.increment_dead_lettered();
                        error!(
                            message_id = %failed.id,
                            kind = %failed.kind,
                            retry_count = failed.retry_count,
                            error = %reason,
                            "Outbox message exhausted its retries"
                        );
                        Outcome::DeadLettered
                    }
                    Ok(failed) => {
                        self.metrics.increment_failed();
                        warn!(
                            message_id = %failed.id,
                            kind = %failed.kind,
                            retry_count = failed.retry_count,
                            next_retry_at = %policy.next_retry_at(&failed),
                            error = %reason,
                            "Outbox delivery failed, will retry"
                        );
                        Outcome::Failed
                    }
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "Could not record outbox delivery failure");
                        Outcome::Abandoned
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for OutboxDispatcher {
    fn name(&self) -> &'static str {
        "outbox-dispatcher"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.run_tick().await?;
        Ok(())
    }
}
