//! Stale PROCESSING recovery.
//!
//! A dispatcher that dies between claim and resolve leaves its messages in
//! PROCESSING. Anything claimed longer ago than `stale_threshold` is put
//! back to PENDING so another tick delivers it again. The retry budget is
//! left alone: the delivery never reported an outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fileflow_core::{FlowConfigSnapshot, PeriodicJob, SharedClock, SingleFlight, SystemClock};
use tracing::{debug, info, warn};

use crate::{backend::OutboxStore, metrics::DispatchMetrics, OutboxResult};

#[derive(Debug, Clone)]
pub struct StaleRecoveryConfig {
    pub stale_threshold: Duration,
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for StaleRecoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(5 * 60),
            batch_size: 100,
        }
    }
}

impl StaleRecoveryConfig {
    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            stale_threshold: snapshot
                .get_duration_secs("outbox.stale_threshold_secs")
                .unwrap_or(defaults.stale_threshold),
            interval: snapshot
                .get_duration_secs("outbox.stale_interval_secs")
                .unwrap_or(defaults.interval),
            batch_size: snapshot
                .get_usize("outbox.batch_size")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
        }
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

pub struct StaleRecovery {
    store: Arc<dyn OutboxStore>,
    config: StaleRecoveryConfig,
    clock: SharedClock,
    metrics: Option<Arc<DispatchMetrics>>,
    flight: SingleFlight,
}

impl StaleRecovery {
    pub fn new(store: Arc<dyn OutboxStore>, config: StaleRecoveryConfig) -> Self {
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

    /// Reset stale PROCESSING messages. Returns how many were reset.
    pub async fn recover(&self) -> OutboxResult<usize> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Stale recovery already running, skipping");
            return Ok(0);
        };

        let now = self.clock.now();
        let threshold = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let stale = self
            .store
            .find_stale_processing(now - threshold, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for message in stale {
            match self.store.reset_stale(&message.id, message.version, now).await {
                Ok(true) => {
                    recovered += 1;
                    warn!(
                        message_id = %message.id,
                        kind = %message.kind,
                        processing_started_at = ?message.processing_started_at,
                        "Reset stale PROCESSING outbox message"
                    );
                }
                Ok(false) => {
                    debug!(message_id = %message.id, "Stale message resolved concurrently");
                }
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Failed to reset stale outbox message");
                }
            }
        }

        if recovered > 0 {
            info!("Recovered {} stale outbox messages", recovered);
            if let Some(metrics) = &self.metrics {
                metrics.add_stale_recovered(recovered as u64);
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl PeriodicJob for StaleRecovery {
    fn name(&self) -> &'static str {
        "outbox-stale-recovery"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.recover().await?;
        Ok(())
    }
}
