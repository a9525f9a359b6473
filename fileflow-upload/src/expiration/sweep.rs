use std::sync::Arc;

use async_trait::async_trait;
use fileflow_core::{PeriodicJob, SingleFlight};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::ExpirationConfig,
    coordinator::SessionCoordinator,
    session::SessionStatus,
    store::ExpiredCursor,
    UploadResult,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub failed: usize,
}

/// Periodic fallback for expirations the cache never announced.
///
/// Pages through open sessions past `expires_at` with a keyset cursor, so a
/// session that keeps failing does not hold up the ones behind it.
pub struct ReconciliationSweep {
    coordinator: Arc<SessionCoordinator>,
    config: ExpirationConfig,
    single_flight: SingleFlight,
}

impl ReconciliationSweep {
    pub fn new(coordinator: Arc<SessionCoordinator>, config: ExpirationConfig) -> Self {
        Self {
            coordinator,
            config,
            single_flight: SingleFlight::new(),
        }
    }

    #[instrument(skip(self), name = "expiration_sweep")]
    pub async fn sweep(&self) -> UploadResult<SweepReport> {
        let Some(_guard) = self.single_flight.try_enter() else {
            debug!("Sweep already running, skipping");
            return Ok(SweepReport::default());
        };

        let now = self.coordinator.clock().now();
        let page_size = self.config.sweep_page_size.max(1);
        let mut report = SweepReport::default();
        let mut cursor: Option<ExpiredCursor> = None;

        loop {
            let page = self
                .coordinator
                .sessions()
                .find_expired(now, cursor.as_ref(), page_size)
                .await?;
            let Some(last) = page.last() else { break };
            cursor = Some(ExpiredCursor::after(last));
            let full_page = page.len() == page_size;

            for session in page {
                report.scanned += 1;
                match self.coordinator.expire(&session.id).await {
                    Ok(s) if s.status == SessionStatus::Expired => report.expired += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(session_id = %session.id, status = %session.status, error = %e, "Sweep could not expire session");
                    }
                }
            }

            if !full_page {
                break;
            }
        }

        if report.scanned > 0 {
            info!(scanned = report.scanned, expired = report.expired, failed = report.failed, "Expiration sweep finished");
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for ReconciliationSweep {
    fn name(&self) -> &'static str {
        "expiration-sweep"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.sweep().await?;
        Ok(())
    }
}
