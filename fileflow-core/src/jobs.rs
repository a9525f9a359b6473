//! # Periodic jobs
//!
//! Sweeps and dispatch ticks run as independent timer-driven jobs. A job
//! is awaited to completion before the next tick is considered, and a
//! slow run delays the schedule instead of queueing a burst of catch-up
//! runs. [`SingleFlight`] additionally rejects overlapping manual
//! invocations of the same job on one node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// A unit of background work run on a fixed interval.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Execute one pass. Errors are logged by the runner and the next tick
    /// proceeds normally.
    async fn run_once(&self) -> anyhow::Result<()>;
}

/// Handle for managing a spawned periodic job.
pub struct JobHandle {
    name: &'static str,
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop after the current run (if any) finishes.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| anyhow::anyhow!("periodic job {} join error: {}", self.name, e))
    }
}

/// Spawn `job` on the current runtime, running it every `every`.
///
/// The first run happens immediately. Intervals below 10ms are raised to 10ms.
pub fn spawn_periodic(job: Arc<dyn PeriodicJob>, every: Duration) -> JobHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let name = job.name();

    let join_handle = tokio::spawn(async move {
        let mut ticker = interval(every.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(job = name, interval = ?every, "Starting periodic job");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!(job = name, "Periodic job stopping");
                    break;
                }
                _ = ticker.tick() => {
                    debug!(job = name, "Periodic job tick");
                    if let Err(e) = job.run_once().await {
                        warn!(job = name, error = %e, "Periodic job run failed");
                    }
                }
            }
        }
    });

    JobHandle {
        name,
        shutdown_tx,
        join_handle,
    }
}

/// Node-local guard that lets at most one run of a job proceed at a time.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if another run currently holds the guard.
    pub fn try_enter(&self) -> Option<SingleFlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlightGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the [`SingleFlight`] on drop.
#[derive(Debug)]
pub struct SingleFlightGuard {
    running: Arc<AtomicBool>,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
