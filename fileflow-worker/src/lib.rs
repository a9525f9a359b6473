//! fileflow-worker: runs every background job of the upload platform in one
//! process, backed by the in-memory stores.

pub mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fileflow_core::{spawn_periodic, FlowConfigSnapshot, JobHandle, PeriodicJob, SharedClock, SystemClock};
use fileflow_outbox::{
    ChannelSink, DispatchConfig, DispatchMetrics, HttpSink, MemoryOutboxStore, MemoryTaskStore, OutboxDispatcher,
    OutboxKind, OutboxMessage, SinkRegistry, StaleRecovery, StaleRecoveryConfig, ZombieConfig, ZombieReaper,
};
use fileflow_upload::{
    CachePort, ExpirationConfig, ExpirationListener, ExpirationRegistry, ListenerHandle, MemoryObjectStorage,
    MemorySessionStore, MemoryTtlCache, ObjectStoragePort, ReconciliationSweep, SessionCoordinator, UploadConfig,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment prefix: `FILEFLOW__OUTBOX__BATCH_SIZE` sets `outbox.batch_size`.
pub const ENV_PREFIX: &str = "FILEFLOW__";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_EVICT_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the worker runs, built but not yet started
pub struct Worker {
    coordinator: Arc<SessionCoordinator>,
    outbox: Arc<MemoryOutboxStore>,
    tasks: Arc<MemoryTaskStore>,
    metrics: Arc<DispatchMetrics>,
    cache: Arc<dyn CachePort>,
    expiration: ExpirationConfig,
    jobs: Vec<(Arc<dyn PeriodicJob>, Duration)>,
    queues: Vec<(&'static str, mpsc::Receiver<OutboxMessage>)>,
    running: Vec<JobHandle>,
    consumers: Vec<JoinHandle<()>>,
    listener: Option<ListenerHandle>,
}

/// Wire stores, sinks and jobs from configuration.
pub async fn build(snapshot: FlowConfigSnapshot) -> Result<Worker> {
    let clock = SystemClock::shared();
    let outbox = Arc::new(MemoryOutboxStore::with_clock(clock.clone()));
    let sessions = Arc::new(MemorySessionStore::new(outbox.clone()));
    let tasks = Arc::new(MemoryTaskStore::with_clock(outbox.clone(), clock.clone()));
    let metrics = Arc::new(DispatchMetrics::new());
    let mut jobs: Vec<(Arc<dyn PeriodicJob>, Duration)> = Vec::new();

    let storage = object_storage(&snapshot).await?;
    let cache = cache(&snapshot, clock.clone(), &mut jobs).await?;

    let coordinator = Arc::new(
        SessionCoordinator::new(sessions, storage, outbox.clone(), ExpirationRegistry::new(cache.clone()))
            .with_config(UploadConfig::from_snapshot(&snapshot))
            .with_clock(clock.clone()),
    );

    // Sinks
    let capacity = snapshot
        .get_usize("worker.queue_capacity")
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_QUEUE_CAPACITY);
    let (asset_sink, asset_rx) = ChannelSink::bounded(capacity);
    let (pipeline_sink, pipeline_rx) = ChannelSink::bounded(capacity);
    let dispatch = DispatchConfig::from_snapshot(&snapshot);
    let http = Arc::new(HttpSink::with_timeout(dispatch.sink_timeout)?);
    let sinks = SinkRegistry::new()
        .with_sink(OutboxKind::QueueDispatch, Arc::new(asset_sink))
        .with_sink(OutboxKind::Pipeline, Arc::new(pipeline_sink))
        .with_sink(OutboxKind::Webhook, http.clone())
        .with_sink(OutboxKind::Callback, http);

    // Jobs
    let tick = dispatch.tick_interval;
    let dispatcher = OutboxDispatcher::with_config(outbox.clone(), sinks, dispatch)
        .with_clock(clock.clone())
        .with_metrics(metrics.clone());
    jobs.push((Arc::new(dispatcher) as Arc<dyn PeriodicJob>, tick));

    let stale = StaleRecoveryConfig::from_snapshot(&snapshot);
    let stale_every = stale.interval;
    let recovery = StaleRecovery::new(outbox.clone(), stale)
        .with_clock(clock.clone())
        .with_metrics(metrics.clone());
    jobs.push((Arc::new(recovery) as Arc<dyn PeriodicJob>, stale_every));

    let zombie = ZombieConfig::from_snapshot(&snapshot);
    let zombie_every = zombie.interval;
    let reaper = ZombieReaper::new(tasks.clone(), zombie)
        .with_clock(clock.clone())
        .with_metrics(metrics.clone());
    jobs.push((Arc::new(reaper) as Arc<dyn PeriodicJob>, zombie_every));

    let expiration = ExpirationConfig::from_snapshot(&snapshot);
    let sweep = ReconciliationSweep::new(coordinator.clone(), expiration.clone());
    jobs.push((Arc::new(sweep) as Arc<dyn PeriodicJob>, expiration.sweep_interval));

    info!(jobs = jobs.len(), queue_capacity = capacity, "Worker built");
    Ok(Worker {
        coordinator,
        outbox,
        tasks,
        metrics,
        cache,
        expiration,
        jobs,
        queues: vec![("asset-registration", asset_rx), ("pipeline", pipeline_rx)],
        running: Vec::new(),
        consumers: Vec::new(),
        listener: None,
    })
}

async fn object_storage(snapshot: &FlowConfigSnapshot) -> Result<Arc<dyn ObjectStoragePort>> {
    match snapshot.get("storage.backend").unwrap_or("memory") {
        "memory" => {
            warn!("Using in-memory object storage, presigned URLs are not reachable");
            Ok(Arc::new(MemoryObjectStorage::new()))
        }
        #[cfg(feature = "s3")]
        "s3" => {
            let config = fileflow_upload::S3StorageConfig::from_snapshot(snapshot)?;
            info!(region = %config.region, endpoint = ?config.endpoint_url, "Using S3 object storage");
            Ok(Arc::new(fileflow_upload::S3ObjectStorage::connect(config).await))
        }
        other => anyhow::bail!("unsupported storage.backend {:?}", other),
    }
}

async fn cache(
    snapshot: &FlowConfigSnapshot,
    clock: SharedClock,
    jobs: &mut Vec<(Arc<dyn PeriodicJob>, Duration)>,
) -> Result<Arc<dyn CachePort>> {
    match snapshot.get("cache.backend").unwrap_or("memory") {
        "memory" => {
            let cache = Arc::new(MemoryTtlCache::with_clock(clock));
            let every = snapshot
                .get_duration_secs("cache.evict_interval_secs")
                .filter(|d| !d.is_zero())
                .unwrap_or(DEFAULT_EVICT_INTERVAL);
            jobs.push((cache.clone() as Arc<dyn PeriodicJob>, every));
            Ok(cache as Arc<dyn CachePort>)
        }
        #[cfg(feature = "redis")]
        "redis" => {
            let url = snapshot.require("cache.redis_url")?;
            let cache = fileflow_upload::RedisCache::connect(url).await?;
            info!("Using Redis expiration cache");
            Ok(Arc::new(cache))
        }
        other => anyhow::bail!("unsupported cache.backend {:?}", other),
    }
}

impl Worker {
    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        self.coordinator.clone()
    }

    pub fn outbox(&self) -> Arc<MemoryOutboxStore> {
        self.outbox.clone()
    }

    pub fn tasks(&self) -> Arc<MemoryTaskStore> {
        self.tasks.clone()
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|(job, _)| job.name()).collect()
    }

    /// Spawn every job, the expiration listener and the queue consumers.
    pub fn start(&mut self) {
        for (job, every) in &self.jobs {
            self.running.push(spawn_periodic(job.clone(), *every));
        }

        let listener = ExpirationListener::new(self.coordinator.clone(), self.cache.clone())
            .with_retry_delay(self.expiration.listener_retry_delay);
        self.listener = Some(listener.spawn());

        for (name, rx) in self.queues.drain(..) {
            self.consumers.push(spawn_consumer(name, rx));
        }
        info!(jobs = self.running.len(), "Worker started");
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(listener) = self.listener.take() {
            listener.shutdown().await?;
        }
        for handle in self.running.drain(..) {
            let name = handle.name();
            if let Err(e) = handle.shutdown().await {
                warn!(job = name, error = %e, "Job did not stop cleanly");
            }
        }
        for consumer in self.consumers.drain(..) {
            consumer.abort();
        }

        let metrics = serde_json::to_string(&self.metrics.snapshot())?;
        info!(metrics = %metrics, "Worker stopped");
        Ok(())
    }
}

/// In-process stand-in for the downstream consumer of a queue kind.
fn spawn_consumer(name: &'static str, mut rx: mpsc::Receiver<OutboxMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            info!(
                queue = name,
                message_id = %message.id,
                subject = %message.payload.subject,
                event = message.payload.attribute("event").unwrap_or("-"),
                "Consumed outbox message"
            );
        }
        debug!(queue = name, "Queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileflow_core::FlowConfig;

    #[tokio::test]
    async fn builds_every_job_from_defaults() {
        let worker = build(FlowConfig::new().snapshot()).await.unwrap();
        let names = worker.job_names();
        for expected in [
            "cache-evictor",
            "outbox-dispatcher",
            "outbox-stale-recovery",
            "zombie-reaper",
            "expiration-sweep",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let mut config = FlowConfig::new();
        config.set("storage.backend", "ftp");
        assert!(build(config.snapshot()).await.is_err());
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let mut worker = build(FlowConfig::new().snapshot()).await.unwrap();
        worker.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.shutdown().await.unwrap();
    }
}
