//! fileflow-outbox: transactional outbox dispatch.
//!
//! Domain commits write [`NewOutboxMessage`]s next to their state change.
//! The [`OutboxDispatcher`] claims them in batches and delivers each to the
//! [`OutboxSink`] registered for its kind; [`StaleRecovery`] and
//! [`ZombieReaper`] reclaim work abandoned by crashed processes.

pub mod backend;
pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod recovery;
pub mod sink;
pub mod tasks;
pub mod types;

pub use backend::{memory::MemoryOutboxStore, BoxStream, OutboxStore};
pub use backoff::RetryPolicy;
pub use dispatcher::{DispatchConfig, DispatchReport, OutboxDispatcher};
pub use error::{OutboxError, OutboxResult, SinkError, TaskError, TaskResult};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use recovery::{StaleRecovery, StaleRecoveryConfig};
pub use sink::{ChannelSink, OutboxSink, SinkRegistry};
#[cfg(feature = "http")]
pub use sink::HttpSink;
pub use tasks::{
    webhook_key, DownloadTask, MemoryTaskStore, NewDownloadTask, TaskStatus, TaskStore, ZombieConfig,
    ZombieReaper, ZombieReport,
};
pub use types::{
    MessageId, NewOutboxMessage, OutboxEvent, OutboxKind, OutboxMessage, OutboxStatus, PayloadRef, StatusCounts,
    TaskId,
};
