//! fileflow-upload: the upload session lifecycle.
//!
//! A [`SessionCoordinator`] creates single and multipart sessions, issues
//! presigned URLs through an [`ObjectStoragePort`], records parts and
//! finalizes uploads. Completion writes an asset-registration message to
//! the outbox in the same [`SessionStore::commit`] as the COMPLETED session.
//! Sessions that are never finished are expired by the
//! [`ExpirationListener`] (cache TTL notifications) or, failing that, by the
//! hourly [`ReconciliationSweep`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod expiration;
pub mod parts;
pub mod receipt;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;

pub use config::{ExpirationConfig, UploadConfig};
pub use coordinator::SessionCoordinator;
pub use error::{UploadError, UploadResult};
pub use events::SessionEvent;
pub use expiration::{
    CacheError, CachePort, ExpirationListener, ExpirationRegistry, ListenerHandle, MemoryTtlCache,
    ReconciliationSweep, SweepReport,
};
#[cfg(feature = "redis")]
pub use expiration::RedisCache;
pub use parts::{CompletedPart, PartSet, PartTag};
pub use receipt::{callback_key, completion_key, CompletionReceipt};
pub use session::{SessionDetail, SessionStatus, Transition, UploadSession};
pub use storage::{MemoryObjectStorage, ObjectStoragePort, StorageError, StorageFault};
#[cfg(feature = "s3")]
pub use storage::{S3ObjectStorage, S3StorageConfig};
pub use store::{CommitOutcome, ExpiredCursor, MemorySessionStore, SessionCommit, SessionStore};
pub use types::{
    AccessType, DatePartitionedKeys, MultipartRequest, ObjectLocation, ReportedPart, SessionId, SessionKind,
    StorageKeyStrategy, UploadRequest,
};
