//! Object-storage port.
//!
//! The coordinator talks to the bucket only through [`ObjectStoragePort`].
//! Every failure is either [`StorageError::Transient`] (the same call may
//! succeed later) or [`StorageError::Permanent`].

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::{MemoryObjectStorage, StorageFault};
#[cfg(feature = "s3")]
pub use s3::{S3ObjectStorage, S3StorageConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{parts::PartTag, types::ObjectLocation, UploadError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("permanent storage failure: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn transient<S: Into<String>>(reason: S) -> Self {
        Self::Transient(reason.into())
    }

    pub fn permanent<S: Into<String>>(reason: S) -> Self {
        Self::Permanent(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Transient(reason) => UploadError::TransientStorage { reason },
            StorageError::Permanent(reason) => UploadError::PermanentStorage { reason },
        }
    }
}

#[async_trait]
pub trait ObjectStoragePort: Send + Sync {
    /// Start a multipart upload and return its handle.
    async fn initiate_multipart(&self, location: &ObjectLocation, content_type: &str) -> Result<String, StorageError>;

    async fn presign_part_url(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    async fn presign_put_url(
        &self,
        location: &ObjectLocation,
        content_type: &str,
        ttl: Duration,
    ) -> Result<String, StorageError>;

    /// Assemble the object from its parts and return the final ETag.
    async fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_handle: &str,
        parts: &[PartTag],
    ) -> Result<String, StorageError>;

    async fn abort_multipart(&self, location: &ObjectLocation, upload_handle: &str) -> Result<(), StorageError>;
}
