use std::time::Duration;

use async_trait::async_trait;
use fileflow_outbox::BoxStream;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache subscription failed: {0}")]
    Subscription(String),
}

/// TTL key/value cache with key-expired notifications
#[async_trait]
pub trait CachePort: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Stream of keys as they expire. Ends when the subscription drops.
    async fn subscribe_expirations(&self) -> Result<BoxStream<String>, CacheError>;
}
