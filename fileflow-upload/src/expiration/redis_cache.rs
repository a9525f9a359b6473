use std::time::Duration;

use async_trait::async_trait;
use fileflow_outbox::BoxStream;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{info, warn};

use super::{CacheError, CachePort};

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Redis-backed [`CachePort`].
///
/// Entries are plain `SET … EX` keys; expirations arrive on the
/// `__keyevent@{db}__:expired` channel.
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    manager: ConnectionManager,
    db: i64,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let db = client.get_connection_info().redis.db;
        let manager = ConnectionManager::new(client.clone()).await?;
        let cache = Self { client, manager, db };
        cache.enable_expiry_events().await;
        Ok(cache)
    }

    /// Managed Redis often forbids CONFIG; notifications must then be
    /// enabled server-side.
    async fn enable_expiry_events(&self) {
        let mut conn = self.manager.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => info!(db = self.db, "Enabled Redis key expiry notifications"),
            Err(e) => warn!(error = %e, "Could not enable Redis key expiry notifications"),
        }
    }

    fn expired_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.db)
    }
}

#[async_trait]
impl CachePort for RedisCache {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.manager.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    async fn subscribe_expirations(&self) -> Result<BoxStream<String>, CacheError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::Subscription(e.to_string()))?;
        pubsub
            .subscribe(self.expired_channel())
            .await
            .map_err(|e| CacheError::Subscription(e.to_string()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| futures::future::ready(msg.get_payload::<String>().ok()));
        Ok(Box::pin(stream))
    }
}
