use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::CachePort;
use crate::types::{SessionId, SessionKind};

/// Writes and clears the cache entries that track open sessions.
///
/// Cache trouble is logged and swallowed: the reconciliation sweep covers
/// any entry that was never written or never removed.
#[derive(Clone)]
pub struct ExpirationRegistry {
    cache: Arc<dyn CachePort>,
}

impl ExpirationRegistry {
    pub fn new(cache: Arc<dyn CachePort>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<dyn CachePort> {
        &self.cache
    }

    pub fn cache_key(kind: SessionKind, session_id: &SessionId) -> String {
        format!("{}:{}", kind.as_str(), session_id)
    }

    /// Inverse of [`cache_key`](Self::cache_key); `None` for foreign keys.
    pub fn parse_key(key: &str) -> Option<(SessionKind, SessionId)> {
        let (kind, id) = key.split_once(':')?;
        let kind = SessionKind::parse(kind)?;
        if !id.starts_with("upl_") || id.len() <= 4 {
            return None;
        }
        Some((kind, SessionId::from(id)))
    }

    pub async fn register(&self, session_id: &SessionId, kind: SessionKind, ttl: Duration) {
        let key = Self::cache_key(kind, session_id);
        match self.cache.put(&key, session_id.as_str(), ttl).await {
            Ok(()) => debug!(key = %key, ttl = ?ttl, "Registered session expiration"),
            Err(e) => warn!(key = %key, error = %e, "Failed to register session expiration"),
        }
    }

    pub async fn remove(&self, kind: SessionKind, session_id: &SessionId) {
        let key = Self::cache_key(kind, session_id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!(key = %key, error = %e, "Failed to remove session expiration");
        }
    }

    pub async fn is_registered(&self, kind: SessionKind, session_id: &SessionId) -> bool {
        self.cache
            .exists(&Self::cache_key(kind, session_id))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip_and_reject_foreign_entries() {
        let id = SessionId::from("upl_0123abcd");
        let key = ExpirationRegistry::cache_key(SessionKind::Multipart, &id);
        assert_eq!(key, "MULTIPART:upl_0123abcd");
        assert_eq!(ExpirationRegistry::parse_key(&key), Some((SessionKind::Multipart, id)));

        for foreign in ["session:42", "SINGLE:", "SINGLE:upl_", "SINGLE:abc", "no-colon"] {
            assert_eq!(ExpirationRegistry::parse_key(foreign), None, "{foreign}");
        }
    }
}
