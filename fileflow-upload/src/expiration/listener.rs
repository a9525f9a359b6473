use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CachePort, ExpirationRegistry};
use crate::{coordinator::SessionCoordinator, UploadError};

/// Consumes key-expired notifications and expires the matching sessions.
///
/// Nothing escapes the loop: failed expirations are logged and left for the
/// reconciliation sweep, and a dropped subscription is re-established.
pub struct ExpirationListener {
    coordinator: Arc<SessionCoordinator>,
    cache: Arc<dyn CachePort>,
    retry_delay: Duration,
}

pub struct ListenerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(());
        self.join_handle
            .await
            .map_err(|e| anyhow::anyhow!("expiration listener join error: {}", e))
    }
}

impl ExpirationListener {
    pub fn new(coordinator: Arc<SessionCoordinator>, cache: Arc<dyn CachePort>) -> Self {
        Self {
            coordinator,
            cache,
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn spawn(self) -> ListenerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        ListenerHandle {
            shutdown_tx,
            join_handle,
        }
    }

    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        info!("Starting expiration listener");
        loop {
            let mut expirations = match self.cache.subscribe_expirations().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, retry_in = ?self.retry_delay, "Expiration subscription failed");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.retry_delay) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Expiration listener stopping");
                        return;
                    }
                    next = expirations.next() => match next {
                        Some(key) => {
                            self.handle_key(&key).await;
                        }
                        None => {
                            warn!("Expiration stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        info!("Expiration listener stopping");
    }

    /// Expire the session behind one cache key. Returns true when the
    /// session was moved to EXPIRED or was already closed.
    pub async fn handle_key(&self, key: &str) -> bool {
        let Some((kind, session_id)) = ExpirationRegistry::parse_key(key) else {
            debug!(key = %key, "Ignoring foreign expired key");
            return false;
        };

        match self.coordinator.expire(&session_id).await {
            Ok(session) => {
                debug!(session_id = %session_id, kind = %kind, status = %session.status, "Handled expiration notice");
                true
            }
            Err(UploadError::SessionAlreadyCompleted { .. }) => {
                debug!(session_id = %session_id, "Expiration notice for completed session");
                true
            }
            Err(e) => {
                warn!(session_id = %session_id, kind = %kind, error = %e, "Expiration notice not applied, leaving it to the sweep");
                false
            }
        }
    }
}
