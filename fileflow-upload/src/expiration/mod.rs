//! Cache-backed session expiration.
//!
//! Each open session has a cache entry `{KIND}:{session_id}` living as long
//! as the session. The [`ExpirationListener`] turns key-expired
//! notifications into `expire` calls; the [`ReconciliationSweep`] catches
//! whatever the cache missed.

mod cache;
mod listener;
mod memory_cache;
#[cfg(feature = "redis")]
mod redis_cache;
mod registry;
mod sweep;

pub use cache::{CacheError, CachePort};
pub use listener::{ExpirationListener, ListenerHandle};
pub use memory_cache::MemoryTtlCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;
pub use registry::ExpirationRegistry;
pub use sweep::{ReconciliationSweep, SweepReport};
