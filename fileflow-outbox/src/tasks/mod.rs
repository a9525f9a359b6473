//! Long-running download tasks and their zombie recovery.

pub mod memory;
pub mod store;
pub mod types;
pub mod zombie;

pub use memory::MemoryTaskStore;
pub use store::TaskStore;
pub use types::{webhook_key, DownloadTask, NewDownloadTask, TaskStatus};
pub use zombie::{ZombieConfig, ZombieReaper, ZombieReport};
