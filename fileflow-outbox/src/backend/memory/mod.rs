pub mod storage;

pub use storage::MemoryOutboxStore;
