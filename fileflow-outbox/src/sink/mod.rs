//! Delivery targets for outbox messages, one per [`OutboxKind`].

pub mod channel;
#[cfg(feature = "http")]
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    types::{OutboxKind, OutboxMessage},
    SinkError,
};

pub use channel::ChannelSink;
#[cfg(feature = "http")]
pub use http::HttpSink;

/// A downstream consumer. `Ok` means the consumer accepted the message.
#[async_trait]
pub trait OutboxSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), SinkError>;
}

/// Lookup table from message kind to sink
#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: HashMap<OutboxKind, Arc<dyn OutboxSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: OutboxKind, sink: Arc<dyn OutboxSink>) -> &mut Self {
        self.sinks.insert(kind, sink);
        self
    }

    pub fn with_sink(mut self, kind: OutboxKind, sink: Arc<dyn OutboxSink>) -> Self {
        self.sinks.insert(kind, sink);
        self
    }

    pub fn get(&self, kind: OutboxKind) -> Option<Arc<dyn OutboxSink>> {
        self.sinks.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<OutboxKind> {
        let mut kinds: Vec<OutboxKind> = self.sinks.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
