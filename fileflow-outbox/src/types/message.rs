use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which downstream consumer a message is meant for.
///
/// All kinds share the same envelope and lifecycle; only the sink differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxKind {
    /// Publish to the internal work queue (asset registration etc.)
    QueueDispatch,
    /// Hand off to the media processing pipeline
    Pipeline,
    /// Tenant-configured webhook
    Webhook,
    /// One-shot callback URL supplied with a request
    Callback,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueDispatch => "QUEUE_DISPATCH",
            Self::Pipeline => "PIPELINE",
            Self::Webhook => "WEBHOOK",
            Self::Callback => "CALLBACK",
        }
    }

    pub fn all() -> [OutboxKind; 4] {
        [Self::QueueDispatch, Self::Pipeline, Self::Webhook, Self::Callback]
    }
}

impl fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference payload: enough to re-derive the event, never the event body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Domain id the event is about (session id, task id, asset id).
    pub subject: String,
    pub attributes: BTreeMap<String, String>,
}

impl PayloadRef {
    pub fn new<S: Into<String>>(subject: S) -> Self {
        Self {
            subject: subject.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}

/// A message to be written into the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub kind: OutboxKind,
    /// Unique across the outbox; enqueuing the same key twice is a no-op.
    pub idempotency_key: String,
    pub payload: PayloadRef,
}

impl NewOutboxMessage {
    pub fn new<K: Into<String>>(kind: OutboxKind, idempotency_key: K, payload: PayloadRef) -> Self {
        Self {
            kind,
            idempotency_key: idempotency_key.into(),
            payload,
        }
    }

    pub fn queue_dispatch<K: Into<String>>(idempotency_key: K, payload: PayloadRef) -> Self {
        Self::new(OutboxKind::QueueDispatch, idempotency_key, payload)
    }

    pub fn webhook<K: Into<String>, U: Into<String>>(idempotency_key: K, url: U, payload: PayloadRef) -> Self {
        Self::new(OutboxKind::Webhook, idempotency_key, payload.with_attribute("url", url))
    }

    pub fn callback<K: Into<String>, U: Into<String>>(idempotency_key: K, url: U, payload: PayloadRef) -> Self {
        Self::new(OutboxKind::Callback, idempotency_key, payload.with_attribute("url", url))
    }
}
