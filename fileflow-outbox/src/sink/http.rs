use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::OutboxSink;
use crate::{
    types::{OutboxKind, OutboxMessage},
    SinkError,
};

/// Body POSTed to webhook and callback URLs.
#[derive(Debug, Serialize)]
pub struct HttpEnvelope<'a> {
    pub message_id: &'a str,
    pub kind: OutboxKind,
    pub subject: &'a str,
    pub attributes: &'a std::collections::BTreeMap<String, String>,
    pub attempt: u32,
}

impl<'a> HttpEnvelope<'a> {
    pub fn from_message(message: &'a OutboxMessage) -> Self {
        Self {
            message_id: message.id.as_str(),
            kind: message.kind,
            subject: &message.payload.subject,
            attributes: &message.payload.attributes,
            attempt: message.retry_count + 1,
        }
    }
}

/// Webhook/callback delivery over HTTP. Any non-2xx response is a failure.
///
/// The target comes from the message's `url` attribute.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Client with its own request timeout; the dispatcher applies an outer one too.
    pub fn with_timeout(timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OutboxSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), SinkError> {
        let url = message
            .payload
            .attribute("url")
            .ok_or_else(|| SinkError::invalid_payload("missing `url` attribute"))?;

        debug!(message_id = %message.id, url, "Delivering outbox message over HTTP");

        let response = self
            .client
            .post(url)
            .header("Idempotency-Key", message.idempotency_key.as_str())
            .json(&HttpEnvelope::from_message(message))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SinkError::transport(format!("request timed out: {}", e))
                } else {
                    SinkError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}
