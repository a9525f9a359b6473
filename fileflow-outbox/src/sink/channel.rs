use async_trait::async_trait;
use tokio::sync::mpsc;

use super::OutboxSink;
use crate::{types::OutboxMessage, SinkError};

/// Publishes messages onto an in-process bounded queue.
///
/// A full or closed queue counts as a failed delivery so the message is
/// retried on a later tick instead of blocking the dispatcher.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboxMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutboxMessage>) -> Self {
        Self { tx }
    }

    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<OutboxMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl OutboxSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<(), SinkError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::transport("queue is full"),
            mpsc::error::TrySendError::Closed(_) => SinkError::transport("queue is closed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, NewOutboxMessage, PayloadRef};
    use chrono::Utc;

    fn message() -> OutboxMessage {
        OutboxMessage::new(
            MessageId::new(),
            NewOutboxMessage::queue_dispatch("k", PayloadRef::new("upl_1")),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn delivers_until_full() {
        let (sink, mut rx) = ChannelSink::bounded(1);
        let msg = message();

        sink.deliver(&msg).await.unwrap();
        let err = sink.deliver(&msg).await.unwrap_err();
        assert_eq!(err, SinkError::transport("queue is full"));

        assert_eq!(rx.recv().await.unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn closed_queue_is_a_failure() {
        let (sink, rx) = ChannelSink::bounded(4);
        drop(rx);

        let err = sink.deliver(&message()).await.unwrap_err();
        assert_eq!(err, SinkError::transport("queue is closed"));
    }
}
