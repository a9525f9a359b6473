use fileflow_outbox::MessageId;
use serde::Serialize;

use crate::{session::UploadSession, types::SessionId};

/// Returned by a successful completion: the COMPLETED session and the id of
/// the asset-registration message, for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionReceipt {
    pub session: UploadSession,
    pub message_id: MessageId,
}

/// Outbox idempotency key of the asset-registration message.
pub fn completion_key(session_id: &SessionId) -> String {
    format!("upload-completed:{session_id}")
}

/// Outbox idempotency key of the client callback message.
pub fn callback_key(session_id: &SessionId) -> String {
    format!("upload-callback:{session_id}")
}
