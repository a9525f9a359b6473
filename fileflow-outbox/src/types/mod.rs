pub mod events;
pub mod ids;
pub mod message;
pub mod record;

pub use events::OutboxEvent;
pub use ids::{MessageId, TaskId};
pub use message::{NewOutboxMessage, OutboxKind, PayloadRef};
pub use record::{OutboxMessage, OutboxStatus, StatusCounts};
