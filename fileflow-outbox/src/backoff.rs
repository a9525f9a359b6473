//! Exponential retry backoff for FAILED outbox messages.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fileflow_core::FlowConfigSnapshot;

use crate::types::{OutboxMessage, OutboxStatus};

/// `delay(n) = base * multiplier^(n - 1)`, capped at `max_delay`, where `n`
/// is the message's retry count after its latest failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// FAILED messages with `retry_count >= max_retry_count` are dead letters
    pub max_retry_count: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &FlowConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            max_retry_count: snapshot
                .get_u32("outbox.max_retry_count")
                .unwrap_or(defaults.max_retry_count),
            base_delay: snapshot
                .get_duration_secs("outbox.backoff_base_secs")
                .unwrap_or(defaults.base_delay),
            multiplier: snapshot
                .get_f64("outbox.backoff_multiplier")
                .filter(|m| *m >= 1.0)
                .unwrap_or(defaults.multiplier),
            max_delay: snapshot
                .get_duration_secs("outbox.max_backoff_secs")
                .unwrap_or(defaults.max_delay),
        }
    }

    pub fn with_max_retry_count(mut self, max: u32) -> Self {
        self.max_retry_count = max;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Wait before the next attempt of a message that has failed `retry_count` times.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retry_count
    }

    pub fn next_retry_at(&self, message: &OutboxMessage) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(message.retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        message.updated_at + delay
    }

    /// FAILED, budget remaining, and backoff elapsed.
    pub fn is_due(&self, message: &OutboxMessage, now: DateTime<Utc>) -> bool {
        message.status == OutboxStatus::Failed
            && !self.is_exhausted(message.retry_count)
            && self.next_retry_at(message) <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, NewOutboxMessage, PayloadRef};
    use fileflow_core::FlowConfig;
    use proptest::prelude::*;

    fn failed_message(retry_count: u32, updated_at: DateTime<Utc>) -> OutboxMessage {
        let mut msg = OutboxMessage::new(
            MessageId::new(),
            NewOutboxMessage::queue_dispatch("k", PayloadRef::new("s")),
            updated_at,
        );
        msg.status = OutboxStatus::Failed;
        msg.retry_count = retry_count;
        msg
    }

    #[test]
    fn delays_double_from_the_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(3), Duration::from_secs(240));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_secs(100));
        assert_eq!(policy.delay_for(2), Duration::from_secs(100));
        assert_eq!(policy.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn due_only_after_backoff_and_within_budget() {
        let policy = RetryPolicy::default();
        let at = Utc::now();
        let msg = failed_message(1, at);

        assert!(!policy.is_due(&msg, at + chrono::Duration::seconds(59)));
        assert!(policy.is_due(&msg, at + chrono::Duration::seconds(60)));

        let exhausted = failed_message(3, at);
        assert!(!policy.is_due(&exhausted, at + chrono::Duration::days(1)));
    }

    #[test]
    fn from_snapshot_overrides_defaults() {
        let mut config = FlowConfig::new();
        config.set("outbox.max_retry_count", "5");
        config.set("outbox.backoff_base_secs", "10");
        config.set("outbox.backoff_multiplier", "0.5");

        let policy = RetryPolicy::from_snapshot(&config.snapshot());
        assert_eq!(policy.max_retry_count, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        // multipliers below 1 would shrink delays; ignored
        assert_eq!(policy.multiplier, 2.0);
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_never_exceed_cap(n in 1u32..200) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for(n) <= policy.max_delay);
            prop_assert!(policy.delay_for(n + 1) >= policy.delay_for(n));
        }
    }
}
