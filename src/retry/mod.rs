//! Per-message retry scheduling.
//!
//! Each virtual source owns exactly one retry manager and drives it from its
//! own task, so implementations are single-writer and need no internal
//! locking.

pub mod default_retry;
pub mod never_retry;

use std::time::{Duration, Instant};

use crate::types::MessageId;

pub use default_retry::DefaultRetryManager;
pub use never_retry::NeverRetryManager;

/// Time source for retry scheduling. Injected so tests can drive time
/// deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time, the production implementation.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Negative means retry forever, zero means never retry, positive is an
    /// upper bound on the number of failures before a message is abandoned.
    pub retry_limit: i32,
    /// Base delay after the first failure.
    pub initial_retry_delay: Duration,
    /// Scaling applied per accumulated failure. Must be >= 1.0.
    pub retry_delay_multiplier: f64,
    /// Upper clamp on the computed delay.
    pub retry_delay_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_limit: -1,
            initial_retry_delay: Duration::from_millis(2000),
            retry_delay_multiplier: 2.0,
            retry_delay_max: Duration::from_millis(900_000),
        }
    }
}

/// Which retry manager implementation each virtual source gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    Default,
    Never,
}

impl std::str::FromStr for RetryPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "default" => Ok(Self::Default),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown retry policy '{other}'")),
        }
    }
}

/// Build a fresh retry manager for one virtual source.
pub fn build_retry_manager(policy: RetryPolicy, config: &RetryConfig) -> Box<dyn RetryManager> {
    match policy {
        RetryPolicy::Default => Box::new(DefaultRetryManager::new(config.clone())),
        RetryPolicy::Never => Box::new(NeverRetryManager),
    }
}

/// Decides whether and when a failed message is retried.
///
/// `next_failed_message_to_retry` returning `None` is the steady-state
/// "nothing to do" signal, checked on every scheduling pass. Callers must
/// treat messages for which `retry_further` returns `false` as permanently
/// resolved rather than retried forever.
pub trait RetryManager: Send {
    /// Record a failure for a message and schedule its next retry.
    fn failed(&mut self, message_id: &MessageId);

    /// Forget all retry history for a successfully processed message.
    fn acked(&mut self, message_id: &MessageId);

    /// The message with the earliest eligible retry timestamp, if any.
    /// Returned messages are in flight until acked or failed again.
    fn next_failed_message_to_retry(&mut self) -> Option<MessageId>;

    /// Whether the message is still within its retry budget.
    fn retry_further(&self, message_id: &MessageId) -> bool;
}
