//! Exponential-backoff retry manager.
//!
//! Retries failed messages up to `retry_limit` times; past that the caller
//! resolves them as acked. The delay before the Nth retry is
//! `min(N * initial_retry_delay * multiplier, retry_delay_max)`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::retry::{Clock, RetryConfig, RetryManager, SystemClock};
use crate::types::MessageId;

pub struct DefaultRetryManager {
    config: RetryConfig,

    /// How many times each message id has failed.
    fail_counts: HashMap<MessageId, u32>,

    /// Retry timestamps, each holding the ids eligible at or after it in
    /// failure order. At most one pending entry exists per id.
    schedule: BTreeMap<Instant, VecDeque<MessageId>>,

    /// Ids handed out for retry but not yet acked or failed again.
    in_flight: HashSet<MessageId>,

    clock: Arc<dyn Clock>,
}

impl DefaultRetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            fail_counts: HashMap::new(),
            schedule: BTreeMap::new(),
            in_flight: HashSet::new(),
            clock,
        }
    }

    fn retry_delay(&self, fail_count: u32) -> Duration {
        let delay_ms = fail_count as f64
            * self.config.initial_retry_delay.as_millis() as f64
            * self.config.retry_delay_multiplier;
        let max_ms = self.config.retry_delay_max.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Drop any pending schedule entry for an id that is being rescheduled.
    fn remove_scheduled(&mut self, message_id: &MessageId) {
        let bucket = self
            .schedule
            .iter()
            .find_map(|(ts, queue)| queue.contains(message_id).then_some(*ts));

        if let Some(ts) = bucket {
            if let Some(queue) = self.schedule.get_mut(&ts) {
                queue.retain(|id| id != message_id);
                if queue.is_empty() {
                    self.schedule.remove(&ts);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_count(&self, message_id: &MessageId) -> u32 {
        self.fail_counts.get(message_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self, message_id: &MessageId) -> bool {
        self.in_flight.contains(message_id)
    }

    #[cfg(test)]
    pub(crate) fn scheduled_count(&self) -> usize {
        self.schedule.values().map(VecDeque::len).sum()
    }
}

impl RetryManager for DefaultRetryManager {
    fn failed(&mut self, message_id: &MessageId) {
        let fail_count = self.fail_counts.get(message_id).copied().unwrap_or(0) + 1;
        self.fail_counts.insert(message_id.clone(), fail_count);

        // Reschedules must not leave a stale entry behind.
        if fail_count > 1 {
            self.remove_scheduled(message_id);
        }

        let delay = self.retry_delay(fail_count);
        let retry_at = self.clock.now() + delay;

        debug!(
            message_id = %message_id,
            fail_count = fail_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled message for retry"
        );

        self.schedule
            .entry(retry_at)
            .or_default()
            .push_back(message_id.clone());

        self.in_flight.remove(message_id);
    }

    fn acked(&mut self, message_id: &MessageId) {
        self.in_flight.remove(message_id);
        self.fail_counts.remove(message_id);
    }

    fn next_failed_message_to_retry(&mut self) -> Option<MessageId> {
        let now = self.clock.now();
        let ts = self
            .schedule
            .range(..=now)
            .next()
            .map(|(ts, _)| *ts)?;

        let queue = self.schedule.get_mut(&ts)?;
        let message_id = queue.pop_front()?;
        if queue.is_empty() {
            self.schedule.remove(&ts);
        }

        self.in_flight.insert(message_id.clone());
        Some(message_id)
    }

    fn retry_further(&self, message_id: &MessageId) -> bool {
        if self.config.retry_limit == 0 {
            return false;
        }
        if self.config.retry_limit < 0 {
            return true;
        }

        let fail_count = self.fail_counts.get(message_id).copied().unwrap_or(0);
        fail_count < self.config.retry_limit as u32
    }
}
