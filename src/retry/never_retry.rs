//! Retry manager that never retries failed messages. One and done.

use crate::retry::RetryManager;
use crate::types::MessageId;

#[derive(Debug, Default)]
pub struct NeverRetryManager;

impl RetryManager for NeverRetryManager {
    fn failed(&mut self, _message_id: &MessageId) {}

    fn acked(&mut self, _message_id: &MessageId) {}

    fn next_failed_message_to_retry(&mut self) -> Option<MessageId> {
        None
    }

    fn retry_further(&self, _message_id: &MessageId) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Partition, VirtualSourceId};

    #[test]
    fn test_never_retries() {
        let mut manager = NeverRetryManager;
        let id = MessageId::new(
            VirtualSourceId::new("test-source"),
            Partition::new("test-topic".to_string(), 0),
            0,
        );

        manager.failed(&id);
        assert!(!manager.retry_further(&id));
        assert_eq!(manager.next_failed_message_to_retry(), None);
    }
}
