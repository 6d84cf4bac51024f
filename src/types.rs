use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::filter::FilterChainStep;

/// One ordered sub-stream of the underlying log (topic + partition number).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// Stable identifier of one running virtual source, unique for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualSourceId(String);

impl VirtualSourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by the start and stop halves of one sideline request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidelineRequestId(Uuid);

impl SidelineRequestId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SidelineRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A request to divert the traffic matching `step` into its own virtual source.
#[derive(Clone)]
pub struct SidelineRequest {
    pub id: SidelineRequestId,
    pub step: Arc<dyn FilterChainStep>,
}

impl SidelineRequest {
    pub fn new(step: Arc<dyn FilterChainStep>) -> Self {
        Self {
            id: SidelineRequestId::new(),
            step,
        }
    }
}

/// Composite message identity: the sole token exchanged with the downstream
/// sink for ack/fail, and the lookup key in retry structures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    source_id: VirtualSourceId,
    partition: Partition,
    offset: i64,
}

impl MessageId {
    pub fn new(source_id: VirtualSourceId, partition: Partition, offset: i64) -> Self {
        Self {
            source_id,
            partition,
            offset,
        }
    }

    pub fn source_id(&self) -> &VirtualSourceId {
        &self.source_id
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}[{}]", self.source_id, self.partition, self.offset)
    }
}

/// A message flowing through the engine. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_equality_is_structural() {
        let source = VirtualSourceId::new("source-a");
        let partition = Partition::new("events".to_string(), 2);

        let a = MessageId::new(source.clone(), partition.clone(), 42);
        let b = MessageId::new(source.clone(), partition.clone(), 42);
        let c = MessageId::new(source, partition, 43);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_message_id_distinct_sources() {
        let partition = Partition::new("events".to_string(), 0);
        let a = MessageId::new(VirtualSourceId::new("a"), partition.clone(), 7);
        let b = MessageId::new(VirtualSourceId::new("b"), partition, 7);

        assert_ne!(a, b);
    }

    #[test]
    fn test_sideline_request_ids_are_unique() {
        assert_ne!(SidelineRequestId::new(), SidelineRequestId::new());
    }
}
