//! Fair multiplexing buffer between virtual sources and the downstream sink.
//!
//! Each registered source gets its own bounded queue, so backpressure is
//! isolated: `put` suspends only the producer whose queue is full. `poll`
//! never blocks and serves source queues round-robin, bounding the worst-case
//! wait for any source to the number of currently-active sources.

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::metrics_const::{BUFFER_MESSAGES_DISCARDED, BUFFER_REGISTERED_SOURCES};
use crate::types::{Message, VirtualSourceId};

pub struct FairBuffer {
    /// Producer handles, looked up per `put` call.
    senders: DashMap<VirtualSourceId, mpsc::Sender<Message>>,
    /// Consumer side, only touched by the single polling consumer.
    inner: Mutex<BufferInner>,
    /// Per-source queue capacity.
    capacity: usize,
}

struct BufferInner {
    queues: Vec<(VirtualSourceId, mpsc::Receiver<Message>)>,
    /// Index of the next queue to try, advanced past each served source.
    cursor: usize,
}

impl FairBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            inner: Mutex::new(BufferInner {
                queues: Vec::new(),
                cursor: 0,
            }),
            capacity,
        }
    }

    /// Register a producer and allocate its dedicated queue. Safe to call
    /// while other producers are actively putting and the consumer polling.
    pub fn add_source(&self, source_id: VirtualSourceId) {
        if self.senders.contains_key(&source_id) {
            debug!(source_id = %source_id, "Source already registered with buffer");
            return;
        }

        let (sender, receiver) = mpsc::channel(self.capacity);
        self.senders.insert(source_id.clone(), sender);

        let mut inner = self.inner.lock().expect("fair buffer lock poisoned");
        inner.queues.push((source_id.clone(), receiver));

        metrics::gauge!(BUFFER_REGISTERED_SOURCES).set(inner.queues.len() as f64);
        debug!(source_id = %source_id, "Registered source with buffer");
    }

    /// Deregister a producer, discarding its queued-but-unconsumed messages.
    pub fn remove_source(&self, source_id: &VirtualSourceId) {
        self.senders.remove(source_id);

        let mut inner = self.inner.lock().expect("fair buffer lock poisoned");
        let Some(idx) = inner.queues.iter().position(|(id, _)| id == source_id) else {
            return;
        };

        let (_, mut receiver) = inner.queues.remove(idx);
        if idx < inner.cursor {
            inner.cursor -= 1;
        }
        if inner.cursor >= inner.queues.len() {
            inner.cursor = 0;
        }
        metrics::gauge!(BUFFER_REGISTERED_SOURCES).set(inner.queues.len() as f64);
        drop(inner);

        receiver.close();
        let mut discarded = 0u64;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            metrics::counter!(BUFFER_MESSAGES_DISCARDED).increment(discarded);
            info!(
                source_id = %source_id,
                discarded = discarded,
                "Discarded undelivered messages for removed source"
            );
        }
    }

    /// Enqueue a message onto its source's queue, suspending only while that
    /// queue is at capacity. Cancel-safe under the producer's shutdown signal.
    pub async fn put(&self, source_id: &VirtualSourceId, message: Message) -> Result<()> {
        // Clone the sender so the map guard is released before awaiting.
        let sender = self
            .senders
            .get(source_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("No buffer queue for source {source_id} - was it registered?"))?;

        sender
            .send(message)
            .await
            .map_err(|_| anyhow!("Buffer queue for source {source_id} closed"))
    }

    /// The next message under round-robin fairness, or `None` if no source
    /// currently has a ready message. Never blocks.
    pub fn poll(&self) -> Option<Message> {
        let mut inner = self.inner.lock().expect("fair buffer lock poisoned");
        let len = inner.queues.len();
        if len == 0 {
            return None;
        }

        for attempt in 0..len {
            let idx = (inner.cursor + attempt) % len;
            if let Ok(message) = inner.queues[idx].1.try_recv() {
                inner.cursor = (idx + 1) % len;
                return Some(message);
            }
        }
        None
    }

    pub fn source_count(&self) -> usize {
        self.senders.len()
    }

    pub fn has_source(&self, source_id: &VirtualSourceId) -> bool {
        self.senders.contains_key(source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageId, Partition};
    use bytes::Bytes;
    use std::time::Duration;

    fn source(name: &str) -> VirtualSourceId {
        VirtualSourceId::new(name)
    }

    fn message(source_id: &VirtualSourceId, offset: i64) -> Message {
        Message::new(
            MessageId::new(
                source_id.clone(),
                Partition::new("test-topic".to_string(), 0),
                offset,
            ),
            Bytes::from_static(b"payload"),
        )
    }

    #[tokio::test]
    async fn test_poll_empty_buffer_returns_none() {
        let buffer = FairBuffer::new(10);
        assert!(buffer.poll().is_none());

        buffer.add_source(source("a"));
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn test_put_requires_registered_source() {
        let buffer = FairBuffer::new(10);
        let id = source("a");

        let result = buffer.put(&id, message(&id, 0)).await;
        assert!(result.is_err());

        buffer.add_source(id.clone());
        buffer.put(&id, message(&id, 0)).await.unwrap();
        assert!(buffer.poll().is_some());
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let buffer = FairBuffer::new(10);
        let a = source("a");
        let b = source("b");
        buffer.add_source(a.clone());
        buffer.add_source(b.clone());

        for offset in 0..3 {
            buffer.put(&a, message(&a, offset)).await.unwrap();
        }
        buffer.put(&b, message(&b, 0)).await.unwrap();

        // B has pending data, so no two consecutive polls may serve A.
        let mut b_remaining = 1;
        let mut previous_source: Option<VirtualSourceId> = None;
        for _ in 0..4 {
            let msg = buffer.poll().expect("expected a buffered message");
            let current = msg.id().source_id().clone();
            if b_remaining > 0 {
                assert_ne!(previous_source.as_ref(), Some(&current));
            }
            if current == b {
                b_remaining -= 1;
            }
            previous_source = Some(current);
        }
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn test_empty_source_skipped_without_waiting() {
        let buffer = FairBuffer::new(10);
        let a = source("a");
        let b = source("b");
        buffer.add_source(a.clone());
        buffer.add_source(b.clone());

        buffer.put(&b, message(&b, 0)).await.unwrap();
        buffer.put(&b, message(&b, 1)).await.unwrap();

        // A has nothing buffered; both polls serve B immediately.
        assert_eq!(buffer.poll().unwrap().id().offset(), 0);
        assert_eq!(buffer.poll().unwrap().id().offset(), 1);
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn test_remove_source_discards_queued_messages() {
        let buffer = FairBuffer::new(10);
        let a = source("a");
        let b = source("b");
        buffer.add_source(a.clone());
        buffer.add_source(b.clone());

        buffer.put(&a, message(&a, 0)).await.unwrap();
        buffer.put(&b, message(&b, 0)).await.unwrap();

        buffer.remove_source(&a);
        assert_eq!(buffer.source_count(), 1);

        // Only B's message survives removal.
        let msg = buffer.poll().expect("expected B's message");
        assert_eq!(msg.id().source_id(), &b);
        assert!(buffer.poll().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_is_per_source() {
        let buffer = FairBuffer::new(1);
        let a = source("a");
        let b = source("b");
        buffer.add_source(a.clone());
        buffer.add_source(b.clone());

        buffer.put(&a, message(&a, 0)).await.unwrap();

        // A's queue is full; a second put on A suspends.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            buffer.put(&a, message(&a, 1)),
        )
        .await;
        assert!(blocked.is_err(), "put on a full queue should suspend");

        // B is unaffected by A's backpressure.
        tokio::time::timeout(Duration::from_millis(50), buffer.put(&b, message(&b, 0)))
            .await
            .expect("put on B should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn test_add_source_while_active() {
        let buffer = FairBuffer::new(10);
        let a = source("a");
        buffer.add_source(a.clone());
        buffer.put(&a, message(&a, 0)).await.unwrap();

        let b = source("b");
        buffer.add_source(b.clone());
        buffer.put(&b, message(&b, 0)).await.unwrap();

        let first = buffer.poll().unwrap();
        let second = buffer.poll().unwrap();
        assert_ne!(first.id().source_id(), second.id().source_id());
    }

    #[tokio::test]
    async fn test_add_source_is_idempotent() {
        let buffer = FairBuffer::new(10);
        let a = source("a");
        buffer.add_source(a.clone());
        buffer.add_source(a.clone());

        assert_eq!(buffer.source_count(), 1);
        buffer.put(&a, message(&a, 0)).await.unwrap();
        assert!(buffer.poll().is_some());
        assert!(buffer.poll().is_none());
    }
}
