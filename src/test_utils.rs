//! Shared test utilities for the kafka-sideliner crate.
//!
//! Provides an in-memory log and consumer so unit and integration tests can
//! exercise the engine without a broker, plus a manually-driven clock for
//! deterministic retry tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::consumer::{Consumer, ConsumerFactory, Record};
use crate::consumer_state::ConsumerState;
use crate::filter::FilterChainStep;
use crate::retry::Clock;
use crate::types::{Message, MessageId, Partition, VirtualSourceId};

/// A clock whose time only moves when a test advances it.
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock().expect("manual clock lock poisoned") += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().expect("manual clock lock poisoned")
    }
}

/// Shared in-memory log: per-partition append-only record lists, where a
/// record's offset is its index.
#[derive(Clone, Default)]
pub struct MessageLog {
    partitions: Arc<RwLock<HashMap<Partition, Vec<Bytes>>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its offset.
    pub fn append(&self, partition: &Partition, payload: Bytes) -> i64 {
        let mut partitions = self.partitions.write().expect("message log lock poisoned");
        let records = partitions.entry(partition.clone()).or_default();
        records.push(payload);
        (records.len() - 1) as i64
    }

    /// Next offset to be written per partition (the high-water-mark).
    pub fn high_water_marks(&self) -> ConsumerState {
        let partitions = self.partitions.read().expect("message log lock poisoned");
        let mut builder = ConsumerState::builder();
        for (partition, records) in partitions.iter() {
            builder = builder.with_partition(partition.clone(), records.len() as i64);
        }
        builder.build()
    }

    fn read(&self, partition: &Partition, offset: i64) -> Option<Bytes> {
        let partitions = self.partitions.read().expect("message log lock poisoned");
        partitions
            .get(partition)?
            .get(usize::try_from(offset).ok()?)
            .cloned()
    }

    fn partition_list(&self) -> Vec<Partition> {
        let partitions = self.partitions.read().expect("message log lock poisoned");
        let mut list: Vec<Partition> = partitions.keys().cloned().collect();
        list.sort_by(|a, b| {
            a.topic()
                .cmp(b.topic())
                .then(a.partition_number().cmp(&b.partition_number()))
        });
        list
    }
}

/// In-memory [`Consumer`] over a shared [`MessageLog`].
pub struct InMemoryConsumer {
    log: MessageLog,
    start: ConsumerState,
    /// Next offset to read per partition.
    positions: HashMap<Partition, i64>,
    committed: Arc<RwLock<ConsumerState>>,
    closed: bool,
}

impl InMemoryConsumer {
    pub fn new(log: MessageLog, committed: Arc<RwLock<ConsumerState>>) -> Self {
        Self {
            log,
            start: ConsumerState::default(),
            positions: HashMap::new(),
            committed,
            closed: false,
        }
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn open(&mut self, start: &ConsumerState) -> Result<()> {
        self.start = start.clone();
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.closed {
            return Ok(None);
        }

        for partition in self.log.partition_list() {
            let position = self
                .positions
                .get(&partition)
                .copied()
                .or_else(|| self.start.offset_for(&partition))
                .unwrap_or(0);

            if let Some(payload) = self.log.read(&partition, position) {
                self.positions.insert(partition.clone(), position + 1);
                return Ok(Some(Record::new(partition, position, payload)));
            }
        }
        Ok(None)
    }

    async fn flush_state(&mut self, state: &ConsumerState) -> Result<()> {
        *self.committed.write().expect("committed state lock poisoned") = state.clone();
        Ok(())
    }

    async fn high_water_marks(&mut self) -> Result<ConsumerState> {
        Ok(self.log.high_water_marks())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Factory handing each virtual source its own consumer over one shared log.
/// Keeps each consumer's committed state reachable for assertions.
#[derive(Clone, Default)]
pub struct InMemoryConsumerFactory {
    log: MessageLog,
    committed: Arc<DashMap<VirtualSourceId, Arc<RwLock<ConsumerState>>>>,
}

impl InMemoryConsumerFactory {
    pub fn new(log: MessageLog) -> Self {
        Self {
            log,
            committed: Arc::new(DashMap::new()),
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// The last state flushed by the consumer created for `source_id`.
    pub fn committed_state(&self, source_id: &VirtualSourceId) -> Option<ConsumerState> {
        self.committed.get(source_id).map(|entry| {
            entry
                .value()
                .read()
                .expect("committed state lock poisoned")
                .clone()
        })
    }
}

#[async_trait]
impl ConsumerFactory for InMemoryConsumerFactory {
    async fn create_consumer(&self, source_id: &VirtualSourceId) -> Result<Box<dyn Consumer>> {
        let committed = self
            .committed
            .entry(source_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ConsumerState::default())))
            .clone();
        Ok(Box::new(InMemoryConsumer::new(self.log.clone(), committed)))
    }
}

/// Filter step matching messages whose payload is the decimal rendering of a
/// specific number.
#[derive(Debug, Clone)]
pub struct NumberFilter {
    number: i64,
}

impl NumberFilter {
    pub fn new(number: i64) -> Self {
        Self { number }
    }
}

impl FilterChainStep for NumberFilter {
    fn filter(&self, message: &Message) -> bool {
        payload_number(message) == Some(self.number)
    }
}

/// Parse a message payload as a decimal number, as produced by
/// [`number_payload`].
pub fn payload_number(message: &Message) -> Option<i64> {
    std::str::from_utf8(message.payload()).ok()?.parse().ok()
}

pub fn number_payload(number: i64) -> Bytes {
    Bytes::from(number.to_string())
}

/// A standalone message carrying a numeric payload, for filter tests.
pub fn number_message(number: i64) -> Message {
    Message::new(
        MessageId::new(
            VirtualSourceId::new("test-source"),
            Partition::new("test-topic".to_string(), 1),
            0,
        ),
        number_payload(number),
    )
}
