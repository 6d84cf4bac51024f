//! rdkafka adapter for the engine's [`Consumer`] capability.
//!
//! Each virtual source gets its own `StreamConsumer`. A source with no
//! recorded position subscribes through the consumer group; a source bound
//! to an explicit window is assigned its partitions and offsets directly so
//! replay never races group rebalancing.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer as RdKafkaConsumer, StreamConsumer};
use rdkafka::{ClientConfig, Message as RdKafkaMessage, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::consumer::{Consumer, ConsumerFactory, Record};
use crate::consumer_state::ConsumerState;
use crate::types::{Partition, VirtualSourceId};

pub struct KafkaSourceConsumer {
    consumer: StreamConsumer,
    topic: String,
    poll_timeout: Duration,
}

impl KafkaSourceConsumer {
    pub fn new(client_config: &ClientConfig, topic: String, poll_timeout: Duration) -> Result<Self> {
        let consumer: StreamConsumer = client_config
            .create()
            .context("creating Kafka stream consumer")?;
        Ok(Self {
            consumer,
            topic,
            poll_timeout,
        })
    }

    fn assignment_partitions(&self) -> Result<Vec<Partition>> {
        let assignment = self
            .consumer
            .assignment()
            .context("reading consumer assignment")?;
        Ok(assignment
            .elements()
            .into_iter()
            .map(|elem| Partition::new(elem.topic().to_string(), elem.partition()))
            .collect())
    }
}

#[async_trait]
impl Consumer for KafkaSourceConsumer {
    async fn open(&mut self, start: &ConsumerState) -> Result<()> {
        if start.is_empty() {
            // No recorded position: resume from whatever the group has
            // committed.
            self.consumer
                .subscribe(&[&self.topic])
                .with_context(|| format!("subscribing to {}", self.topic))?;
            info!(topic = %self.topic, "Subscribed Kafka consumer");
            return Ok(());
        }

        let mut assignment = TopicPartitionList::new();
        for (partition, offset) in start.iter() {
            assignment
                .add_partition_offset(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(offset),
                )
                .with_context(|| format!("assigning {partition} at offset {offset}"))?;
        }
        self.consumer
            .assign(&assignment)
            .context("assigning explicit partition window")?;
        info!(
            topic = %self.topic,
            partitions = start.len(),
            "Assigned Kafka consumer to explicit window"
        );
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        match timeout(self.poll_timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => {
                let partition = Partition::new(message.topic().to_string(), message.partition());
                let payload = message
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default();
                Ok(Some(Record::new(partition, message.offset(), payload)))
            }
            Ok(Err(e)) => {
                // Transient fetch failures are the broker client's problem;
                // the engine only sees "nothing ready".
                warn!(error = %e, "Kafka receive error");
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    async fn flush_state(&mut self, state: &ConsumerState) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }

        let mut offsets = TopicPartitionList::new();
        for (partition, offset) in state.iter() {
            offsets
                .add_partition_offset(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(offset),
                )
                .with_context(|| format!("staging commit for {partition}"))?;
        }

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .context("committing offsets")?;
        debug!(partitions = state.len(), "Committed consumer state");
        Ok(())
    }

    async fn high_water_marks(&mut self) -> Result<ConsumerState> {
        let mut builder = ConsumerState::builder();
        for partition in self.assignment_partitions()? {
            let (_, high) = self
                .consumer
                .fetch_watermarks(
                    partition.topic(),
                    partition.partition_number(),
                    Duration::from_secs(5),
                )
                .with_context(|| format!("fetching watermarks for {partition}"))?;
            builder = builder.with_partition(partition, high);
        }
        Ok(builder.build())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Creates one Kafka consumer per virtual source, each in its own consumer
/// group so sideline replays never contend with the firehose's group.
pub struct KafkaConsumerFactory {
    hosts: String,
    group_prefix: String,
    topic: String,
    offset_reset: String,
    poll_timeout: Duration,
}

impl KafkaConsumerFactory {
    pub fn new(
        hosts: String,
        group_prefix: String,
        topic: String,
        offset_reset: String,
    ) -> Self {
        Self {
            hosts,
            group_prefix,
            topic,
            offset_reset,
            poll_timeout: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.kafka_hosts.clone(),
            config.kafka_consumer_group.clone(),
            config.kafka_consumer_topic.clone(),
            config.kafka_consumer_offset_reset.clone(),
        )
    }

    fn client_config(&self, source_id: &VirtualSourceId) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.hosts)
            .set("group.id", format!("{}-{}", self.group_prefix, source_id))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.offset_reset);
        config
    }
}

#[async_trait]
impl ConsumerFactory for KafkaConsumerFactory {
    async fn create_consumer(&self, source_id: &VirtualSourceId) -> Result<Box<dyn Consumer>> {
        let client_config = self.client_config(source_id);
        let consumer =
            KafkaSourceConsumer::new(&client_config, self.topic.clone(), self.poll_timeout)?;
        Ok(Box::new(consumer))
    }
}
