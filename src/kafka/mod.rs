// Kafka-backed implementation of the engine's Consumer capability.
pub mod consumer;

pub use consumer::{KafkaConsumerFactory, KafkaSourceConsumer};
