//! Narrow capability interface to the underlying partitioned log.
//!
//! The engine only needs to seek to a recorded state, fetch raw records,
//! checkpoint a state, and read high-water-marks. Wire protocol, broker
//! discovery and partition rebalancing are entirely the implementation's
//! concern; transient fetch failures surface as "no record ready".

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::consumer_state::ConsumerState;
use crate::types::{Partition, VirtualSourceId};

/// One raw record pulled from the log, prior to filtering.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition: Partition,
    pub offset: i64,
    pub payload: Bytes,
}

impl Record {
    pub fn new(partition: Partition, offset: i64, payload: Bytes) -> Self {
        Self {
            partition,
            offset,
            payload,
        }
    }
}

#[async_trait]
pub trait Consumer: Send {
    /// Acquire resources and position the consumer. An empty starting state
    /// means "resume from whatever position the log has recorded".
    async fn open(&mut self, start: &ConsumerState) -> Result<()>;

    /// The next raw record, or `None` if nothing is ready yet.
    async fn next_record(&mut self) -> Result<Option<Record>>;

    /// Checkpoint a consumption state so it survives the consumer.
    async fn flush_state(&mut self, state: &ConsumerState) -> Result<()>;

    /// Most recent offset known to exist per owned partition, for lag.
    async fn high_water_marks(&mut self) -> Result<ConsumerState>;

    /// Release the underlying handle. Terminal.
    async fn close(&mut self) -> Result<()>;
}

/// Creates one [`Consumer`] per virtual source. Each handle is owned
/// exclusively by the source it was created for.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(&self, source_id: &VirtualSourceId) -> Result<Box<dyn Consumer>>;
}
