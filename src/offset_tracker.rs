//! Tracks which offsets are safe to commit per partition.
//!
//! Committing the highest acked offset alone is not safe: a message can be
//! acked while a lower offset of the same partition is still awaiting retry,
//! and committing past it would lose that message on restart. The tracker
//! keeps the emitted-but-unresolved offsets per partition and only ever
//! exposes offsets below the lowest unresolved one.
//!
//! Each virtual source owns one tracker and drives it from its own task, so
//! no locking is needed.

use std::collections::{BTreeSet, HashMap};

use crate::consumer_state::ConsumerState;
use crate::types::Partition;

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Emitted offsets not yet resolved by an ack.
    outstanding: BTreeSet<i64>,
    /// Highest resolved offset seen so far.
    highest_resolved: Option<i64>,
}

impl PartitionOffsets {
    /// The next offset safe to commit: everything below the lowest
    /// unresolved offset, or past the highest resolved one when nothing is
    /// unresolved. `None` until anything resolves or goes outstanding.
    fn committable(&self) -> Option<i64> {
        match self.outstanding.iter().next() {
            Some(lowest) => Some(*lowest),
            None => self.highest_resolved.map(|offset| offset + 1),
        }
    }
}

/// Per-partition bookkeeping of emitted and resolved offsets for one virtual
/// source. Filtered records never pass through here, so committable offsets
/// skip over them naturally.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<Partition, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a message at this offset was emitted downstream.
    /// Idempotent, so retry re-emissions are harmless.
    pub fn record_emitted(&mut self, partition: &Partition, offset: i64) {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .outstanding
            .insert(offset);
    }

    /// Record that an emitted offset was permanently resolved. Offsets that
    /// were never emitted are ignored.
    pub fn record_resolved(&mut self, partition: &Partition, offset: i64) {
        let Some(offsets) = self.partitions.get_mut(partition) else {
            return;
        };
        if !offsets.outstanding.remove(&offset) {
            return;
        }
        offsets.highest_resolved = Some(offsets.highest_resolved.map_or(offset, |h| h.max(offset)));
    }

    /// Snapshot of the offsets currently safe to commit. Empty while nothing
    /// has been emitted.
    pub fn committable_state(&self) -> ConsumerState {
        let mut builder = ConsumerState::builder();
        for (partition, offsets) in &self.partitions {
            if let Some(offset) = offsets.committable() {
                builder = builder.with_partition(partition.clone(), offset);
            }
        }
        builder.build()
    }
}
