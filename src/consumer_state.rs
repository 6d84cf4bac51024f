//! Immutable snapshot of per-partition consumption positions.
//!
//! Offsets are "next offset to consume". A partition absent from the snapshot
//! means no position has been recorded for it, which is distinct from
//! offset 0. Snapshots are only ever constructed through the builder and are
//! never mutated afterwards.

use std::collections::HashMap;

use crate::types::Partition;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerState {
    state: HashMap<Partition, i64>,
}

impl ConsumerState {
    pub fn builder() -> ConsumerStateBuilder {
        ConsumerStateBuilder::default()
    }

    /// The recorded offset for a partition, or `None` if no position exists.
    pub fn offset_for(&self, partition: &Partition) -> Option<i64> {
        self.state.get(partition).copied()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.state.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Partition, i64)> {
        self.state.iter().map(|(p, o)| (p, *o))
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }
}

/// Mutable accumulator for a [`ConsumerState`]. Callers only hold this during
/// construction; `build` moves the accumulated positions into the snapshot.
#[derive(Debug, Default)]
pub struct ConsumerStateBuilder {
    state: HashMap<Partition, i64>,
}

impl ConsumerStateBuilder {
    /// Record a position for a partition. Last write wins.
    pub fn with_partition(mut self, partition: Partition, offset: i64) -> Self {
        self.state.insert(partition, offset);
        self
    }

    pub fn build(self) -> ConsumerState {
        ConsumerState { state: self.state }
    }
}
