//! Storage shared by all window kinds: partition payloads, per-partition
//! tuple counters and the last-use ordering used for partition eviction.
//!
//! The tuple counters live apart from the payloads on purpose: a summarizing
//! window keeps counters without retaining any tuple, so both window flavors
//! share this one abstraction.

use fxhash::{FxBuildHasher, FxHashMap};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{WindowError, WindowKey};
use crate::checkpoint::{Checkpoint, CheckpointError};

#[derive(Clone, Debug)]
pub struct PartitionStorage<G: WindowKey, D> {
    data: FxHashMap<G, D>,
    tuple_counts: FxHashMap<G, u64>,
    /// Partition -> last-use time in seconds; iteration order is strict
    /// least-recently-used first.
    ordered: IndexMap<G, u64, FxBuildHasher>,
}

impl<G: WindowKey, D> Default for PartitionStorage<G, D> {
    fn default() -> Self {
        Self {
            data: FxHashMap::default(),
            tuple_counts: FxHashMap::default(),
            ordered: IndexMap::default(),
        }
    }
}

impl<G: WindowKey, D> PartitionStorage<G, D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, partition: &G) -> bool {
        self.data.contains_key(partition)
    }

    /// The partition's payload, creating it (with a zero tuple counter) on
    /// first use.
    pub fn insert_partition(&mut self, partition: &G, init: impl FnOnce() -> D) -> &mut D {
        if !self.data.contains_key(partition) {
            self.data.insert(partition.clone(), init());
            self.tuple_counts.insert(partition.clone(), 0);
        }
        self.data.get_mut(partition).unwrap()
    }

    pub fn partition_at(&self, partition: &G) -> Result<&D, WindowError> {
        self.data.get(partition).ok_or(WindowError::PartitionNotFound)
    }

    pub fn partition_at_mut(&mut self, partition: &G) -> Result<&mut D, WindowError> {
        self.data
            .get_mut(partition)
            .ok_or(WindowError::PartitionNotFound)
    }

    /// Drop a partition, its counter and its last-use entry.
    pub fn remove_partition(&mut self, partition: &G) -> Option<D> {
        let data = self.data.remove(partition)?;
        self.tuple_counts.remove(partition);
        self.ordered.shift_remove(partition);
        Some(data)
    }

    pub fn has_tuple_count(&self, partition: &G) -> bool {
        self.tuple_counts.contains_key(partition)
    }

    pub fn tuple_count(&self, partition: &G) -> Result<u64, WindowError> {
        self.tuple_counts
            .get(partition)
            .copied()
            .ok_or(WindowError::PartitionNotFound)
    }

    pub fn set_tuple_count(&mut self, partition: &G, count: u64) {
        self.tuple_counts.insert(partition.clone(), count);
    }

    pub fn increment_tuple_count(&mut self, partition: &G) -> u64 {
        let count = self.tuple_counts.entry(partition.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn erase_tuple_count(&mut self, partition: &G) {
        self.tuple_counts.remove(partition);
    }

    /// Sum of all per-partition tuple counters.
    pub fn total_tuple_count(&self) -> u64 {
        self.tuple_counts.values().sum()
    }

    /// Mark the partition as just used, moving it to the recent end of the
    /// last-use order.
    pub fn touch(&mut self, partition: &G, now: u64) {
        self.ordered.shift_remove(partition);
        self.ordered.insert(partition.clone(), now);
    }

    /// Partitions ordered by last use, least recent first.
    pub fn ordered_by_last_use(&self) -> impl Iterator<Item = (&G, u64)> {
        self.ordered.iter().map(|(k, &at)| (k, at))
    }

    /// The least recently used partition.
    pub fn oldest(&self) -> Option<(&G, u64)> {
        self.ordered.first().map(|(k, &at)| (k, at))
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&G, &D)> {
        self.data.iter()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.data.clear();
        self.tuple_counts.clear();
        self.ordered.clear();
    }
}

impl<G: WindowKey, D: Serialize + DeserializeOwned> PartitionStorage<G, D> {
    // Save format: marker, then (key, payload, tuple count) per partition,
    // then the last-use list in order.
    pub(crate) fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_marker("partitions");
        ckpt.write_vu64(self.data.len() as u64);
        for (key, payload) in &self.data {
            ckpt.write_value(key)?;
            ckpt.write_value(payload)?;
            ckpt.write_vu64(self.tuple_counts.get(key).copied().unwrap_or(0));
        }
        ckpt.write_vu64(self.ordered.len() as u64);
        for (key, &at) in &self.ordered {
            ckpt.write_value(key)?;
            ckpt.write_vu64(at);
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.verify_marker("partitions")?;
        self.clear();
        let partitions = ckpt.read_vu64()?;
        for _ in 0..partitions {
            let key: G = ckpt.read_value()?;
            let payload: D = ckpt.read_value()?;
            let count = ckpt.read_vu64()?;
            self.data.insert(key.clone(), payload);
            self.tuple_counts.insert(key, count);
        }
        let ordered = ckpt.read_vu64()?;
        for _ in 0..ordered {
            let key: G = ckpt.read_value()?;
            let at = ckpt.read_vu64()?;
            self.ordered.insert(key, at);
        }
        Ok(())
    }
}
