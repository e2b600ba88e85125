//! Whole-partition eviction under memory pressure.
//!
//! Separate from the window-content policies: these decide when entire
//! partitions (not just their contents) are dropped. The policy object keeps
//! aggregate counters consistent by subscribing to the tuple and partition
//! events the window managers emit; at every quiescent point the aggregate
//! equals the sum of the per-partition quantities it tracks.

use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, CheckpointError};

/// When whole partitions are evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionEvictionPolicy {
    /// Evict oldest partitions when the total tuple count across all
    /// partitions exceeds `max`.
    TupleCount { max: u64 },
    /// Evict oldest partitions when there are more than `max` partitions.
    PartitionCount { max: u64 },
    /// Evict partitions unused for longer than `max_secs`.
    PartitionAge { max_secs: u64 },
}

/// Chooses which partitions to evict when several are eligible; receives the
/// partitions ordered by last use (least recent first) and returns the
/// victims. When the selection does not clear the pressure the window falls
/// back to strict LRU.
pub type EvictionSelector<G> = Box<dyn FnMut(&[(G, u64)]) -> Vec<G> + Send>;

/// Tracks the aggregate state a [`PartitionEvictionPolicy`] needs.
#[derive(Debug, Clone)]
pub struct PartitionEviction {
    policy: PartitionEvictionPolicy,
    current_tuple_count: u64,
}

impl PartitionEviction {
    pub fn new(policy: PartitionEvictionPolicy) -> Self {
        Self {
            policy,
            current_tuple_count: 0,
        }
    }

    pub fn policy(&self) -> PartitionEvictionPolicy {
        self.policy
    }

    pub fn current_tuple_count(&self) -> u64 {
        self.current_tuple_count
    }

    pub fn set_current_tuple_count(&mut self, count: u64) {
        self.current_tuple_count = count;
    }

    /// Age-based policies must check for eviction before an insertion, since
    /// inserting refreshes the partition's age.
    pub fn evict_before_insertion(&self) -> bool {
        matches!(self.policy, PartitionEvictionPolicy::PartitionAge { .. })
    }

    pub fn tuple_inserted(&mut self) {
        self.current_tuple_count += 1;
    }

    pub fn tuple_removed(&mut self) {
        self.current_tuple_count = self.current_tuple_count.saturating_sub(1);
    }

    /// A partition's contents were flushed; `tuples` of them went away.
    pub fn partition_flushed(&mut self, tuples: u64) {
        self.current_tuple_count = self.current_tuple_count.saturating_sub(tuples);
    }

    /// A partition was removed outright with `tuples` still accumulated.
    pub fn partition_removed(&mut self, tuples: u64) {
        self.current_tuple_count = self.current_tuple_count.saturating_sub(tuples);
    }

    /// Whether eviction must happen given the current aggregates. Consulted
    /// after every mutating operation (before insertion for age policies).
    pub fn eviction_needed(
        &self,
        partitions: usize,
        oldest_last_use: Option<u64>,
        now: u64,
    ) -> bool {
        match self.policy {
            PartitionEvictionPolicy::TupleCount { max } => self.current_tuple_count > max,
            PartitionEvictionPolicy::PartitionCount { max } => partitions as u64 > max,
            PartitionEvictionPolicy::PartitionAge { max_secs } => oldest_last_use
                .map(|at| at + max_secs < now)
                .unwrap_or(false),
        }
    }

    pub(crate) fn checkpoint(&self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_value(&self.policy)?;
        ckpt.write_vu64(self.current_tuple_count);
        Ok(())
    }

    pub(crate) fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        self.policy = ckpt.read_value()?;
        self.current_tuple_count = ckpt.read_vu64()?;
        Ok(())
    }

    pub(crate) fn reset_to_initial_state(&mut self) {
        self.current_tuple_count = 0;
    }
}
