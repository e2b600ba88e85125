//! Per-operator checkpoint lifecycle: creation, commit, restore, pruning.

use std::sync::Arc;

use super::{Checkpoint, CheckpointError, IntervalController, StateStore};
use crate::config::CheckpointConfig;
use crate::SequenceId;

/// Builds the [`Checkpoint`] sessions of one operator and feeds observed
/// sizes back into the operator's [`IntervalController`].
///
/// The factory is owned by its operator and only ever used from the thread
/// currently checkpointing or resetting that operator.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct CheckpointFactory {
    #[derivative(Debug = "ignore")]
    store: Arc<dyn StateStore>,
    controller: IntervalController,
    incremental_interval_bound: u32,
    /// Base of the current interval; 0 until the first checkpoint.
    base_id: SequenceId,
    /// Sequence ids committed since (and including) the current base, oldest
    /// first. Earlier checkpoints are pruned when a new base commits.
    live: Vec<SequenceId>,
}

impl CheckpointFactory {
    pub fn new(store: Arc<dyn StateStore>, config: &CheckpointConfig) -> Self {
        Self {
            store,
            controller: IntervalController::new(config),
            incremental_interval_bound: config.incremental_interval.max(1),
            base_id: 0,
            live: Vec::new(),
        }
    }

    pub fn controller(&self) -> &IntervalController {
        &self.controller
    }

    /// Whether update logging should be active for state mutated between the
    /// last checkpoint and the next one.
    pub fn should_enable_logging(&self) -> bool {
        self.controller.should_enable_logging()
    }

    /// Start taking a checkpoint with the given sequence id.
    pub fn create(&mut self, seq_id: SequenceId) -> Checkpoint {
        let is_base = self.controller.is_base_checkpoint();
        if is_base {
            self.base_id = seq_id;
        }
        Checkpoint::for_take(
            self.store.clone(),
            seq_id,
            self.base_id,
            self.chain_bound(),
            is_base,
            self.controller.should_enable_logging(),
        )
    }

    /// Commit a taken checkpoint, update the interval controller and prune
    /// checkpoints no longer reachable from the new base.
    pub fn commit(&mut self, mut ckpt: Checkpoint) -> Result<(), CheckpointError> {
        let stats = ckpt.finish()?;
        if ckpt.is_base() {
            // everything older than this base can no longer be replayed into
            for old in self.live.drain(..) {
                self.store.remove(old)?;
            }
            self.controller
                .base_completed(stats.data_bytes + stats.delta_bytes);
        } else {
            self.controller
                .delta_completed(stats.delta_bytes + stats.index_bytes);
        }
        self.live.push(ckpt.sequence_id());
        Ok(())
    }

    /// Open a committed checkpoint for restore.
    pub fn open(&self, seq_id: SequenceId) -> Result<Checkpoint, CheckpointError> {
        Checkpoint::for_restore(self.store.clone(), seq_id, self.chain_bound())
    }

    /// Force the next checkpoint to be a base, after a logging failure.
    pub fn force_base(&mut self) {
        self.controller.force_base();
    }

    /// Upper bound on delta-chain length used when walking back to a base.
    ///
    /// The controller may have grown the interval beyond the configured
    /// starting point, so the bound follows the current interval.
    fn chain_bound(&self) -> u32 {
        self.controller
            .interval()
            .max(self.incremental_interval_bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{BufferKind, MemoryStore};

    fn factory(interval: u32) -> (Arc<MemoryStore>, CheckpointFactory) {
        let store = Arc::new(MemoryStore::new());
        let config = CheckpointConfig {
            incremental_interval: interval,
            size_ratio: 1.0,
        };
        let fac = CheckpointFactory::new(store.clone() as Arc<dyn StateStore>, &config);
        (store, fac)
    }

    #[test]
    fn base_delta_alternation() {
        let (_store, mut fac) = factory(2);
        let c1 = fac.create(1);
        assert!(c1.is_base());
        assert!(c1.should_enable_logging());
        fac.commit(c1).unwrap();

        let c2 = fac.create(2);
        assert!(!c2.is_base());
        assert_eq!(c2.base_id(), 1);
        fac.commit(c2).unwrap();

        let c3 = fac.create(3);
        assert!(c3.is_base());
        assert_eq!(c3.base_id(), 3);
    }

    #[test]
    fn bases_prune_older_checkpoints() {
        let (store, mut fac) = factory(2);
        for seq in 1..=4 {
            let mut ckpt = fac.create(seq);
            ckpt.write_u64(seq as u64);
            fac.commit(ckpt).unwrap();
        }
        // seq 3 is the current base: 1 and 2 are gone, 3 and 4 remain
        assert_eq!(store.get(1, BufferKind::Data).unwrap(), None);
        assert_eq!(store.get(2, BufferKind::Data).unwrap(), None);
        assert!(store.get(3, BufferKind::Data).unwrap().is_some());
        assert!(store.get(4, BufferKind::Data).unwrap().is_some());
    }

    #[test]
    fn disabled_interval_keeps_only_latest() {
        let (store, mut fac) = factory(1);
        for seq in 1..=3 {
            let mut ckpt = fac.create(seq);
            assert!(ckpt.is_base());
            assert!(!ckpt.should_enable_logging());
            ckpt.write_u64(0);
            fac.commit(ckpt).unwrap();
        }
        assert_eq!(store.len(), 1);
    }
}
