//! Completion bookkeeping of one consistent region within one PE.
//!
//! All counters are tallied under the owning service's lock, atomically with
//! the stale-sequence gate: a completion arriving for an older sequence id is
//! absorbed without touching any counter, and per-phase de-duplication by
//! operator index means a repeated completion never double counts.

use fxhash::FxHashSet;

use crate::{OperatorIndex, SequenceId};

/// Phase transitions produced by a checkpoint completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CheckpointProgress {
    /// All blocking operators just finished: tuple submission may resume.
    pub blocking_just_completed: bool,
    /// Every operator (blocking and non-blocking) finished: the sequence is
    /// durable.
    pub all_just_completed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RegionInfo {
    operators: FxHashSet<OperatorIndex>,
    non_blocking: FxHashSet<OperatorIndex>,

    drain_seq: SequenceId,
    drained: FxHashSet<OperatorIndex>,

    checkpoint_seq: SequenceId,
    blocking_done: FxHashSet<OperatorIndex>,
    non_blocking_done: FxHashSet<OperatorIndex>,
    /// Latest sequence id whose checkpoint fully completed.
    last_completed_checkpoint: SequenceId,

    reset_seq: SequenceId,
    reset_attempt: i32,
    reset_done: FxHashSet<OperatorIndex>,
    reset_in_progress: bool,
    /// Latest fully completed reset, as `(sequence id, attempt)`.
    last_completed_reset: Option<(SequenceId, i32)>,
}

impl RegionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operator: OperatorIndex) {
        self.operators.insert(operator);
    }

    pub fn is_registered(&self, operator: OperatorIndex) -> bool {
        self.operators.contains(&operator)
    }

    pub fn enable_non_blocking(&mut self, operator: OperatorIndex) {
        self.non_blocking.insert(operator);
    }

    pub fn num_operators(&self) -> usize {
        self.operators.len()
    }

    pub fn total_drain_completed(&self) -> usize {
        self.drained.len()
    }

    /// Record a drain completion. Returns true exactly once per sequence id,
    /// when the last registered operator drained.
    pub fn drain_completed(&mut self, seq_id: SequenceId, operator: OperatorIndex) -> bool {
        if seq_id < self.drain_seq {
            tracing::trace!(seq_id, current = self.drain_seq, "stale drain completion");
            return false;
        }
        if seq_id > self.drain_seq {
            self.drain_seq = seq_id;
            self.drained.clear();
        }
        self.drained.insert(operator) && self.drained.len() == self.operators.len()
    }

    /// Record a checkpoint completion and report the phase transitions it
    /// caused.
    pub fn checkpoint_completed(
        &mut self,
        seq_id: SequenceId,
        operator: OperatorIndex,
    ) -> CheckpointProgress {
        if seq_id < self.checkpoint_seq || seq_id <= self.last_completed_checkpoint {
            tracing::trace!(
                seq_id,
                current = self.checkpoint_seq,
                "stale checkpoint completion"
            );
            return CheckpointProgress::default();
        }
        if seq_id > self.checkpoint_seq {
            self.checkpoint_seq = seq_id;
            self.blocking_done.clear();
            self.non_blocking_done.clear();
        }
        let blocking_total = self.operators.len() - self.non_blocking.len();
        let blocking_was_complete = self.blocking_done.len() == blocking_total;
        let newly = if self.non_blocking.contains(&operator) {
            self.non_blocking_done.insert(operator)
        } else {
            self.blocking_done.insert(operator)
        };
        if !newly {
            return CheckpointProgress::default();
        }
        let blocking_complete = self.blocking_done.len() == blocking_total;
        let all_complete =
            self.blocking_done.len() + self.non_blocking_done.len() == self.operators.len();
        if all_complete {
            self.last_completed_checkpoint = seq_id;
        }
        CheckpointProgress {
            blocking_just_completed: blocking_complete && !blocking_was_complete,
            all_just_completed: all_complete,
        }
    }

    /// Whether a queued checkpoint work item for `seq_id` is still current.
    pub fn should_proceed_with_checkpoint(&self, seq_id: SequenceId) -> bool {
        !self.reset_in_progress
            && seq_id >= self.checkpoint_seq
            && seq_id > self.last_completed_checkpoint
    }

    /// Start (or supersede) a reset cycle. A retried attempt keeps the
    /// sequence id but bumps the attempt counter, clearing the tallies.
    pub fn begin_reset(&mut self, seq_id: SequenceId, attempt: i32) {
        if seq_id > self.reset_seq || (seq_id == self.reset_seq && attempt > self.reset_attempt) {
            self.reset_seq = seq_id;
            self.reset_attempt = attempt;
            self.reset_done.clear();
        }
        self.reset_in_progress = true;
    }

    /// Record a reset completion. Returns true exactly once per
    /// `(sequence id, attempt)`, when the last operator finished.
    pub fn reset_completed(
        &mut self,
        seq_id: SequenceId,
        attempt: i32,
        operator: OperatorIndex,
    ) -> bool {
        if seq_id != self.reset_seq || attempt != self.reset_attempt {
            tracing::trace!(seq_id, attempt, "stale reset completion");
            return false;
        }
        let all = self.reset_done.insert(operator) && self.reset_done.len() == self.operators.len();
        if all {
            self.last_completed_reset = Some((seq_id, attempt));
            self.reset_in_progress = false;
        }
        all
    }

    /// Whether a queued reset work item for `(seq_id, attempt)` is still
    /// current.
    pub fn should_proceed_with_reset(&self, seq_id: SequenceId, attempt: i32) -> bool {
        seq_id == self.reset_seq
            && attempt == self.reset_attempt
            && self.last_completed_reset != Some((seq_id, attempt))
    }

    pub fn last_completed_checkpoint(&self) -> SequenceId {
        self.last_completed_checkpoint
    }

    pub fn last_completed_reset(&self) -> Option<(SequenceId, i32)> {
        self.last_completed_reset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(ops: &[OperatorIndex]) -> RegionInfo {
        let mut info = RegionInfo::new();
        for &op in ops {
            info.register(op);
        }
        info
    }

    #[test]
    fn drain_completes_once() {
        let mut info = region(&[0, 1, 2]);
        assert!(!info.drain_completed(100, 0));
        assert!(!info.drain_completed(100, 1));
        // duplicate completion does not finish the phase early
        assert!(!info.drain_completed(100, 1));
        assert!(info.drain_completed(100, 2));
        assert_eq!(info.total_drain_completed(), 3);
        // and never signals twice
        assert!(!info.drain_completed(100, 2));
    }

    #[test]
    fn newer_drain_supersedes_older() {
        let mut info = region(&[0, 1]);
        assert!(!info.drain_completed(100, 0));
        assert!(!info.drain_completed(101, 1));
        // the stale completion for 100 is absorbed
        assert!(!info.drain_completed(100, 0));
        assert!(info.drain_completed(101, 0));
    }

    #[test]
    fn checkpoint_blocking_and_full_completion() {
        let mut info = region(&[0, 1, 2]);
        info.enable_non_blocking(2);

        let p = info.checkpoint_completed(7, 0);
        assert_eq!(p, CheckpointProgress::default());
        let p = info.checkpoint_completed(7, 1);
        assert!(p.blocking_just_completed);
        assert!(!p.all_just_completed);
        let p = info.checkpoint_completed(7, 2);
        assert!(!p.blocking_just_completed);
        assert!(p.all_just_completed);
        assert_eq!(info.last_completed_checkpoint(), 7);
    }

    #[test]
    fn duplicate_checkpoint_completion_does_not_double_count() {
        let mut info = region(&[0, 1]);
        assert_eq!(info.checkpoint_completed(7, 0), CheckpointProgress::default());
        // the repeat is absorbed with no transition
        assert_eq!(info.checkpoint_completed(7, 0), CheckpointProgress::default());
        let p = info.checkpoint_completed(7, 1);
        assert!(p.all_just_completed);
    }

    #[test]
    fn completed_sequence_rejects_further_completions() {
        let mut info = region(&[0]);
        assert!(info.checkpoint_completed(7, 0).all_just_completed);
        assert!(!info.should_proceed_with_checkpoint(7));
        assert_eq!(info.checkpoint_completed(7, 0), CheckpointProgress::default());
        assert!(info.should_proceed_with_checkpoint(8));
    }

    #[test]
    fn reset_keyed_by_sequence_and_attempt() {
        let mut info = region(&[0, 1]);
        info.begin_reset(5, 0);
        assert!(info.should_proceed_with_reset(5, 0));
        assert!(!info.reset_completed(5, 0, 0));

        // the attempt failed and was retried with the same sequence id
        info.begin_reset(5, 1);
        assert!(!info.should_proceed_with_reset(5, 0));
        assert!(info.should_proceed_with_reset(5, 1));
        // the stale completion is absorbed
        assert!(!info.reset_completed(5, 0, 1));
        assert!(!info.reset_completed(5, 1, 0));
        assert!(info.reset_completed(5, 1, 1));
        assert_eq!(info.last_completed_reset(), Some((5, 1)));
        assert!(!info.should_proceed_with_reset(5, 1));
    }

    #[test]
    fn pending_reset_blocks_checkpoints() {
        let mut info = region(&[0]);
        assert!(info.should_proceed_with_checkpoint(3));
        info.begin_reset(2, 0);
        assert!(!info.should_proceed_with_checkpoint(3));
        info.reset_completed(2, 0, 0);
        assert!(info.should_proceed_with_checkpoint(3));
    }
}
