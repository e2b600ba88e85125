//! The update-log session tying one piece of incrementally-logged state to
//! the checkpoint chain.
//!
//! An [`UpdateLog`] is owned by exactly one logged value (for example an
//! [`IncrVecDeque`](super::IncrVecDeque)) and is never shared across
//! operators. During a checkpoint it appends one index record; during a reset
//! it walks the `prev_id` chain back to the base and exposes the collected
//! deltas in replay order.

use super::{Checkpoint, CheckpointError, IncrementalIndex, IndexKind};
use crate::SequenceId;

#[derive(Debug, Clone, Default)]
pub struct UpdateLog {
    /// Whether mutations are currently being logged. Cleared by
    /// [`on_logging_error`](UpdateLog::on_logging_error) until the next base.
    enabled: bool,
    /// Kind of the last checkpoint this log participated in.
    last_kind: Option<IndexKind>,
    /// Index record of the current checkpoint/reset session.
    index: Option<IncrementalIndex>,
    /// Sequence id of the previous checkpoint of this state; 0 if none.
    prev_id: SequenceId,
    /// Offset of the previous index record in its index buffer.
    prev_index_offset: u64,
    /// Chain-walk state: previous delta checkpoints, newest first.
    prev_ids: Vec<SequenceId>,
    prev_indices: Vec<IncrementalIndex>,
    base_id: SequenceId,
    base_offset: u64,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The index record produced by the last `start_checkpoint`/`start_reset`.
    pub fn current_index(&self) -> Option<IncrementalIndex> {
        self.index
    }

    pub fn base_id(&self) -> SequenceId {
        self.base_id
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Begin this state's part of a checkpoint: snapshot the buffer offsets,
    /// decide base vs delta, and append the index record.
    ///
    /// The state must then serialize itself in the returned form into the
    /// checkpoint's delta buffer.
    pub fn start_checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<IndexKind, CheckpointError> {
        let offset = ckpt.delta_offset();
        let index_offset = ckpt.index_offset();
        // a disabled log cannot produce a usable delta, fall back to a base
        let kind = if ckpt.is_base() || !self.enabled || self.prev_id == 0 {
            IndexKind::Base
        } else if self.last_kind == Some(IndexKind::Base) {
            IndexKind::FirstDelta
        } else {
            IndexKind::Delta
        };
        let index = match kind {
            IndexKind::Base => IncrementalIndex::base(offset),
            _ => IncrementalIndex::delta(kind, offset, self.prev_id, self.prev_index_offset),
        };
        index.serialize(ckpt.index_mut());
        self.index = Some(index);
        self.prev_id = ckpt.sequence_id();
        self.prev_index_offset = index_offset;
        self.last_kind = Some(kind);
        Ok(kind)
    }

    /// Close this state's part of a checkpoint, arming or disarming logging
    /// for the next one.
    pub fn finish_checkpoint(&mut self, ckpt: &Checkpoint) {
        if self.last_kind == Some(IndexKind::Base) {
            // a fresh base clears any previous logging failure
            self.enabled = ckpt.should_enable_logging();
        } else {
            self.enabled = self.enabled && ckpt.should_enable_logging();
        }
    }

    /// An error occurred while appending to the log: stop logging and force
    /// the next checkpoint of this state to be a full base.
    pub fn on_logging_error(&mut self) {
        tracing::warn!("update logging failed, next checkpoint will be a base");
        self.enabled = false;
    }

    /// Begin this state's part of a reset: read the index record and, for a
    /// delta, walk the chain back to its base.
    ///
    /// The collected previous deltas are drained with
    /// [`next_previous_delta`](UpdateLog::next_previous_delta); the caller
    /// applies the base image first, then the drained deltas (oldest first,
    /// which is the pop order), then the current checkpoint's own delta.
    pub fn start_reset(&mut self, ckpt: &mut Checkpoint) -> Result<IndexKind, CheckpointError> {
        let seq_id = ckpt.sequence_id();
        let index = IncrementalIndex::deserialize(ckpt.own_index_buffer()?)?;
        self.prev_ids.clear();
        self.prev_indices.clear();
        self.index = Some(index);
        if index.is_base() {
            self.base_id = seq_id;
            self.base_offset = index.offset;
            return Ok(IndexKind::Base);
        }

        let budget = ckpt.incremental_interval();
        let mut cursor = index;
        let mut hops = 0u32;
        loop {
            hops += 1;
            if hops > budget {
                return Err(CheckpointError::BaseNotFound {
                    seq_id,
                    hops: budget,
                });
            }
            let prev_buf = ckpt.index_buffer(cursor.prev_id, cursor.prev_index_offset)?;
            let prev = IncrementalIndex::deserialize(prev_buf)?;
            if prev.is_base() {
                self.base_id = cursor.prev_id;
                self.base_offset = prev.offset;
                break;
            }
            self.prev_ids.push(cursor.prev_id);
            self.prev_indices.push(prev);
            cursor = prev;
        }
        // resume chained checkpointing from the restored position
        self.prev_id = seq_id;
        self.last_kind = Some(index.kind);
        Ok(index.kind)
    }

    pub fn has_previous_delta(&self) -> bool {
        !self.prev_ids.is_empty()
    }

    /// Pop the next previous delta to replay.
    ///
    /// The vector was filled walking backward from the most recent delta
    /// toward the base, so popping from the back yields the base-adjacent
    /// delta first: replay order is oldest to newest.
    pub fn next_previous_delta(&mut self) -> Option<(SequenceId, IncrementalIndex)> {
        let id = self.prev_ids.pop()?;
        let index = self.prev_indices.pop()?;
        Some((id, index))
    }
}
