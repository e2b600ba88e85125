//! A double-ended queue with incremental checkpointing.
//!
//! Pushes at the back need no log records: a delta checkpoint serializes the
//! elements appended since the previous checkpoint. Removals
//! (`pop_front`, `erase`, `clear`) are logged as counts and positions
//! relative to the queue at the previous checkpoint, so a delta record is a
//! compact description of "drop these, then append those".

use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Checkpoint, CheckpointError, IndexKind, UpdateLog};

#[derive(Debug, Clone, Default)]
pub struct IncrVecDeque<T> {
    queue: VecDeque<T>,
    log: UpdateLog,
    /// `pop_front`s since the last checkpoint.
    pop_count: u64,
    /// Queue length at the last checkpoint.
    queue_size: u64,
    min_erase_pos: u64,
    max_erase_pos: u64,
    /// Offsets (into the queue as of the last checkpoint) of erased elements.
    erase_positions: VecDeque<u64>,
}

impl<T> IncrVecDeque<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            log: UpdateLog::new(),
            pop_count: 0,
            queue_size: 0,
            min_erase_pos: 0,
            max_erase_pos: 0,
            erase_positions: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, value: T) {
        self.queue.push_back(value);
        // appends are recovered from the queue tail, no log record needed
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let value = self.queue.pop_front();
        if value.is_some() && self.log.is_enabled() {
            self.pop_count += 1;
        }
        value
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        if self.log.is_enabled() {
            self.min_erase_pos = 0;
            self.max_erase_pos = 0;
            self.erase_positions.clear();
            self.pop_count = self.queue_size;
        }
    }

    /// Remove and return the element at `pos`.
    pub fn erase(&mut self, pos: usize) -> Option<T> {
        let value = self.queue.remove(pos);
        if value.is_some() && self.log.is_enabled() {
            self.log_erase(pos as u64);
        }
        value
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn front(&self) -> Option<&T> {
        self.queue.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.queue.back()
    }

    pub fn get(&self, pos: usize) -> Option<&T> {
        self.queue.get(pos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.queue.iter()
    }

    /// Record an erase at position `pos` (in current-queue coordinates) as an
    /// offset into the queue as of the last checkpoint. Only elements that
    /// were part of that queue need a record: later appends are re-serialized
    /// wholesale by the next delta.
    fn log_erase(&mut self, pos: u64) {
        let mut offset = self.pop_count + pos;
        if offset >= self.queue_size {
            return;
        }
        if self.max_erase_pos <= pos {
            // erases are moving forward: earlier records already shifted the
            // base queue left once each
            offset -= self.erase_positions.len() as u64;
            self.max_erase_pos = pos;
            self.erase_positions.push_back(offset);
        } else if self.min_erase_pos >= pos {
            self.min_erase_pos = pos;
            self.erase_positions.push_back(offset);
        } else {
            for &recorded in &self.erase_positions {
                if recorded <= pos {
                    offset -= 1;
                }
            }
            self.erase_positions.push_back(offset);
        }
    }

    fn clear_log(&mut self) {
        self.pop_count = 0;
        self.erase_positions.clear();
        self.min_erase_pos = 0;
        self.max_erase_pos = 0;
    }
}

impl<T: Serialize + DeserializeOwned> IncrVecDeque<T> {
    /// Save this queue into `ckpt`, as a full image at a base checkpoint or
    /// as a delta record otherwise.
    pub fn checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.set_incremental_mode();
        let result = self.do_checkpoint(ckpt);
        ckpt.unset_incremental_mode();
        if result.is_err() {
            self.log.on_logging_error();
            self.clear_log();
        }
        result
    }

    fn do_checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        let kind = self.log.start_checkpoint(ckpt)?;
        match kind {
            IndexKind::Base => {
                ckpt.write_value(&self.queue)?;
            }
            IndexKind::FirstDelta | IndexKind::Delta => self.serialize_delta(ckpt)?,
        }
        self.queue_size = self.queue.len() as u64;
        self.clear_log();
        self.log.finish_checkpoint(ckpt);
        Ok(())
    }

    fn serialize_delta(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.write_u64(self.queue_size);
        ckpt.write_u64(self.pop_count);
        ckpt.write_u64(self.erase_positions.len() as u64);
        for &offset in &self.erase_positions {
            ckpt.write_u64(offset);
        }
        // elements surviving from the base queue sit at the front; everything
        // after them was pushed since the last checkpoint
        let removed = self.pop_count + self.erase_positions.len() as u64;
        let survivors = self.queue_size.saturating_sub(removed) as usize;
        let pushed = self.queue.len().saturating_sub(survivors);
        ckpt.write_u64(pushed as u64);
        for value in self.queue.iter().skip(survivors) {
            ckpt.write_value(value)?;
        }
        Ok(())
    }

    /// Restore this queue from `ckpt`, replaying the delta chain if needed.
    pub fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        ckpt.set_incremental_mode();
        let result = self.do_reset(ckpt);
        ckpt.unset_incremental_mode();
        result
    }

    fn do_reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError> {
        let seq_id = ckpt.sequence_id();
        let kind = self.log.start_reset(ckpt)?;
        self.clear_log();
        let own_offset = self
            .log
            .current_index()
            .map(|index| index.offset)
            .unwrap_or(0);
        if kind == IndexKind::Base {
            let buf = ckpt.delta_buffer(seq_id, own_offset)?;
            self.queue = buf.read_value()?;
        } else {
            let base_id = self.log.base_id();
            let base_offset = self.log.base_offset();
            let buf = ckpt.delta_buffer(base_id, base_offset)?;
            self.queue = buf.read_value()?;
            self.queue_size = self.queue.len() as u64;
            while let Some((id, index)) = self.log.next_previous_delta() {
                self.apply_delta(ckpt, id, index.offset)?;
            }
            self.apply_delta(ckpt, seq_id, own_offset)?;
        }
        self.queue_size = self.queue.len() as u64;
        Ok(())
    }

    fn apply_delta(
        &mut self,
        ckpt: &mut Checkpoint,
        seq_id: crate::SequenceId,
        offset: u64,
    ) -> Result<(), CheckpointError> {
        let buf = ckpt.delta_buffer(seq_id, offset)?;
        let _base_size = buf.read_u64()?;
        let pop_count = buf.read_u64()?;
        let erase_count = buf.read_u64()?;
        for i in 0..erase_count {
            let recorded = buf.read_u64()?;
            // recorded offsets reconstruct the record-time position once the
            // i earlier erases have been re-applied
            self.queue.remove((recorded + i) as usize);
        }
        if (pop_count as usize) < self.queue.len() {
            for _ in 0..pop_count {
                self.queue.pop_front();
            }
        } else {
            self.queue.clear();
        }
        let push_count = buf.read_u64()?;
        for _ in 0..push_count {
            self.queue.push_back(buf.read_value()?);
        }
        Ok(())
    }
}
