//! Index records of the incremental checkpoint chain.
//!
//! Every checkpoint of an incrementally-logged piece of state appends one
//! [`IncrementalIndex`] to the index buffer. Delta records point back to the
//! checkpoint they are relative to, forming a chain that terminates in a base
//! record within at most `incremental_interval` hops (the interval controller
//! enforces that bound, not the index itself).

use super::{ByteBuffer, CheckpointError};
use crate::SequenceId;

/// Role of a checkpoint inside the base/delta chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Full image of the logged state.
    Base = 0,
    /// First delta after a base.
    FirstDelta = 1,
    /// Delta relative to a previous delta.
    Delta = 2,
}

impl IndexKind {
    fn from_u8(value: u8) -> Result<Self, CheckpointError> {
        match value {
            0 => Ok(IndexKind::Base),
            1 => Ok(IndexKind::FirstDelta),
            2 => Ok(IndexKind::Delta),
            other => Err(CheckpointError::InvalidIndexKind(other)),
        }
    }
}

/// Position of one checkpoint's data within the incremental log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalIndex {
    /// Base or delta.
    pub kind: IndexKind,
    /// Byte offset of this checkpoint's data in its delta buffer.
    pub offset: u64,
    /// Sequence id this checkpoint is relative to; 0 for a base.
    pub prev_id: SequenceId,
    /// Byte offset of the previous checkpoint's index record.
    pub prev_index_offset: u64,
}

impl IncrementalIndex {
    pub fn base(offset: u64) -> Self {
        Self {
            kind: IndexKind::Base,
            offset,
            prev_id: 0,
            prev_index_offset: 0,
        }
    }

    pub fn delta(
        kind: IndexKind,
        offset: u64,
        prev_id: SequenceId,
        prev_index_offset: u64,
    ) -> Self {
        Self {
            kind,
            offset,
            prev_id,
            prev_index_offset,
        }
    }

    pub fn is_base(&self) -> bool {
        self.kind == IndexKind::Base
    }

    /// Append this record to an index buffer.
    pub fn serialize(&self, buf: &mut ByteBuffer) {
        buf.write_u8(self.kind as u8);
        buf.write_vu64(self.offset);
        buf.write_vu64(self.prev_id as u64);
        buf.write_vu64(self.prev_index_offset);
    }

    pub fn deserialize(buf: &mut ByteBuffer) -> Result<Self, CheckpointError> {
        let kind = IndexKind::from_u8(buf.read_u8()?)?;
        let offset = buf.read_vu64()?;
        let prev_id = buf.read_vu64()? as SequenceId;
        let prev_index_offset = buf.read_vu64()?;
        Ok(Self {
            kind,
            offset,
            prev_id,
            prev_index_offset,
        })
    }
}
