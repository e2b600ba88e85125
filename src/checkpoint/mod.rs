//! Checkpointing of operator state.
//!
//! A [`Checkpoint`] is one snapshot (or restore) session of an operator's
//! state, written through [`ByteBuffer`]s into a [`StateStore`] backend.
//! Checkpoints can be *base* (full state) or *delta* (changes since the
//! previous checkpoint); the [`IntervalController`] decides which, and the
//! [`UpdateLog`] chain makes deltas replayable in the right order at restore
//! time.

use thiserror::Error;

mod buffer;
mod factory;
mod incr_deque;
mod index;
mod interval;
mod log;
mod store;
#[allow(clippy::module_inception)]
mod checkpoint;

pub use buffer::ByteBuffer;
pub use checkpoint::{Checkpoint, CheckpointMode, CheckpointStats};
pub use factory::CheckpointFactory;
pub use incr_deque::IncrVecDeque;
pub use index::{IncrementalIndex, IndexKind};
pub use interval::IntervalController;
pub use log::UpdateLog;
pub use store::{BufferKind, MemoryStore, StateStore};

use crate::SequenceId;

/// An error raised while taking or restoring a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("buffer underflow: requested {requested} bytes, {remaining} remaining")]
    BufferUnderflow { requested: usize, remaining: usize },
    #[error("seek to offset {offset} beyond buffer size {size}")]
    BadSeek { offset: u64, size: u64 },
    #[error("checkpoint marker mismatch: expected {expected:?}, found {found:?}")]
    MarkerMismatch { expected: String, found: String },
    #[error("invalid index kind discriminant {0}")]
    InvalidIndexKind(u8),
    #[error("no {kind:?} buffer stored for checkpoint {seq_id}")]
    MissingBuffer { seq_id: SequenceId, kind: BufferKind },
    #[error("cannot find base checkpoint walking back from {seq_id} within {hops} hops")]
    BaseNotFound { seq_id: SequenceId, hops: u32 },
    #[error("operation not valid while {0}")]
    WrongMode(&'static str),
    #[error(transparent)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(transparent)]
    Decode(#[from] bincode::error::DecodeError),
    #[error("state store failure: {0}")]
    Store(String),
}

/// Operator state that can be saved into and restored from a [`Checkpoint`].
///
/// This is the surface the consistent-region layer drives: a drain, then a
/// checkpoint on the drained state, or a reset back to a previously committed
/// checkpoint.
pub trait StateHandler: Send {
    /// Serialize the current state into `ckpt`.
    fn checkpoint(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError>;
    /// Replace the current state with the one stored in `ckpt`.
    fn reset(&mut self, ckpt: &mut Checkpoint) -> Result<(), CheckpointError>;
    /// Drop all state, going back to a freshly-constructed equivalent.
    fn reset_to_initial_state(&mut self);
    /// Finish processing in-flight work before a checkpoint is taken.
    fn drain(&mut self) {}
}
