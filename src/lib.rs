#[macro_use]
extern crate derivative;

pub mod checkpoint;
pub mod config;
pub mod region;
pub mod window;

pub use checkpoint::{
    ByteBuffer, Checkpoint, CheckpointError, CheckpointFactory, MemoryStore, StateHandler,
    StateStore,
};
pub use config::{CheckpointConfig, ConfigurationError, RegionConfig, RuntimeConfig};
pub use region::{OperatorContext, RegionNotifier, RegionService};
pub use window::{SlidingWindow, TumblingWindow, WindowOutput};

/// Sequence identifier of a checkpoint or of a drain/checkpoint/reset cycle.
pub type SequenceId = i64;

/// Index of a consistent region within the job.
pub type RegionIndex = i32;

/// Index of an operator within its processing element.
pub type OperatorIndex = u32;
