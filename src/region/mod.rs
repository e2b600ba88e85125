//! Per-PE consistent-region coordination.
//!
//! Operators of a consistent region jointly drain, checkpoint and reset so
//! the whole subgraph can roll back to a globally consistent state. This
//! module keeps the per-region completion bookkeeping, runs checkpoint and
//! reset work items on a bounded worker pool, and reports phase completions
//! to the job coordinator through the [`RegionNotifier`] contract.

use thiserror::Error;

use crate::{OperatorIndex, RegionIndex};

mod info;
mod pool;
mod service;

pub use pool::WorkerPool;
pub use service::{OperatorContext, RegionNotifier, RegionService};

/// An error raised by the consistent-region service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    #[error("no operator registered for consistent region {0}")]
    UnknownRegion(RegionIndex),
    #[error("operator {operator} is not registered in region {region}")]
    UnknownOperator {
        region: RegionIndex,
        operator: OperatorIndex,
    },
    #[error("the worker pool is shut down")]
    PoolShutdown,
}
