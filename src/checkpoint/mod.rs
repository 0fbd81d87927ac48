//! Checkpoint module for resumable execution.
//!
//! Provides:
//! - `CheckpointSnapshot`: Completed indices and their outcomes for one record set
//! - `CheckpointStore`: Persistence, loading, and location discovery

mod snapshot;
mod store;

pub use snapshot::*;
pub use store::*;
