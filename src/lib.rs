//! resumable-infer - Resumable batch inference over tabular records.
//!
//! ## Architecture
//!
//! One dispatcher task owns the run state and feeds an execution pool:
//! - **Local pool**: W worker threads in this process (W = 1 is the single-worker case)
//! - **Process pool**: W worker processes speaking JSON lines on stdin/stdout
//!
//! Completed outcomes are checkpointed every K completions, so an interrupted
//! run resumes with only the unfinished records. Output is aligned to input
//! order regardless of completion order.
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Index partition invariants (pending / in flight / completed)
//! - B_i (Beliefs): Per-record inference may fail; failures are recorded, not fatal
//! - I^R (Resolvable): Workers, checkpoint cadence, grace period via config
//! - I^B (Bounded): Crashes and interrupts bounded by checkpoint cadence

pub mod checkpoint;
pub mod dataset;
pub mod engine;
pub mod inference;
pub mod models;
pub mod pool;

// Re-exports for convenience
pub use checkpoint::{CheckpointSnapshot, CheckpointStore, RunIdentity};
pub use engine::{AlignedResults, Engine, EngineSettings, ProgressSink, RunOutcome};
pub use inference::{CommandInference, InferenceFactory, InferenceUnit};
pub use models::{Config, EngineError, InferenceError, Record, Result, RunStats};
pub use pool::{ExecutionPool, PoolStrategy, WorkerCommand};
