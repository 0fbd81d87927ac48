//! Error types for resumable-infer.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad input, bad config) → fatal before the run starts
//! - I^B materialized: Per-unit and persistence failures → recorded, run continues
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level (fatal) error type for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED - Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Failed to load model for worker {worker_id}: {source}")]
    ModelLoad {
        worker_id: usize,
        #[source]
        source: InferenceError,
    },

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED - Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker pool exhausted with {outstanding} unit(s) still in flight")]
    PoolExhausted { outstanding: usize },

    #[error("Failed to spawn worker process {command}: {source}")]
    WorkerSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED - Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl EngineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Per-unit inference failure.
///
/// Never aborts a run. Serializable because it travels inside checkpoints and
/// across the worker process protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum InferenceError {
    #[error("Model backend error: {0}")]
    Backend(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Inference panicked: {0}")]
    Panicked(String),
}

impl InferenceError {
    /// Short, stable name for the error kind (used in summaries and output).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::MalformedRecord(_) => "malformed_record",
            Self::Timeout(_) => "timeout",
            Self::WorkerLost(_) => "worker_lost",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Checkpoint persistence errors.
///
/// I^B: Always recovered locally by the dispatcher. A failed save means the run
/// continues without persistence; a failed load means the run starts fresh.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error ({context}) at {path}: {source}")]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Checkpoint does not match this run: {0}")]
    Mismatch(String),

    #[error("No writable checkpoint location (tried {tried} candidate(s))")]
    NoWritableLocation { tried: usize },
}

impl CheckpointError {
    pub(crate) fn io(context: impl Into<String>, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
