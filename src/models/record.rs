//! Record and result types for resumable-infer.
//!
//! K_i: These types represent the data flow between dispatcher and workers.
//! Workers only ever see `WorkUnit`s and hand back `UnitResult`s.

use super::InferenceError;
use serde::{Deserialize, Serialize};

/// One input record (a row of the source table, as a JSON object).
pub type Record = serde_json::Value;

/// Value produced by a successful inference call.
pub type Prediction = serde_json::Value;

/// Atomic unit of dispatch: one record and its position in the record set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Zero-based index in the record set
    pub index: usize,

    /// The record to run inference on
    pub record: Record,
}

/// Outcome of a single inference call.
///
/// B_i(inference succeeds) → Success | Failure. Both are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UnitOutcome {
    Success {
        value: Prediction,
        /// Wall-clock inference time in milliseconds
        #[serde(default)]
        infer_ms: u64,
    },
    Failure {
        error: InferenceError,
    },
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Successful value, if any.
    pub fn value(&self) -> Option<&Prediction> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    pub fn infer_ms(&self) -> u64 {
        match self {
            Self::Success { infer_ms, .. } => *infer_ms,
            Self::Failure { .. } => 0,
        }
    }
}

/// Result of a work unit, keyed by its original index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub index: usize,
    pub outcome: UnitOutcome,
}

impl UnitResult {
    pub fn success(index: usize, value: Prediction, infer_ms: u64) -> Self {
        Self {
            index,
            outcome: UnitOutcome::Success { value, infer_ms },
        }
    }

    pub fn failure(index: usize, error: InferenceError) -> Self {
        Self {
            index,
            outcome: UnitOutcome::Failure { error },
        }
    }
}

/// A failed index with its error detail, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUnit {
    pub index: usize,
    pub error: InferenceError,
}

/// Statistics for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Records in the record set
    pub total_records: usize,

    /// Records already completed by a previous run (taken from the checkpoint)
    pub resumed: usize,

    /// Records completed during this run
    pub processed_this_run: usize,

    /// Records with a successful result
    pub succeeded: usize,

    /// Records whose inference failed
    pub failed: usize,

    /// Records never attempted or abandoned in flight
    pub incomplete: usize,

    /// Cumulative inference time across all runs of this record set (seconds)
    pub inference_secs: f64,

    /// Wall-clock runtime of this run (seconds)
    pub runtime_secs: f64,

    /// Average inference time per completed record (seconds)
    pub avg_infer_secs: f64,

    /// Records per hour during this run
    pub throughput_per_hour: f64,

    /// Checkpoint saves that failed during this run
    pub checkpoint_save_failures: usize,
}

impl RunStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        let done = self.succeeded + self.failed;
        if done > 0 {
            self.avg_infer_secs = self.inference_secs / done as f64;
        }
        if self.runtime_secs > 0.0 {
            self.throughput_per_hour = self.processed_this_run as f64 / self.runtime_secs * 3600.0;
        }
    }
}
