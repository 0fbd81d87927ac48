//! The inference contract every worker invokes.
//!
//! Epistemic foundation:
//! - K_i: A unit is owned by exactly one worker (it may hold a loaded model)
//! - B_i: Each call may fail → `InferenceError`, recorded against the index
//! - I^B: A call may panic → caught and reported like any other failure

use crate::models::{InferenceError, Prediction, Record, UnitResult, WorkUnit};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

/// A loaded model that turns one record into one prediction.
pub trait InferenceUnit: Send {
    fn infer(&mut self, record: &Record) -> Result<Prediction, InferenceError>;
}

impl<F> InferenceUnit for F
where
    F: FnMut(&Record) -> Result<Prediction, InferenceError> + Send,
{
    fn infer(&mut self, record: &Record) -> Result<Prediction, InferenceError> {
        self(record)
    }
}

/// Loads one `InferenceUnit` per worker.
///
/// Called once per worker before the run starts, so a failure here is fatal.
pub trait InferenceFactory: Send + Sync {
    fn load(&self, worker_id: usize) -> Result<Box<dyn InferenceUnit>, InferenceError>;
}

impl<F> InferenceFactory for F
where
    F: Fn(usize) -> Result<Box<dyn InferenceUnit>, InferenceError> + Send + Sync,
{
    fn load(&self, worker_id: usize) -> Result<Box<dyn InferenceUnit>, InferenceError> {
        self(worker_id)
    }
}

/// Run one work unit, timing it and turning panics into failures.
pub fn execute(unit: &mut dyn InferenceUnit, work: &WorkUnit) -> UnitResult {
    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| unit.infer(&work.record)));
    let infer_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(value)) => UnitResult::success(work.index, value, infer_ms),
        Ok(Err(error)) => UnitResult::failure(work.index, error),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            UnitResult::failure(work.index, InferenceError::Panicked(message))
        }
    }
}
