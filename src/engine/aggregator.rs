//! Reassembly of unit outcomes into input order.

use crate::models::{FailedUnit, Prediction, UnitOutcome};
use serde::Serialize;
use std::collections::BTreeMap;

/// Final (or snapshot) output aligned index-for-index with the input.
///
/// Every index is in exactly one of three places: a `Some` value, `failed`,
/// or `incomplete`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignedResults {
    /// `values[i]` is the prediction for record `i`; `None` if it failed or never ran
    pub values: Vec<Option<Prediction>>,
    /// Indices whose inference failed, ascending
    pub failed: Vec<FailedUnit>,
    /// Indices never attempted or abandoned in flight, ascending
    pub incomplete: Vec<usize>,
}

impl AlignedResults {
    pub fn succeeded(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|f| f.index).collect()
    }
}

/// Build aligned results for `total` records from the completed outcomes.
///
/// Keys on the original index, never on arrival order.
pub fn aggregate(total: usize, completed: &BTreeMap<usize, UnitOutcome>) -> AlignedResults {
    let mut values = vec![None; total];
    let mut failed = Vec::new();
    let mut incomplete = Vec::new();

    for (index, slot) in values.iter_mut().enumerate() {
        match completed.get(&index) {
            Some(UnitOutcome::Success { value, .. }) => *slot = Some(value.clone()),
            Some(UnitOutcome::Failure { error }) => failed.push(FailedUnit {
                index,
                error: error.clone(),
            }),
            None => incomplete.push(index),
        }
    }

    AlignedResults {
        values,
        failed,
        incomplete,
    }
}
