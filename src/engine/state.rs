//! In-memory run state owned by the dispatcher.
//!
//! K_i: pending, in_flight, and completed partition the index range at all times.
//! K_i: An index only moves forward: pending → in_flight → completed.

use crate::models::{EngineError, Result, UnitOutcome};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
pub struct RunState {
    total: usize,
    pending: BTreeSet<usize>,
    in_flight: BTreeSet<usize>,
    completed: BTreeMap<usize, UnitOutcome>,
}

impl RunState {
    /// Fresh state: every index pending.
    #[cfg(test)]
    fn new(total: usize) -> Self {
        Self {
            total,
            pending: (0..total).collect(),
            in_flight: BTreeSet::new(),
            completed: BTreeMap::new(),
        }
    }

    /// State seeded from outcomes recorded by an earlier run.
    pub fn seeded(total: usize, prior: BTreeMap<usize, UnitOutcome>) -> Result<Self> {
        if let Some((&last, _)) = prior.last_key_value() {
            if last >= total {
                return Err(EngineError::Internal(format!(
                    "seed index {last} out of range for {total} records"
                )));
            }
        }
        let pending = (0..total).filter(|i| !prior.contains_key(i)).collect();
        Ok(Self {
            total,
            pending,
            in_flight: BTreeSet::new(),
            completed: prior,
        })
    }

    /// Take the lowest pending index and mark it in flight.
    pub fn next_pending(&mut self) -> Option<usize> {
        let index = self.pending.pop_first()?;
        self.in_flight.insert(index);
        Some(index)
    }

    /// Record the outcome of an in-flight index.
    pub fn complete(&mut self, index: usize, outcome: UnitOutcome) -> Result<()> {
        if !self.in_flight.remove(&index) {
            return Err(EngineError::Internal(format!(
                "result for index {index} which is not in flight"
            )));
        }
        self.completed.insert(index, outcome);
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn completed(&self) -> &BTreeMap<usize, UnitOutcome> {
        &self.completed
    }

    /// Nothing pending and nothing in flight.
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Indices without a terminal outcome (pending ∪ in_flight), ascending.
    #[cfg(test)]
    fn incomplete(&self) -> Vec<usize> {
        let mut out: Vec<usize> = self.pending.iter().chain(&self.in_flight).copied().collect();
        out.sort_unstable();
        out
    }

    #[cfg(test)]
    fn is_partition(&self) -> bool {
        let sizes = self.pending.len() + self.in_flight.len() + self.completed.len();
        sizes == self.total
            && (0..self.total).all(|i| {
                let hits = [
                    self.pending.contains(&i),
                    self.in_flight.contains(&i),
                    self.completed.contains_key(&i),
                ];
                hits.iter().filter(|&&h| h).count() == 1
            })
    }
}
