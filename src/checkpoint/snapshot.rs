//! Checkpoint snapshot for resumable runs.
//!
//! Epistemic foundation:
//! - K_i: A snapshot records which indices are done and what they produced
//! - K_i: A snapshot is only usable against the exact record set it was taken on
//! - B_i: The record set may have changed since → validated on load, never trusted

use crate::models::{Record, UnitOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;

use crate::models::CheckpointError;

/// Version of the on-disk snapshot layout.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Identity of a run: what a snapshot must match to be resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub key: String,
    pub model_id: String,
    pub total_records: usize,
    pub fingerprint: String,
}

impl RunIdentity {
    pub fn new(key: impl Into<String>, model_id: impl Into<String>, records: &[Record]) -> Self {
        Self {
            key: key.into(),
            model_id: model_id.into(),
            total_records: records.len(),
            fingerprint: fingerprint(records),
        }
    }

    /// Identity under `key`, or under a key derived from the model and the
    /// record set when no override is given.
    ///
    /// K_i: Distinct record sets never share a derived key, so one input's
    /// checkpoint is never overwritten by a run over another.
    pub fn resolve(key: Option<&str>, model_id: &str, records: &[Record]) -> Self {
        let fingerprint = fingerprint(records);
        let key = match key {
            Some(key) => key.to_string(),
            None => default_key(model_id, &fingerprint),
        };
        Self {
            key,
            model_id: model_id.to_string(),
            total_records: records.len(),
            fingerprint,
        }
    }
}

/// Checkpoint key for a model and record-set fingerprint: `<model>-<12 hex chars>`.
pub fn default_key(model_id: &str, fingerprint: &str) -> String {
    let prefix = fingerprint.get(..12).unwrap_or(fingerprint);
    format!("{model_id}-{prefix}")
}

/// Content fingerprint of a record set (order-sensitive).
pub fn fingerprint(records: &[Record]) -> String {
    let mut hasher = seahash::SeaHasher::new();
    hasher.write_u64(records.len() as u64);
    for record in records {
        hasher.write(record.to_string().as_bytes());
        hasher.write_u8(0x1e);
    }
    format!("{:016x}", hasher.finish())
}

/// Durable record of a run's progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Layout version
    pub format_version: u32,
    /// Checkpoint key this snapshot was saved under
    pub key: String,
    /// Model the results were produced with
    pub model_id: String,
    /// Length of the record set
    pub total_records: usize,
    /// Fingerprint of the record set
    pub fingerprint: String,
    /// Indices with a terminal outcome
    pub completed: BTreeSet<usize>,
    /// Outcome per completed index
    pub results: BTreeMap<usize, UnitOutcome>,
    /// Cumulative inference time (seconds)
    #[serde(default)]
    pub inference_secs: f64,
    /// When the first run on this record set started
    pub started_at: DateTime<Utc>,
    /// Last save time
    pub saved_at: DateTime<Utc>,
}

impl CheckpointSnapshot {
    /// Create an empty snapshot for a run.
    pub fn new(identity: &RunIdentity) -> Self {
        let now = Utc::now();
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            key: identity.key.clone(),
            model_id: identity.model_id.clone(),
            total_records: identity.total_records,
            fingerprint: identity.fingerprint.clone(),
            completed: BTreeSet::new(),
            results: BTreeMap::new(),
            inference_secs: 0.0,
            started_at: now,
            saved_at: now,
        }
    }

    /// Check that this snapshot can seed a run with the given identity.
    ///
    /// Any disagreement means "no usable checkpoint"; a partial resume is never attempted.
    pub fn validate(&self, identity: &RunIdentity) -> Result<(), CheckpointError> {
        let mismatch = |what: String| Err(CheckpointError::Mismatch(what));

        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return mismatch(format!(
                "format version {} (expected {})",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            ));
        }
        if self.key != identity.key {
            return mismatch(format!("key '{}' (expected '{}')", self.key, identity.key));
        }
        if self.model_id != identity.model_id {
            return mismatch(format!(
                "model '{}' (expected '{}')",
                self.model_id, identity.model_id
            ));
        }
        if self.total_records != identity.total_records {
            return mismatch(format!(
                "{} records (input has {})",
                self.total_records, identity.total_records
            ));
        }
        if self.fingerprint != identity.fingerprint {
            return mismatch("record set contents changed".to_string());
        }
        if let Some(&last) = self.completed.last() {
            if last >= identity.total_records {
                return mismatch(format!(
                    "index {last} out of range for {} records",
                    identity.total_records
                ));
            }
        }
        if self.completed.len() != self.results.len()
            || !self.results.keys().all(|i| self.completed.contains(i))
        {
            return mismatch("completed set and results disagree".to_string());
        }
        Ok(())
    }

    /// Indices recorded as failed.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(&i, _)| i)
            .collect()
    }

    /// Get progress percentage.
    pub fn progress_percent(&self) -> f64 {
        if self.total_records == 0 {
            return 100.0;
        }
        (self.completed.len() as f64 / self.total_records as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InferenceError;
    use serde_json::json;

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| json!({ "text": format!("report {i}") })).collect()
    }

    fn snapshot_with(identity: &RunIdentity, done: &[usize]) -> CheckpointSnapshot {
        let mut snap = CheckpointSnapshot::new(identity);
        for &i in done {
            snap.completed.insert(i);
            snap.results.insert(
                i,
                UnitOutcome::Success {
                    value: json!(i),
                    infer_ms: 1,
                },
            );
        }
        snap
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = records(3);
        let mut b = a.clone();
        b.swap(0, 2);
        assert_eq!(fingerprint(&a), fingerprint(&a.clone()));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_resolved_key_follows_record_set() {
        let a = RunIdentity::resolve(None, "qwen", &records(5));
        let b = RunIdentity::resolve(None, "qwen", &records(4));
        assert!(a.key.starts_with("qwen-"));
        assert_eq!(a.key.len(), "qwen-".len() + 12);
        assert_ne!(a.key, b.key);
        assert_eq!(a.key, RunIdentity::resolve(None, "qwen", &records(5)).key);

        let pinned = RunIdentity::resolve(Some("nightly"), "qwen", &records(5));
        assert_eq!(pinned.key, "nightly");
        assert_eq!(pinned.fingerprint, a.fingerprint);
    }

    #[test]
    fn test_validate_accepts_matching_snapshot() {
        let identity = RunIdentity::new("qwen", "qwen", &records(5));
        let snap = snapshot_with(&identity, &[0, 1]);
        snap.validate(&identity).unwrap();
        assert!((snap.progress_percent() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_length_and_model_mismatch() {
        let identity = RunIdentity::new("qwen", "qwen", &records(5));
        let snap = snapshot_with(&identity, &[0, 1]);

        let shorter = RunIdentity::new("qwen", "qwen", &records(4));
        assert!(matches!(
            snap.validate(&shorter),
            Err(CheckpointError::Mismatch(_))
        ));

        let other_model = RunIdentity::new("qwen", "llama", &records(5));
        assert!(snap.validate(&other_model).is_err());

        let other_key = RunIdentity::new("other", "qwen", &records(5));
        assert!(snap.validate(&other_key).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let identity = RunIdentity::new("k", "m", &records(3));
        let mut snap = snapshot_with(&identity, &[0]);
        snap.completed.insert(7);
        snap.results.insert(
            7,
            UnitOutcome::Success {
                value: json!(1),
                infer_ms: 0,
            },
        );
        assert!(snap.validate(&identity).is_err());
    }

    #[test]
    fn test_failed_indices() {
        let identity = RunIdentity::new("k", "m", &records(3));
        let mut snap = snapshot_with(&identity, &[0, 2]);
        snap.completed.insert(1);
        snap.results.insert(
            1,
            UnitOutcome::Failure {
                error: InferenceError::Timeout(std::time::Duration::from_secs(1)),
            },
        );
        assert_eq!(snap.failed_indices(), vec![1]);
    }
}
