//! Engine runs against a real checkpoint directory: interruption, resume, and
//! the guarantees that make resuming safe.

mod common;

use common::{Scripted, expected, records};
use resumable_infer::checkpoint::CheckpointStore;
use resumable_infer::engine::ProgressEvent;
use resumable_infer::models::{EngineError, InferenceError};
use resumable_infer::{Engine, EngineSettings, PoolStrategy, ProgressSink, Record, RunIdentity};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings(interval: usize) -> EngineSettings {
    EngineSettings {
        key: Some("upper".to_string()),
        model_id: "upper-v1".to_string(),
        checkpoint_interval: interval,
        grace_period: Duration::from_secs(5),
        progress_interval: Duration::ZERO,
        retry_failed: false,
    }
}

/// Settings with the checkpoint key derived from the model and record set.
fn derived_key(interval: usize) -> EngineSettings {
    EngineSettings {
        key: None,
        ..settings(interval)
    }
}

/// Indices held by the checkpoint under `key`.
fn checkpointed(dir: &Path, key: &str) -> Vec<usize> {
    CheckpointStore::at(dir)
        .unwrap()
        .read(key)
        .unwrap()
        .map(|snapshot| snapshot.completed.into_iter().collect())
        .unwrap_or_default()
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
    finished: Mutex<Option<ProgressEvent>>,
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_finish(&self, event: &ProgressEvent) {
        *self.finished.lock().unwrap() = Some(event.clone());
    }
}

fn engine(dir: &Path, settings: EngineSettings, workers: usize) -> Engine {
    let store = CheckpointStore::at(dir).unwrap();
    Engine::new(settings, store, PoolStrategy::Local { workers })
}

#[tokio::test]
async fn interrupted_run_resumes_with_remaining_records() {
    let dir = TempDir::new().unwrap();
    let data = records(5);

    // First run: K = 2, interrupted while record 1 ("b") is being processed
    let cancel = CancellationToken::new();
    let first = Scripted::new().cancel_after(1, cancel.clone());
    let outcome = engine(dir.path(), settings(2), 1)
        .run(&data, first.factory(), cancel)
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert!(!outcome.completed);
    assert_eq!(first.calls(), vec![0, 1]);
    assert_eq!(outcome.results.incomplete, vec![2, 3, 4]);

    let store = CheckpointStore::at(dir.path()).unwrap();
    let snapshot = store.read("upper").unwrap().expect("checkpoint saved");
    assert_eq!(snapshot.completed.iter().copied().collect::<Vec<_>>(), vec![0, 1]);

    // Second run picks up at record 2
    let second = Scripted::new();
    let outcome = engine(dir.path(), settings(2), 1)
        .run(&data, second.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(second.calls(), vec![2, 3, 4]);
    assert_eq!(outcome.results.values, expected(5));
    assert_eq!(outcome.stats.resumed, 2);
    assert_eq!(outcome.stats.processed_this_run, 3);
    // Full success clears the checkpoint
    assert!(store.read("upper").unwrap().is_none());
}

#[tokio::test]
async fn no_record_is_invoked_twice_across_resumes() {
    let dir = TempDir::new().unwrap();
    let data = records(12);

    let cancel = CancellationToken::new();
    let first = Scripted::new().cancel_after(4, cancel.clone());
    engine(dir.path(), settings(1), 1)
        .run(&data, first.factory(), cancel)
        .await
        .unwrap();

    let second = Scripted::new();
    let outcome = engine(dir.path(), settings(1), 3)
        .run(&data, second.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    for id in 0..12 {
        assert_eq!(
            first.calls_for(id) + second.calls_for(id),
            1,
            "record {id} invoked more than once"
        );
    }
}

#[tokio::test]
async fn resuming_a_finished_checkpoint_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let data = records(4);

    // A failure keeps the checkpoint around after completion
    let first = Scripted::new().failing(&[3]);
    let outcome = engine(dir.path(), settings(2), 1)
        .run(&data, first.factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.results.failed_indices(), vec![3]);

    let again = Scripted::new();
    let rerun = engine(dir.path(), settings(2), 1)
        .run(&data, again.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(again.calls().is_empty());
    assert_eq!(again.loads(), 0, "no model should load when nothing is pending");
    assert_eq!(rerun.results, outcome.results);
}

#[tokio::test]
async fn output_order_follows_input_not_completion() {
    let data = records(3);
    let scripted = Scripted::new()
        .delay(0, Duration::from_millis(300))
        .delay(1, Duration::from_millis(150));

    let engine = Engine::new(
        settings(10),
        CheckpointStore::disabled(),
        PoolStrategy::Local { workers: 3 },
    );
    let outcome = engine
        .run(&data, scripted.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(scripted.loads(), 3);
    assert_eq!(outcome.results.values, expected(3));
}

#[tokio::test]
async fn changed_input_is_not_resumed() {
    let dir = TempDir::new().unwrap();
    let data = records(6);

    let cancel = CancellationToken::new();
    let first = Scripted::new().cancel_after(2, cancel.clone());
    engine(dir.path(), settings(1), 1)
        .run(&data, first.factory(), cancel)
        .await
        .unwrap();

    // Same length, different content
    let mut edited: Vec<Record> = data.clone();
    edited[0] = json!({ "id": 0, "text": "z" });

    let second = Scripted::new();
    let outcome = engine(dir.path(), settings(1), 1)
        .run(&edited, second.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.calls(), (0..6).collect::<Vec<_>>());
    assert_eq!(outcome.stats.resumed, 0);
    assert_eq!(outcome.results.values[0], Some(json!("Z")));
}

#[tokio::test]
async fn different_model_is_not_resumed() {
    let dir = TempDir::new().unwrap();
    let data = records(4);

    let cancel = CancellationToken::new();
    let first = Scripted::new().cancel_after(1, cancel.clone());
    engine(dir.path(), settings(1), 1)
        .run(&data, first.factory(), cancel)
        .await
        .unwrap();

    let mut other_model = settings(1);
    other_model.model_id = "upper-v2".to_string();
    let second = Scripted::new();
    let outcome = engine(dir.path(), other_model, 1)
        .run(&data, second.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.calls(), vec![0, 1, 2, 3]);
    assert!(outcome.completed);
}

#[tokio::test]
async fn runs_without_any_writable_checkpoint_location() {
    let dir = TempDir::new().unwrap();
    // A regular file where a directory is expected cannot hold checkpoints
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();
    let store = CheckpointStore::open(&[blocker.join("checkpoints"), blocker.join("other")]);
    assert!(!store.is_enabled());

    let scripted = Scripted::new();
    let engine = Engine::new(settings(1), store, PoolStrategy::Local { workers: 2 });
    let outcome = engine
        .run(&records(5), scripted.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.results.values, expected(5));
}

#[tokio::test]
async fn failures_are_isolated_and_retried_on_request() {
    let dir = TempDir::new().unwrap();
    let data = records(5);

    let first = Scripted::new().failing(&[1, 3]);
    let outcome = engine(dir.path(), settings(2), 2)
        .run(&data, first.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.results.failed_indices(), vec![1, 3]);
    assert!(matches!(
        outcome.results.failed[0].error,
        InferenceError::Backend(_)
    ));
    assert_eq!(outcome.results.values[0], Some(json!("A")));
    assert_eq!(outcome.results.values[1], None);
    assert_eq!(outcome.stats.failed, 2);

    // Failures stay terminal unless re-queued explicitly
    let retry = Scripted::new();
    let outcome = engine(dir.path(), settings(2).with_retry_failed(true), 1)
        .run(&data, retry.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(retry.calls(), vec![1, 3]);
    assert_eq!(outcome.results.values, expected(5));
    assert!(
        CheckpointStore::at(dir.path())
            .unwrap()
            .read("upper")
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn malformed_record_fails_only_itself() {
    let mut data = records(3);
    data[1] = json!({ "id": 1, "body": "no text field" });

    let scripted = Scripted::new();
    let engine = Engine::new(
        settings(1),
        CheckpointStore::disabled(),
        PoolStrategy::Local { workers: 1 },
    );
    let outcome = engine
        .run(&data, scripted.factory(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.results.failed_indices(), vec![1]);
    assert!(matches!(
        outcome.results.failed[0].error,
        InferenceError::MalformedRecord(_)
    ));
    assert_eq!(outcome.results.succeeded(), 2);
}

#[tokio::test]
async fn grace_period_bounds_shutdown() {
    let dir = TempDir::new().unwrap();
    let data = records(3);

    let cancel = CancellationToken::new();
    let scripted = Scripted::new()
        .cancel_after(0, cancel.clone())
        .delay(1, Duration::from_secs(3));

    let mut short_grace = settings(1);
    short_grace.grace_period = Duration::from_millis(100);
    let started = Instant::now();
    let outcome = engine(dir.path(), short_grace, 2)
        .run(&data, scripted.factory(), cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(outcome.cancelled);
    // Record 1 was abandoned in flight, record 2 never dispatched
    assert!(outcome.results.incomplete.contains(&1));
    assert!(outcome.results.incomplete.contains(&2));
}

#[tokio::test]
async fn model_load_failure_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let scripted = Scripted::new().fail_load();

    let result = engine(dir.path(), settings(1), 2)
        .run(&records(3), scripted.factory(), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(EngineError::ModelLoad { .. })));
    assert!(scripted.calls().is_empty());
    let store = CheckpointStore::at(dir.path()).unwrap();
    assert!(store.read("upper").unwrap().is_none());
}

#[tokio::test]
async fn unrelated_input_does_not_disturb_an_interrupted_run() {
    let dir = TempDir::new().unwrap();
    let first_input = records(6);
    let second_input: Vec<Record> = (0..3)
        .map(|i| json!({ "id": i, "text": format!("other {i}") }))
        .collect();

    let first_key = RunIdentity::resolve(None, "upper-v1", &first_input).key;
    let second_key = RunIdentity::resolve(None, "upper-v1", &second_input).key;
    assert_ne!(first_key, second_key);

    // Interrupt the first input after record 3
    let cancel = CancellationToken::new();
    let first = Scripted::new().cancel_after(3, cancel.clone());
    let outcome = engine(dir.path(), derived_key(1), 1)
        .run(&first_input, first.factory(), cancel)
        .await
        .unwrap();
    assert!(outcome.cancelled);
    assert_eq!(first.calls(), vec![0, 1, 2, 3]);

    // Same model, another input, run to completion
    let other = Scripted::new();
    let outcome = engine(dir.path(), derived_key(1), 1)
        .run(&second_input, other.factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(checkpointed(dir.path(), &first_key), vec![0, 1, 2, 3]);

    // The first input resumes where it stopped
    let resumed = Scripted::new();
    let outcome = engine(dir.path(), derived_key(1), 1)
        .run(&first_input, resumed.factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(resumed.calls(), vec![4, 5]);
    assert_eq!(outcome.results.values, expected(6));
    for id in 0..6 {
        assert_eq!(first.calls_for(id) + resumed.calls_for(id), 1);
    }
}

#[tokio::test]
async fn checkpoints_are_written_every_k_completions() {
    let dir = TempDir::new().unwrap();
    let data = records(6);
    let seen: Arc<Mutex<Vec<(usize, Vec<usize>)>>> = Arc::default();

    // Each call looks at what is on disk before answering
    let mut scripted = Scripted::new();
    for id in 0..6 {
        let seen = Arc::clone(&seen);
        let path = dir.path().to_owned();
        scripted = scripted.on(id, move || {
            seen.lock().unwrap().push((id, checkpointed(&path, "upper")));
        });
    }

    let outcome = engine(dir.path(), settings(2), 1)
        .run(&data, scripted.factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (0, vec![]),
            (1, vec![]),
            (2, vec![0, 1]),
            (3, vec![0, 1]),
            (4, vec![0, 1, 2, 3]),
            (5, vec![0, 1, 2, 3]),
        ]
    );
}

#[tokio::test]
async fn killed_run_resumes_from_the_last_periodic_save() {
    let dir = TempDir::new().unwrap();
    let data = records(6);

    // The run is dropped mid-flight: no cancellation, no final save
    let first = Scripted::new().delay(5, Duration::from_secs(5));
    let killed = engine(dir.path(), settings(2), 1);
    let run = killed.run(&data, first.factory(), CancellationToken::new());
    assert!(tokio::time::timeout(Duration::from_secs(1), run).await.is_err());
    assert_eq!(checkpointed(dir.path(), "upper"), vec![0, 1, 2, 3]);

    // Record 4 finished after the last save, so it runs again
    let second = Scripted::new();
    let outcome = engine(dir.path(), settings(2), 1)
        .run(&data, second.factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(second.calls(), vec![4, 5]);
    assert_eq!(outcome.stats.resumed, 4);
    assert_eq!(outcome.results.values, expected(6));
}

#[tokio::test]
async fn progress_is_throttled_and_reported_at_each_save() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());

    let mut slow_progress = settings(2);
    slow_progress.progress_interval = Duration::from_secs(60);
    let outcome = engine(dir.path(), slow_progress, 1)
        .with_progress(sink.clone())
        .run(&records(5), Scripted::new().factory(), CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.completed);

    // First event passes the throttle; later ones only accompany saves
    let events: Vec<(usize, bool)> = sink
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.completed, e.checkpoint_saved))
        .collect();
    assert_eq!(events, vec![(1, false), (2, true), (4, true)]);

    let finished = sink.finished.lock().unwrap().clone().expect("finish reported");
    assert_eq!(finished.completed, 5);
    assert_eq!(finished.total, 5);
}
