//! Work dispatcher - the run loop.
//!
//! Epistemic foundation:
//! - K_i: The dispatcher is the only writer of run state and of the checkpoint
//! - K_i: At most `capacity` units are in flight; the lowest pending index goes first
//! - B_i: The process may be killed at any point → checkpoint every K completions
//! - I^R: After interruption, resume re-runs only what the checkpoint does not hold

use super::aggregator::{AlignedResults, aggregate};
use super::progress::{NoProgress, ProgressEvent, ProgressSink, Throttle};
use super::state::RunState;
use crate::checkpoint::{CheckpointSnapshot, CheckpointStore, RunIdentity};
use crate::inference::InferenceFactory;
use crate::models::{
    Config, EngineError, ModelConfig, Record, Result, RunStats, UnitOutcome, UnitResult, WorkUnit,
};
use crate::pool::{ExecutionPool, PoolStrategy};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Checkpoint key override; `None` derives `<model>-<fingerprint>` from the record set
    pub key: Option<String>,
    /// Model identity recorded in (and checked against) the checkpoint
    pub model_id: String,
    /// Save after this many completions (K)
    pub checkpoint_interval: usize,
    /// How long in-flight units get to finish after cancellation
    pub grace_period: Duration,
    /// Minimum gap between progress events
    pub progress_interval: Duration,
    /// Re-queue units that failed in an earlier run
    pub retry_failed: bool,
}

impl EngineSettings {
    /// Settings for running one of the configured models.
    pub fn from_config(config: &Config, model: &ModelConfig) -> Self {
        Self {
            key: config.checkpoint_key(model),
            model_id: model.model_id(),
            checkpoint_interval: config.engine.checkpoint_interval.max(1),
            grace_period: Duration::from_secs(config.engine.grace_period_secs),
            progress_interval: Duration::from_millis(config.engine.progress_interval_ms),
            retry_failed: false,
        }
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Predictions aligned with the input
    pub results: AlignedResults,
    /// Every record reached a terminal outcome
    pub completed: bool,
    /// The run stopped because of cancellation
    pub cancelled: bool,
    pub stats: RunStats,
}

/// Resumable batch inference engine.
pub struct Engine {
    settings: EngineSettings,
    store: CheckpointStore,
    strategy: PoolStrategy,
    progress: Arc<dyn ProgressSink>,
}

impl Engine {
    pub fn new(settings: EngineSettings, store: CheckpointStore, strategy: PoolStrategy) -> Self {
        Self {
            settings,
            store,
            strategy,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Run inference over `records`, resuming from a matching checkpoint.
    ///
    /// Returns normally on completion and on cancellation (`outcome.cancelled`);
    /// in both cases all completed work is checkpointed first. Errors are
    /// returned only for failures that stop the whole run.
    pub async fn run(
        &self,
        records: &[Record],
        factory: Arc<dyn InferenceFactory>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let mut dispatcher = Dispatcher::new(self, records)?;

        if dispatcher.state.is_finished() {
            info!(total = records.len(), "All records already processed, nothing to do");
            return dispatcher.finish(false);
        }
        if cancel.is_cancelled() {
            return dispatcher.finish(true);
        }

        info!(
            total = records.len(),
            pending = dispatcher.state.pending_len(),
            already_done = dispatcher.resumed,
            workers = self.strategy.workers(),
            "Starting inference run"
        );

        let mut pool = self.strategy.start(factory).await?;
        let driven = dispatcher.drive(pool.as_mut(), &cancel).await;
        pool.shutdown().await;

        match driven {
            Ok(()) => {
                let cancelled = cancel.is_cancelled() && !dispatcher.state.is_finished();
                dispatcher.finish(cancelled)
            }
            Err(e) => {
                dispatcher.save_checkpoint();
                Err(e)
            }
        }
    }
}

/// Per-run bookkeeping.
struct Dispatcher<'a> {
    settings: &'a EngineSettings,
    store: &'a CheckpointStore,
    progress: &'a dyn ProgressSink,
    records: &'a [Record],
    identity: RunIdentity,
    state: RunState,
    /// When the first run on this record set started
    started_at: DateTime<Utc>,
    /// Inference time carried over from earlier runs
    prior_inference_secs: f64,
    inference_ms: u64,
    resumed: usize,
    processed: usize,
    failed: usize,
    /// Completions not yet in a saved snapshot
    unsaved: usize,
    /// Completions since the last save attempt, successful or not
    since_attempt: usize,
    save_failures: usize,
    started: Instant,
    throttle: Throttle,
}

impl<'a> Dispatcher<'a> {
    fn new(engine: &'a Engine, records: &'a [Record]) -> Result<Self> {
        let settings = &engine.settings;
        let identity = RunIdentity::resolve(settings.key.as_deref(), &settings.model_id, records);

        let (prior, started_at, prior_inference_secs) = match engine.store.load(&identity) {
            Some(snapshot) => {
                let mut results = snapshot.results;
                if settings.retry_failed {
                    let before = results.len();
                    results.retain(|_, outcome| outcome.is_success());
                    let requeued = before - results.len();
                    if requeued > 0 {
                        info!(requeued, "Re-queueing previously failed records");
                    }
                }
                info!(
                    key = %identity.key,
                    completed = results.len(),
                    "Resuming from checkpoint"
                );
                (results, snapshot.started_at, snapshot.inference_secs)
            }
            None => (BTreeMap::new(), Utc::now(), 0.0),
        };

        let failed = prior.values().filter(|o| !o.is_success()).count();
        let resumed = prior.len();
        let state = RunState::seeded(records.len(), prior)?;

        Ok(Self {
            settings,
            store: &engine.store,
            progress: engine.progress.as_ref(),
            records,
            identity,
            state,
            started_at,
            prior_inference_secs,
            inference_ms: 0,
            resumed,
            processed: 0,
            failed,
            unsaved: 0,
            since_attempt: 0,
            save_failures: 0,
            started: Instant::now(),
            throttle: Throttle::new(settings.progress_interval),
        })
    }

    /// Keep the pool saturated until everything is done or the run is cancelled.
    async fn drive(&mut self, pool: &mut dyn ExecutionPool, cancel: &CancellationToken) -> Result<()> {
        loop {
            while !cancel.is_cancelled() && self.state.in_flight_len() < pool.capacity() {
                let Some(index) = self.state.next_pending() else {
                    break;
                };
                let unit = WorkUnit {
                    index,
                    record: self.records[index].clone(),
                };
                if let Err(e) = pool.submit(unit).await {
                    return Err(match e {
                        // Every worker is gone
                        EngineError::ChannelClosed => EngineError::PoolExhausted {
                            outstanding: self.state.in_flight_len() + self.state.pending_len(),
                        },
                        other => other,
                    });
                }
            }

            if self.state.in_flight_len() == 0 {
                return Ok(());
            }
            if cancel.is_cancelled() {
                self.drain(pool).await;
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(
                        in_flight = self.state.in_flight_len(),
                        grace_secs = self.settings.grace_period.as_secs(),
                        "Cancellation requested, waiting for in-flight records"
                    );
                }
                result = pool.next_result() => match result {
                    Some(result) => self.record(result),
                    None => {
                        return Err(EngineError::PoolExhausted {
                            outstanding: self.state.in_flight_len() + self.state.pending_len(),
                        });
                    }
                },
            }
        }
    }

    /// Collect in-flight results until the grace period runs out.
    async fn drain(&mut self, pool: &mut dyn ExecutionPool) {
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        while self.state.in_flight_len() > 0 {
            match tokio::time::timeout_at(deadline, pool.next_result()).await {
                Ok(Some(result)) => self.record(result),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = self.state.in_flight_len(),
                        "Grace period expired, abandoning in-flight records"
                    );
                    break;
                }
            }
        }
    }

    fn record(&mut self, result: UnitResult) {
        let UnitResult { index, outcome } = result;
        if let UnitOutcome::Failure { error } = &outcome {
            warn!(index, kind = error.kind(), error = %error, "Inference failed");
        }
        let failed = !outcome.is_success();
        let infer_ms = outcome.infer_ms();

        if let Err(e) = self.state.complete(index, outcome) {
            warn!(error = %e, "Dropping unexpected result");
            return;
        }

        self.inference_ms += infer_ms;
        self.processed += 1;
        self.unsaved += 1;
        self.since_attempt += 1;
        if failed {
            self.failed += 1;
        }

        let due = self.since_attempt >= self.settings.checkpoint_interval;
        let saved = due && self.save_checkpoint();
        self.emit_progress(saved);
    }

    fn snapshot(&self) -> CheckpointSnapshot {
        let mut snapshot = CheckpointSnapshot::new(&self.identity);
        snapshot.results = self.state.completed().clone();
        snapshot.completed = snapshot.results.keys().copied().collect();
        snapshot.inference_secs = self.inference_secs();
        snapshot.started_at = self.started_at;
        snapshot
    }

    /// Persist completed work; returns whether a snapshot was written.
    ///
    /// Save failures do not stop the run. A failed save is retried at the next
    /// interval, not on every completion, and only the first one is a warning.
    fn save_checkpoint(&mut self) -> bool {
        if self.unsaved == 0 {
            return false;
        }
        self.since_attempt = 0;
        match self.store.save(&self.snapshot()) {
            Ok(()) => {
                self.unsaved = 0;
                true
            }
            Err(e) => {
                self.save_failures += 1;
                if self.save_failures == 1 {
                    warn!(
                        error = %e,
                        unsaved = self.unsaved,
                        "Failed to save checkpoint, progress is not durable until a save succeeds"
                    );
                } else {
                    debug!(failures = self.save_failures, error = %e, "Checkpoint save failed again");
                }
                false
            }
        }
    }

    fn inference_secs(&self) -> f64 {
        self.prior_inference_secs + self.inference_ms as f64 / 1000.0
    }

    fn event(&self, checkpoint_saved: bool) -> ProgressEvent {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        ProgressEvent {
            completed: self.state.completed().len(),
            total: self.state.total(),
            failed: self.failed,
            elapsed,
            rate: if secs > 0.0 {
                self.processed as f64 / secs
            } else {
                0.0
            },
            checkpoint_saved,
        }
    }

    fn emit_progress(&mut self, force: bool) {
        if self.throttle.ready(force) {
            self.progress.on_progress(&self.event(force));
        }
    }

    fn finish(mut self, cancelled: bool) -> Result<RunOutcome> {
        let finished = self.state.is_finished();
        let results = aggregate(self.state.total(), self.state.completed());

        if finished && results.failed.is_empty() {
            match self.store.clear(&self.identity.key) {
                Ok(()) => debug!(key = %self.identity.key, "Checkpoint cleared"),
                Err(e) => warn!(error = %e, "Failed to clear checkpoint"),
            }
        } else {
            self.save_checkpoint();
        }

        let event = self.event(true);
        self.progress.on_finish(&event);

        let mut stats = RunStats {
            total_records: self.state.total(),
            resumed: self.resumed,
            processed_this_run: self.processed,
            succeeded: results.succeeded(),
            failed: results.failed.len(),
            incomplete: results.incomplete.len(),
            inference_secs: self.inference_secs(),
            runtime_secs: event.elapsed.as_secs_f64(),
            checkpoint_save_failures: self.save_failures,
            ..Default::default()
        };
        stats.finalize();

        if self.save_failures > 0 {
            warn!(
                failures = self.save_failures,
                unsaved = self.unsaved,
                "Checkpoint saves failed during this run"
            );
        }
        if cancelled {
            info!(
                completed = event.completed,
                incomplete = stats.incomplete,
                "Run interrupted, progress checkpointed"
            );
        } else {
            info!(
                succeeded = stats.succeeded,
                failed = stats.failed,
                incomplete = stats.incomplete,
                "Run finished"
            );
        }

        Ok(RunOutcome {
            results,
            completed: finished,
            cancelled,
            stats,
        })
    }
}
