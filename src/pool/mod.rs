//! Pool module - concurrent execution of inference units.
//!
//! Every strategy exposes the same contract to the dispatcher: submit a unit,
//! receive results as they complete. Which strategy runs is decided once, from
//! configuration, by `PoolStrategy::select`.

mod local;
mod process;
pub mod protocol;

pub use local::*;
pub use process::*;

use crate::inference::InferenceFactory;
use crate::models::{ConfigError, EngineConfig, ExecutorKind, Result, UnitResult, WorkUnit};
use async_trait::async_trait;
use std::sync::Arc;

/// A running set of W workers.
#[async_trait]
pub trait ExecutionPool: Send {
    /// Number of workers; the dispatcher keeps at most this many units in flight.
    fn capacity(&self) -> usize;

    /// Queue a unit for the next free worker.
    async fn submit(&mut self, unit: WorkUnit) -> Result<()>;

    /// Next finished unit, in completion order. `None` once no worker is left.
    async fn next_result(&mut self) -> Option<UnitResult>;

    /// Stop accepting work and release workers. Unfinished units are abandoned.
    async fn shutdown(&mut self);
}

/// Concurrency strategy, chosen at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStrategy {
    /// Worker threads in this process (W = 1 is the single-worker strategy)
    Local { workers: usize },
    /// Independent worker processes
    Processes {
        workers: usize,
        command: WorkerCommand,
    },
}

impl PoolStrategy {
    /// Pick a strategy from engine config.
    ///
    /// `default_command` is used for the process strategy when the config does
    /// not name a worker command (the CLI passes its own `worker` subcommand).
    pub fn select(
        engine: &EngineConfig,
        default_command: Option<WorkerCommand>,
    ) -> std::result::Result<Self, ConfigError> {
        let workers = engine.workers.max(1);
        if workers == 1 {
            return Ok(Self::Local { workers: 1 });
        }

        match engine.executor {
            ExecutorKind::Threads => Ok(Self::Local { workers }),
            ExecutorKind::Processes => {
                let command = engine
                    .worker_command
                    .as_deref()
                    .and_then(WorkerCommand::from_argv)
                    .or(default_command)
                    .ok_or_else(|| {
                        ConfigError::Invalid(
                            "executor = \"processes\" needs engine.worker_command".into(),
                        )
                    })?;
                Ok(Self::Processes { workers, command })
            }
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Self::Local { workers } | Self::Processes { workers, .. } => *workers,
        }
    }

    /// Start the workers. Local workers load their models through `factory`;
    /// worker processes load their own.
    pub async fn start(&self, factory: Arc<dyn InferenceFactory>) -> Result<Box<dyn ExecutionPool>> {
        match self {
            Self::Local { workers } => Ok(Box::new(LocalPool::start(*workers, factory).await?)),
            Self::Processes { workers, command } => {
                Ok(Box::new(ProcessPool::start(*workers, command).await?))
            }
        }
    }
}
