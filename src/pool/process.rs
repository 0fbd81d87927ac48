//! Multi-process worker pool.
//!
//! Epistemic foundation:
//! - K_i: Each worker is an independent OS process with its own loaded model
//! - K_i: Workers only exchange `WorkUnit`/`UnitResult` lines with this process
//! - B_i: A worker process may die mid-unit → that unit fails with `WorkerLost`
//! - I^B: Operator Ctrl+C must not reach workers → own process group, parent decides

use super::ExecutionPool;
use super::protocol::{WorkerMessage, read_line, write_line};
use crate::models::{EngineError, InferenceError, Result, UnitResult, WorkUnit};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable carrying the worker id into a worker process.
pub const WORKER_ID_ENV: &str = "RESUMABLE_INFER_WORKER_ID";

/// How long idle workers get to exit on their own before being killed.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkUnit>>>;

/// Command line that starts one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from an argv-style list (`["prog", "arg", ...]`).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args.to_vec()))
    }

    fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Worker pool backed by child processes speaking the JSON-lines protocol.
pub struct ProcessPool {
    /// Job queue sender; dropped on shutdown so idle workers exit
    jobs: Option<mpsc::UnboundedSender<WorkUnit>>,
    /// Results from all workers, in completion order
    results: mpsc::UnboundedReceiver<UnitResult>,
    /// One driver task per worker process
    drivers: Vec<JoinHandle<()>>,
    /// Pool size
    workers: usize,
}

struct Spawned {
    worker_id: usize,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl ProcessPool {
    /// Spawn `workers` processes and wait for each one's ready handshake.
    pub async fn start(workers: usize, command: &WorkerCommand) -> Result<Self> {
        let workers = workers.max(1);

        // Spawn everything first so models load in parallel
        let mut spawned = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            spawned.push(spawn_worker(worker_id, command)?);
        }

        for worker in &mut spawned {
            match read_line::<_, WorkerMessage>(&mut worker.lines).await {
                Ok(Some(WorkerMessage::Ready { pid, .. })) => {
                    debug!(worker_id = worker.worker_id, pid, "Worker process ready");
                }
                Ok(Some(WorkerMessage::LoadFailed { error })) => {
                    return Err(EngineError::ModelLoad {
                        worker_id: worker.worker_id,
                        source: error,
                    });
                }
                Ok(Some(other)) => {
                    return Err(EngineError::Internal(format!(
                        "unexpected handshake from worker {}: {other:?}",
                        worker.worker_id
                    )));
                }
                Ok(None) => {
                    return Err(EngineError::ModelLoad {
                        worker_id: worker.worker_id,
                        source: InferenceError::WorkerLost("exited before ready".into()),
                    });
                }
                Err(e) => {
                    return Err(EngineError::ParseError(format!(
                        "worker {} handshake: {e}",
                        worker.worker_id
                    )));
                }
            }
        }

        let (job_tx, job_rx) = mpsc::unbounded_channel::<WorkUnit>();
        let job_rx: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel::<UnitResult>();

        let drivers = spawned
            .into_iter()
            .map(|worker| {
                tokio::spawn(drive_worker(worker, Arc::clone(&job_rx), result_tx.clone()))
            })
            .collect();

        info!(workers, command = %command.display(), "Worker processes started");
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            drivers,
            workers,
        })
    }
}

fn spawn_worker(worker_id: usize, command: &WorkerCommand) -> Result<Spawned> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env(WORKER_ID_ENV, worker_id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| EngineError::WorkerSpawn {
        command: command.display(),
        source,
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Internal("worker stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Internal("worker stdout not captured".into()))?;

    Ok(Spawned {
        worker_id,
        child,
        stdin,
        lines: BufReader::new(stdout).lines(),
    })
}

/// Feed units to one worker process until the queue closes or the worker dies.
async fn drive_worker(
    mut worker: Spawned,
    jobs: JobQueue,
    results: mpsc::UnboundedSender<UnitResult>,
) {
    loop {
        let next = jobs.lock().await.recv().await;
        let Some(work) = next else {
            break;
        };
        let index = work.index;

        let reply = match write_line(&mut worker.stdin, &work).await {
            Ok(()) => read_line::<_, WorkerMessage>(&mut worker.lines).await,
            Err(e) => Err(e),
        };

        let (result, alive) = match reply {
            Ok(Some(WorkerMessage::Result { result })) if result.index == index => (result, true),
            Ok(Some(other)) => (
                UnitResult::failure(
                    index,
                    InferenceError::WorkerLost(format!("protocol violation: {other:?}")),
                ),
                false,
            ),
            Ok(None) => (
                UnitResult::failure(index, InferenceError::WorkerLost("worker exited".into())),
                false,
            ),
            Err(e) => (
                UnitResult::failure(index, InferenceError::WorkerLost(e.to_string())),
                false,
            ),
        };

        if !alive {
            warn!(worker_id = worker.worker_id, index, "Worker process lost, retiring it");
        }
        if results.send(result).is_err() || !alive {
            break;
        }
    }

    // Closing stdin lets a healthy worker finish and exit on its own
    let Spawned {
        worker_id,
        mut child,
        stdin,
        ..
    } = worker;
    drop(stdin);
    match child.wait().await {
        Ok(status) => debug!(worker_id, %status, "Worker process exited"),
        Err(e) => warn!(worker_id, error = %e, "Failed to reap worker process"),
    }
}

#[async_trait]
impl ExecutionPool for ProcessPool {
    fn capacity(&self) -> usize {
        self.workers
    }

    async fn submit(&mut self, unit: WorkUnit) -> Result<()> {
        let jobs = self.jobs.as_ref().ok_or(EngineError::ChannelClosed)?;
        jobs.send(unit).map_err(|_| EngineError::ChannelClosed)
    }

    async fn next_result(&mut self) -> Option<UnitResult> {
        self.results.recv().await
    }

    async fn shutdown(&mut self) {
        self.jobs.take();
        self.results.close();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
        for driver in self.drivers.drain(..) {
            let abort = driver.abort_handle();
            if tokio::time::timeout_at(deadline, driver).await.is_err() {
                // Dropping the driver drops its Child, which kills the process
                abort.abort();
            }
        }
        debug!("Worker processes shut down");
    }
}
