//! In-process worker pool (W dedicated OS threads).
//!
//! Epistemic foundation:
//! - K_i: Each worker thread owns exactly one loaded model
//! - K_i: Workers pull from one shared queue → a free worker takes the next unit
//! - B_i: Model load may fail → reported before any unit is dispatched
//! - I^B: Inference blocks for seconds → runs off the async runtime

use super::ExecutionPool;
use crate::inference::{InferenceFactory, execute};
use crate::models::{EngineError, InferenceError, Result, UnitResult, WorkUnit};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<WorkUnit>>>;

/// Worker pool backed by threads in this process.
pub struct LocalPool {
    /// Job queue sender; dropped on shutdown so idle workers exit
    jobs: Option<mpsc::UnboundedSender<WorkUnit>>,
    /// Results from all workers, in completion order
    results: mpsc::UnboundedReceiver<UnitResult>,
    /// Pool size
    workers: usize,
}

impl LocalPool {
    /// Spawn `workers` threads and wait until every one has loaded its model.
    pub async fn start(workers: usize, factory: Arc<dyn InferenceFactory>) -> Result<Self> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = mpsc::unbounded_channel::<WorkUnit>();
        let job_rx: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel::<UnitResult>();

        let mut ready = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (ready_tx, ready_rx) = oneshot::channel();
            let factory = Arc::clone(&factory);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();

            std::thread::Builder::new()
                .name(format!("infer-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, factory, job_rx, result_tx, ready_tx))
                .map_err(|e| EngineError::io("spawning worker thread", e))?;
            ready.push((worker_id, ready_rx));
        }
        // Only workers hold result senders: the channel closes when the last one exits
        drop(result_tx);

        for (worker_id, ready_rx) in ready {
            match ready_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => return Err(EngineError::ModelLoad { worker_id, source }),
                Err(_) => {
                    return Err(EngineError::ModelLoad {
                        worker_id,
                        source: InferenceError::Panicked("worker exited while loading".into()),
                    });
                }
            }
        }

        debug!(workers, "Local worker pool ready");
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            workers,
        })
    }
}

fn worker_loop(
    worker_id: usize,
    factory: Arc<dyn InferenceFactory>,
    jobs: JobQueue,
    results: mpsc::UnboundedSender<UnitResult>,
    ready: oneshot::Sender<std::result::Result<(), InferenceError>>,
) {
    let mut unit = match factory.load(worker_id) {
        Ok(unit) => {
            let _ = ready.send(Ok(()));
            unit
        }
        Err(e) => {
            warn!(worker_id, error = %e, "Model load failed");
            let _ = ready.send(Err(e));
            return;
        }
    };

    loop {
        let next = {
            // A poisoned queue only means another worker panicked while waiting
            let mut queue = jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.blocking_recv()
        };
        let Some(work) = next else {
            break;
        };

        let result = execute(unit.as_mut(), &work);
        if results.send(result).is_err() {
            break;
        }
    }
    debug!(worker_id, "Worker thread exiting");
}

#[async_trait]
impl ExecutionPool for LocalPool {
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
        // Workers finish their current unit and exit; nobody waits for them.
        self.jobs.take();
        self.results.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceUnit;
    use crate::models::{Prediction, Record};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn sleepy_factory() -> Arc<dyn InferenceFactory> {
        Arc::new(
            |_: usize| -> std::result::Result<Box<dyn InferenceUnit>, InferenceError> {
                Ok(Box::new(
                    |record: &Record| -> std::result::Result<Prediction, InferenceError> {
                        let ms = record["sleep_ms"].as_u64().unwrap_or(0);
                        std::thread::sleep(Duration::from_millis(ms));
                        Ok(json!(record["id"].clone()))
                    },
                ))
            },
        )
    }

    #[tokio::test]
    async fn test_results_arrive_in_completion_order() {
        let mut pool = LocalPool::start(3, sleepy_factory()).await.unwrap();
        assert_eq!(pool.capacity(), 3);

        for (index, sleep_ms) in [(0usize, 300u64), (1, 150), (2, 0)] {
            pool.submit(WorkUnit {
                index,
                record: json!({ "id": index, "sleep_ms": sleep_ms }),
            })
            .await
            .unwrap();
        }

        let mut order = Vec::new();
        let mut values = BTreeMap::new();
        for _ in 0..3 {
            let result = pool.next_result().await.unwrap();
            order.push(result.index);
            values.insert(result.index, result.outcome.value().cloned());
        }
        assert_eq!(order, vec![2, 1, 0]);
        assert_eq!(values[&0], Some(json!(0)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_failure_is_fatal() {
        let factory: Arc<dyn InferenceFactory> = Arc::new(
            |worker_id: usize| -> std::result::Result<Box<dyn InferenceUnit>, InferenceError> {
                if worker_id == 1 {
                    Err(InferenceError::Backend("out of memory".into()))
                } else {
                    Ok(Box::new(
                        |_: &Record| -> std::result::Result<Prediction, InferenceError> {
                            Ok(json!(null))
                        },
                    ))
                }
            },
        );
        let result = LocalPool::start(2, factory).await;
        assert!(matches!(result, Err(EngineError::ModelLoad { worker_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let mut pool = LocalPool::start(1, sleepy_factory()).await.unwrap();
        pool.shutdown().await;
        let err = pool
            .submit(WorkUnit {
                index: 0,
                record: json!({}),
            })
            .await;
        assert!(matches!(err, Err(EngineError::ChannelClosed)));
    }
}
