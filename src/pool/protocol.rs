//! JSON-lines protocol between the dispatcher process and worker processes.
//!
//! Parent → worker: one `WorkUnit` per line on stdin.
//! Worker → parent: a `Ready` (or `LoadFailed`) handshake, then one `Result` per unit on stdout.
//! Logging in workers must go to stderr; stdout belongs to the protocol.

use crate::inference::{InferenceFactory, execute};
use crate::models::{EngineError, InferenceError, Result, UnitResult, WorkUnit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tracing::{debug, info};

/// Message sent by a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Model loaded, ready for units
    Ready { worker_id: usize, pid: u32 },
    /// Model could not be loaded; the worker exits after sending this
    LoadFailed { error: InferenceError },
    /// Outcome of one unit
    Result { result: UnitResult },
}

/// Write one message as a JSON line and flush.
pub async fn write_line<W, T>(out: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await
}

/// Read the next non-empty JSON line. `Ok(None)` on end of stream.
pub async fn read_line<R, T>(lines: &mut Lines<R>) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
    Ok(None)
}

/// Worker-process side of the protocol.
///
/// Loads one model through `factory`, then answers units until the input closes.
/// Returns the number of units served.
pub async fn serve<R, W>(
    factory: Arc<dyn InferenceFactory>,
    worker_id: usize,
    input: R,
    mut output: W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let load_factory = Arc::clone(&factory);
    let loaded = tokio::task::spawn_blocking(move || load_factory.load(worker_id))
        .await
        .map_err(|e| EngineError::Internal(format!("model load task failed: {e}")))?;

    let mut unit = match loaded {
        Ok(unit) => unit,
        Err(error) => {
            write_line(&mut output, &WorkerMessage::LoadFailed { error: error.clone() })
                .await
                .map_err(|e| EngineError::io("writing load failure", e))?;
            return Err(EngineError::ModelLoad {
                worker_id,
                source: error,
            });
        }
    };

    write_line(
        &mut output,
        &WorkerMessage::Ready {
            worker_id,
            pid: std::process::id(),
        },
    )
    .await
    .map_err(|e| EngineError::io("writing ready handshake", e))?;
    info!(worker_id, "Worker ready");

    let mut lines = input.lines();
    let mut served = 0usize;
    loop {
        let work: WorkUnit = match read_line(&mut lines).await {
            Ok(Some(work)) => work,
            Ok(None) => break,
            Err(e) => return Err(EngineError::ParseError(format!("bad work unit: {e}"))),
        };

        let (returned, result) = tokio::task::spawn_blocking(move || {
            let result = execute(unit.as_mut(), &work);
            (unit, result)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("inference task failed: {e}")))?;
        unit = returned;

        debug!(worker_id, index = result.index, "Unit served");
        write_line(&mut output, &WorkerMessage::Result { result })
            .await
            .map_err(|e| EngineError::io("writing unit result", e))?;
        served += 1;
    }

    info!(worker_id, served, "Worker input closed, exiting");
    Ok(served)
}
