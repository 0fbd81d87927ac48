//! Model backend that invokes an external program once per record.
//!
//! Epistemic foundation:
//! - K_i: The prompt is the template with the record's input field substituted
//! - B_i: The program may fail or hang → Backend / Timeout
//! - I^R: Program, arguments, template, and timeout come from config

use super::{InferenceFactory, InferenceUnit};
use crate::models::{InferenceError, ModelConfig, Prediction, Record};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long the output pipes may stay open after the program exits.
/// A descendant that inherited them can hold them open indefinitely.
const PIPE_GRACE: Duration = Duration::from_secs(1);

/// Per-record invocation of a model program (e.g. a llama.cpp CLI).
#[derive(Debug, Clone)]
pub struct CommandInference {
    program: String,
    args: Vec<String>,
    model_path: Option<PathBuf>,
    prompt_template: String,
    input_field: String,
    stdin_prompt: bool,
    timeout: Option<Duration>,
}

impl CommandInference {
    pub fn new(model: &ModelConfig, input_field: impl Into<String>) -> Self {
        let model_path = model.path.clone();
        let path_str = model_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            program: model.program.clone(),
            args: model
                .args
                .iter()
                .map(|a| a.replace("{model_path}", &path_str))
                .collect(),
            model_path,
            prompt_template: model.prompt_template.clone(),
            input_field: input_field.into(),
            stdin_prompt: model.stdin_prompt,
            timeout: (model.timeout_secs > 0).then(|| Duration::from_secs(model.timeout_secs)),
        }
    }

    /// Override the per-record timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the prompt for a record.
    pub fn render_prompt(&self, record: &Record) -> Result<String, InferenceError> {
        let input = match record.get(&self.input_field) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => v.to_string(),
            Some(serde_json::Value::Null) | None => {
                return Err(InferenceError::MalformedRecord(format!(
                    "field '{}' is missing",
                    self.input_field
                )));
            }
            Some(_) => {
                return Err(InferenceError::MalformedRecord(format!(
                    "field '{}' is not a scalar",
                    self.input_field
                )));
            }
        };

        let model_path = self
            .model_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self
            .prompt_template
            .replace("{model_path}", &model_path)
            .replace("{input}", &input))
    }

    fn spawn(&self, prompt: &str) -> Result<Child, InferenceError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if !self.stdin_prompt {
            cmd.arg(prompt);
        }
        cmd.stdin(if self.stdin_prompt {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        cmd.spawn()
            .map_err(|e| InferenceError::Backend(format!("failed to start {}: {e}", self.program)))
    }

    /// Wait for the child, killing it once the deadline passes.
    fn wait(&self, child: &mut Child) -> Result<ExitStatus, InferenceError> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(InferenceError::Backend(format!("waiting for model: {e}"))),
            }
            if let (Some(deadline), Some(timeout)) = (deadline, self.timeout) {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InferenceError::Timeout(timeout));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Output read from a pipe, or nothing if it is still open at `deadline`.
fn collect(pipe: &Receiver<Vec<u8>>, name: &str, deadline: Instant) -> Vec<u8> {
    let wait = deadline.saturating_duration_since(Instant::now());
    match pipe.recv_timeout(wait) {
        Ok(buf) => buf,
        Err(_) => {
            warn!(pipe = name, "Model output pipe still open after exit, output discarded");
            Vec::new()
        }
    }
}

impl InferenceUnit for CommandInference {
    fn infer(&mut self, record: &Record) -> Result<Prediction, InferenceError> {
        let prompt = self.render_prompt(record)?;
        let mut child = self.spawn(&prompt)?;

        // Not joined: a descendant may keep stdin open without reading
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.clone();
            thread::spawn(move || {
                // Broken pipe just means the program stopped reading
                let _ = stdin.write_all(prompt.as_bytes());
            });
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child);
        let deadline = Instant::now() + PIPE_GRACE;
        let out = collect(&stdout, "stdout", deadline);
        let err = collect(&stderr, "stderr", deadline);
        let status = status?;

        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&err);
            let trimmed = stderr_text.trim();
            // Last 300 characters of stderr
            let tail = match trimmed.char_indices().rev().nth(299) {
                Some((i, _)) => &trimmed[i..],
                None => trimmed,
            };
            return Err(InferenceError::Backend(format!(
                "{} exited with {status}: {tail}",
                self.program
            )));
        }

        let text = String::from_utf8_lossy(&out).trim().to_string();
        debug!(bytes = out.len(), "Model call finished");
        Ok(Prediction::String(text))
    }
}

impl InferenceFactory for CommandInference {
    /// Each worker gets its own copy; a configured model file must exist.
    fn load(&self, worker_id: usize) -> Result<Box<dyn InferenceUnit>, InferenceError> {
        if let Some(path) = &self.model_path {
            if !path.exists() {
                return Err(InferenceError::Backend(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
        }
        debug!(worker_id, program = %self.program, "Model loaded for worker");
        Ok(Box::new(self.clone()))
    }
}
