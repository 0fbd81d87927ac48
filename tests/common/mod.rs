//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use resumable_infer::models::{InferenceError, Prediction};
use resumable_infer::{InferenceFactory, InferenceUnit, Record};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Scripted model: uppercases `text`, counting calls per index.
///
/// Records carry their own index in `id` so calls can be attributed.
#[derive(Clone, Default)]
pub struct Scripted {
    calls: Arc<Mutex<Vec<usize>>>,
    loads: Arc<AtomicUsize>,
    fail_ids: Vec<usize>,
    delays: Vec<(usize, Duration)>,
    cancel_after: Option<(usize, CancellationToken)>,
    hooks: Vec<(usize, Hook)>,
    fail_load: bool,
}

impl Scripted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a backend error for these ids.
    pub fn failing(mut self, ids: &[usize]) -> Self {
        self.fail_ids = ids.to_vec();
        self
    }

    /// Sleep before answering for this id.
    pub fn delay(mut self, id: usize, delay: Duration) -> Self {
        self.delays.push((id, delay));
        self
    }

    /// Cancel `token` while processing this id (simulates Ctrl+C mid-run).
    pub fn cancel_after(mut self, id: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((id, token));
        self
    }

    /// Run `hook` on the worker before answering for this id.
    pub fn on(mut self, id: usize, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.push((id, Arc::new(hook)));
        self
    }

    pub fn fail_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Ids invoked so far, in call order.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, id: usize) -> usize {
        self.calls().iter().filter(|&&c| c == id).count()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> Arc<dyn InferenceFactory> {
        Arc::new(self.clone())
    }
}

impl InferenceFactory for Scripted {
    fn load(&self, worker_id: usize) -> Result<Box<dyn InferenceUnit>, InferenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load {
            return Err(InferenceError::Backend(format!(
                "cannot load model for worker {worker_id}"
            )));
        }
        Ok(Box::new(self.clone()))
    }
}

impl InferenceUnit for Scripted {
    fn infer(&mut self, record: &Record) -> Result<Prediction, InferenceError> {
        let id = record["id"].as_u64().unwrap_or(u64::MAX) as usize;
        self.calls.lock().unwrap().push(id);

        for (_, hook) in self.hooks.iter().filter(|(h, _)| *h == id) {
            hook();
        }
        if let Some((_, delay)) = self.delays.iter().find(|(d, _)| *d == id) {
            std::thread::sleep(*delay);
        }
        if let Some((at, token)) = &self.cancel_after {
            if *at == id {
                token.cancel();
            }
        }
        if self.fail_ids.contains(&id) {
            return Err(InferenceError::Backend(format!("model rejected record {id}")));
        }

        let text = record["text"]
            .as_str()
            .ok_or_else(|| InferenceError::MalformedRecord("missing text".into()))?;
        Ok(json!(text.to_uppercase()))
    }
}

/// `n` records `{id, text}` with text "a", "b", ...
pub fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let letter = (b'a' + (i % 26) as u8) as char;
            json!({ "id": i, "text": letter.to_string() })
        })
        .collect()
}

/// Expected predictions for `records(n)`.
pub fn expected(n: usize) -> Vec<Option<Prediction>> {
    records(n)
        .iter()
        .map(|r| Some(json!(r["text"].as_str().unwrap().to_uppercase())))
        .collect()
}
