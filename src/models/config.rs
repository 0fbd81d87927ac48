//! Configuration models for resumable-infer.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration.
///
/// I^R resolved: All configurable parameters are explicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Execution engine settings (workers, cadence, cancellation)
    #[serde(default)]
    pub engine: EngineConfig,

    /// Checkpoint location and identity
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Models run over the record set, in order (`[model]` or `[[model]]`)
    #[serde(rename = "model", deserialize_with = "one_or_many")]
    pub models: Vec<ModelConfig>,

    /// Record field mapping
    #[serde(default)]
    pub input: InputConfig,
}

/// How W > 1 workers are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Worker threads inside this process
    Threads,
    /// Independent worker processes, one model instance each
    #[default]
    Processes,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers (W). Each worker loads its own model.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Executor used when `workers > 1`
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Save a checkpoint after every K completed units
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// How long in-flight units may finish after an interrupt
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Minimum spacing between progress events
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Command line that starts a worker process (defaults to this binary's `worker` subcommand)
    #[serde(default)]
    pub worker_command: Option<Vec<String>>,
}

fn default_workers() -> usize {
    1
}

fn default_checkpoint_interval() -> usize {
    1000
}

fn default_grace_period() -> u64 {
    30
}

fn default_progress_interval() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            executor: ExecutorKind::default(),
            checkpoint_interval: default_checkpoint_interval(),
            grace_period_secs: default_grace_period(),
            progress_interval_ms: default_progress_interval(),
            worker_command: None,
        }
    }
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Candidate directories, probed in order. Empty means the built-in list
    /// (./checkpoints, ~/.resumable-infer/checkpoints, <tmp>/resumable-infer/checkpoints).
    #[serde(default)]
    pub dirs: Vec<PathBuf>,

    /// Checkpoint key override. Defaults to `<model id>-<record fingerprint>`;
    /// with several models the model id is appended to the override.
    #[serde(default)]
    pub key: Option<String>,
}

/// Accept a single `[model]` table or a `[[model]]` array.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<ModelConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Box<ModelConfig>),
        Many(Vec<ModelConfig>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(model) => vec![*model],
        OneOrMany::Many(models) => models,
    })
}

/// Model invocation configuration.
///
/// K_i: The model is an external program invoked once per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier (defaults to the file stem of `path`)
    #[serde(default)]
    pub id: Option<String>,

    /// Path to the on-disk model, substituted for `{model_path}`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Program to run per record (e.g. a llama.cpp CLI)
    pub program: String,

    /// Arguments; may contain `{model_path}`
    #[serde(default)]
    pub args: Vec<String>,

    /// Prompt template; `{input}` is replaced with the record's input field
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,

    /// Pass the prompt on stdin (true) or as the final argument (false)
    #[serde(default = "default_true")]
    pub stdin_prompt: bool,

    /// Per-record timeout in seconds (0 disables)
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Output column for this model (defaults to `pred_<model id>`)
    #[serde(default)]
    pub output_column: Option<String>,
}

impl ModelConfig {
    /// Model identifier: explicit `id`, else the model file stem, else the program name.
    pub fn model_id(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        let stem_of = |p: &Path| p.file_stem().map(|s| s.to_string_lossy().into_owned());
        self.path
            .as_deref()
            .and_then(stem_of)
            .or_else(|| stem_of(Path::new(&self.program)))
            .unwrap_or_else(|| "model".to_string())
    }
}

fn default_prompt_template() -> String {
    "{input}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_model_timeout() -> u64 {
    120
}

/// Record field mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Record field fed to the model
    #[serde(default = "default_input_field")]
    pub field: String,

    /// Output column when a single model is configured (defaults to `pred_<model id>`)
    #[serde(default)]
    pub output_column: Option<String>,
}

fn default_input_field() -> String {
    "text".to_string()
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            field: default_input_field(),
            output_column: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.expand_env();
        config.validate()?;
        Ok(config)
    }

    fn expand_env(&mut self) {
        for model in &mut self.models {
            model.program = expand_env_vars(&model.program);
            model.args = model.args.iter().map(|a| expand_env_vars(a)).collect();
            if let Some(path) = &model.path {
                model.path = Some(PathBuf::from(expand_env_vars(&path.to_string_lossy())));
            }
        }
        self.checkpoint.dirs = self
            .checkpoint
            .dirs
            .iter()
            .map(|d| PathBuf::from(expand_env_vars(&d.to_string_lossy())))
            .collect();
    }

    /// Check values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.workers == 0 {
            return Err(ConfigError::Invalid("engine.workers must be at least 1".into()));
        }
        if self.engine.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid(
                "engine.checkpoint_interval must be at least 1".into(),
            ));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Invalid("at least one [model] is required".into()));
        }
        let mut ids = HashSet::new();
        let mut columns = HashSet::new();
        for model in &self.models {
            let id = model.model_id();
            if model.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "model '{id}': program must not be empty"
                )));
            }
            if !ids.insert(id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "model id '{id}' is configured twice"
                )));
            }
            let column = self.output_column(model);
            if !columns.insert(column.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "output column '{column}' is used by more than one model"
                )));
            }
        }
        if self.input.field.trim().is_empty() {
            return Err(ConfigError::Invalid("input.field must not be empty".into()));
        }
        if let Some(cmd) = &self.engine.worker_command {
            if cmd.is_empty() {
                return Err(ConfigError::Invalid(
                    "engine.worker_command must not be an empty list".into(),
                ));
            }
        }
        Ok(())
    }

    /// The model a worker process serves.
    pub fn model(&self, index: usize) -> Result<&ModelConfig, ConfigError> {
        self.models.get(index).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "model index {index} out of range ({} configured)",
                self.models.len()
            ))
        })
    }

    /// Explicit checkpoint key for a model, if one is configured.
    ///
    /// `None` means the key is derived from the model and the record set
    /// (see `RunIdentity::resolve`).
    pub fn checkpoint_key(&self, model: &ModelConfig) -> Option<String> {
        let key = self.checkpoint.key.as_ref()?;
        if self.models.len() > 1 {
            Some(format!("{key}-{}", model.model_id()))
        } else {
            Some(key.clone())
        }
    }

    /// Name of the column a model's predictions are written to.
    pub fn output_column(&self, model: &ModelConfig) -> String {
        let single = self.models.len() == 1;
        model
            .output_column
            .clone()
            .or_else(|| self.input.output_column.clone().filter(|_| single))
            .unwrap_or_else(|| format!("pred_{}", model.model_id()))
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }
    result
}

/// Configuration errors.
///
/// Epistemic origin:
/// - B_i falsified: File not found, parse error
/// - I^B materialized: Values that make a run meaningless
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
