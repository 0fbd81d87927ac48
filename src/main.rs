//! resumable-infer CLI - Resumable batch inference over JSONL records.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use resumable_infer::checkpoint::default_candidates;
use resumable_infer::dataset::{load_records, write_output};
use resumable_infer::engine::{AlignedResults, BarProgress, LogProgress, ProgressSink};
use resumable_infer::models::ModelConfig;
use resumable_infer::pool::{WORKER_ID_ENV, protocol};
use resumable_infer::{
    CheckpointStore, CommandInference, Config, Engine, EngineSettings, PoolStrategy, Record,
    RunIdentity, RunOutcome, WorkerCommand,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Conventional exit status for a run stopped by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "resumable-infer")]
#[command(version)]
#[command(about = "Resumable batch inference over tabular records with checkpointed workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run inference over a JSONL file, resuming from any matching checkpoint
    Run {
        /// Path to input records JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Path to output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of workers (overrides engine.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Save a checkpoint every K completions (overrides engine.checkpoint_interval)
        #[arg(long)]
        checkpoint_interval: Option<usize>,

        /// Checkpoint directory (overrides checkpoint.dirs)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Re-run records that failed in an earlier run
        #[arg(long)]
        retry_failed: bool,

        /// Log progress instead of drawing a progress bar
        #[arg(long)]
        no_progress_bar: bool,
    },

    /// Show checkpoint progress for an input file
    Status {
        /// Path to input records JSONL file
        #[arg(short, long)]
        input: PathBuf,

        /// Checkpoint directory (overrides checkpoint.dirs)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Delete the checkpoints of the configured models for an input file
    Clear {
        /// Input file the checkpoints belong to (not needed with checkpoint.key)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Checkpoint directory (overrides checkpoint.dirs)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },

    /// Serve work units on stdin/stdout (started by the process pool)
    #[command(hide = true)]
    Worker {
        /// Worker id assigned by the pool
        #[arg(long, env = WORKER_ID_ENV, default_value_t = 0)]
        id: usize,

        /// Index of the configured model to serve
        #[arg(long, default_value_t = 0)]
        model: usize,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stderr only: a worker's stdout carries the protocol
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a global tracing subscriber was already set");
    }
}

fn print_example_config() {
    let example = r#"# resumable-infer configuration file

[engine]
workers = 4
executor = "processes"      # or "threads"; ignored when workers = 1
checkpoint_interval = 1000  # save every K completed records
grace_period_secs = 30      # time in-flight records get after Ctrl+C
progress_interval_ms = 500
# worker_command = ["/usr/local/bin/resumable-infer", "--config", "config.toml", "worker"]

[checkpoint]
# dirs = ["./checkpoints", "/var/tmp/resumable-infer"]
# key = "nightly-run"       # defaults to <model id>-<input fingerprint>

[input]
field = "text"

# One [[model]] block per model; each adds its own output column
[[model]]
# id = "qwen-medical-q4km"  # defaults to the model file stem
path = "${MODEL_DIR}/qwen-medical-q4km.gguf"
program = "llama-cli"
args = ["-m", "{model_path}", "-n", "64", "--temp", "0", "-no-cnv"]
prompt_template = "Extract the lesion size in mm from this report:\n{input}\nSize:"
stdin_prompt = false
timeout_secs = 120
# output_column = "size_mm" # defaults to pred_<model id>

[[model]]
path = "${MODEL_DIR}/llama-medical-q4km.gguf"
program = "llama-cli"
args = ["-m", "{model_path}", "-n", "64", "--temp", "0", "-no-cnv"]
prompt_template = "Extract the lesion size in mm from this report:\n{input}\nSize:"
stdin_prompt = false
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn open_store(config: &Config, override_dir: Option<PathBuf>) -> CheckpointStore {
    let candidates = match override_dir {
        Some(dir) => vec![dir],
        None if !config.checkpoint.dirs.is_empty() => config.checkpoint.dirs.clone(),
        None => default_candidates(),
    };
    CheckpointStore::open(&candidates)
}

/// This binary's own `worker` subcommand, serving the model at `model_index`.
fn default_worker_command(
    config_path: &Path,
    verbose: bool,
    model_index: usize,
) -> Option<WorkerCommand> {
    let exe = std::env::current_exe().ok()?;
    let config_path = std::fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_owned());
    let mut args = vec![
        "--config".to_string(),
        config_path.to_string_lossy().into_owned(),
    ];
    if verbose {
        args.push("--verbose".to_string());
    }
    args.extend(["worker".to_string(), "--model".to_string(), model_index.to_string()]);
    Some(WorkerCommand::new(exe, args))
}

/// Checkpoint identity of a model run over `records`.
fn model_identity(config: &Config, model: &ModelConfig, records: &[Record]) -> RunIdentity {
    let key = config.checkpoint_key(model);
    RunIdentity::resolve(key.as_deref(), &model.model_id(), records)
}

fn print_summary(model: &str, column: &str, outcome: &RunOutcome) {
    let stats = &outcome.stats;
    if outcome.cancelled {
        println!("\n=== Inference Interrupted: {model} ===");
    } else {
        println!("\n=== Inference Complete: {model} ===");
    }
    println!("Records:     {}", stats.total_records);
    println!("Resumed:     {}", stats.resumed);
    println!("This run:    {}", stats.processed_this_run);
    println!("Succeeded:   {}", stats.succeeded);
    println!("Failed:      {}", stats.failed);
    println!("Incomplete:  {}", stats.incomplete);
    println!("Avg infer:   {:.2}s", stats.avg_infer_secs);
    println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
    println!("Runtime:     {:.1}s", stats.runtime_secs);
    println!("Column:      {column}");
    if stats.checkpoint_save_failures > 0 {
        println!(
            "Warning:     {} checkpoint saves failed; progress may not be resumable",
            stats.checkpoint_save_failures
        );
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            let strategy = PoolStrategy::select(
                &config.engine,
                default_worker_command(&cli.config, cli.verbose, 0),
            )
            .context("Invalid engine configuration")?;

            info!("Configuration is valid");
            info!("  Workers:     {} ({:?})", strategy.workers(), config.engine.executor);
            info!("  Checkpoint:  every {} records", config.engine.checkpoint_interval);
            for model in &config.models {
                info!("  Model:       {}", model.model_id());
                info!("    Program:   {}", model.program);
                info!("    Column:    {}", config.output_column(model));
            }
        }

        Commands::Worker { id, model } => {
            let config = load_config(&cli.config)?;
            let model = config.model(model)?;
            let factory = Arc::new(CommandInference::new(model, &config.input.field));

            // The parent decides when to stop by closing our stdin
            tokio::spawn(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    debug!("Ignoring interrupt in worker process");
                }
            });

            let served = protocol::serve(
                factory,
                id,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
            .with_context(|| format!("Worker {id} failed"))?;
            debug!(worker_id = id, served, "Worker exiting");
        }

        Commands::Status {
            input,
            checkpoint_dir,
        } => {
            let config = load_config(&cli.config)?;
            let records = load_records(&input)?;
            let store = open_store(&config, checkpoint_dir);

            for model in &config.models {
                let identity = model_identity(&config, model, &records);
                let Some(snapshot) = store.read(&identity.key)? else {
                    println!("No checkpoint for key {:?} in {:?}", identity.key, store.dir());
                    continue;
                };

                println!("\n=== Checkpoint Status ===");
                println!("Key:         {}", snapshot.key);
                println!("Model:       {}", snapshot.model_id);
                println!("Path:        {:?}", store.path_for(&snapshot.key));
                println!("Started:     {}", snapshot.started_at);
                println!("Saved:       {}", snapshot.saved_at);
                println!(
                    "Completed:   {}/{} ({:.1}%)",
                    snapshot.completed.len(),
                    snapshot.total_records,
                    snapshot.progress_percent()
                );
                println!("Failed:      {}", snapshot.failed_indices().len());
                println!("Infer time:  {:.1}s", snapshot.inference_secs);
                match snapshot.validate(&identity) {
                    Ok(()) => println!("Matches:     yes (next run resumes)"),
                    Err(e) => println!("Matches:     no ({e}); next run starts fresh"),
                }
            }
        }

        Commands::Clear {
            input,
            checkpoint_dir,
        } => {
            let config = load_config(&cli.config)?;
            let store = open_store(&config, checkpoint_dir);
            store.ensure_enabled()?;
            let records = match &input {
                Some(path) => Some(load_records(path)?),
                None => None,
            };

            for model in &config.models {
                let key = match (config.checkpoint_key(model), &records) {
                    (Some(key), _) => key,
                    (None, Some(records)) => model_identity(&config, model, records).key,
                    (None, None) => bail!(
                        "--input is required: checkpoint keys are derived from the input file \
                         unless checkpoint.key is set"
                    ),
                };
                store
                    .clear(&key)
                    .with_context(|| format!("Failed to clear checkpoint {key:?}"))?;
                println!("Cleared checkpoint {key:?} in {:?}", store.dir());
            }
        }

        Commands::Run {
            input,
            output,
            workers,
            checkpoint_interval,
            checkpoint_dir,
            retry_failed,
            no_progress_bar,
        } => {
            let mut config = load_config(&cli.config)?;

            // CLI overrides
            if let Some(workers) = workers {
                config.engine.workers = workers;
            }
            if let Some(interval) = checkpoint_interval {
                config.engine.checkpoint_interval = interval;
            }
            config.validate().context("Invalid configuration after CLI overrides")?;

            let records = load_records(&input)?;

            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, finishing in-flight records (Ctrl+C again to force)");
                    signal_token.cancel();
                    if tokio::signal::ctrl_c().await.is_ok() {
                        std::process::exit(i32::from(EXIT_INTERRUPTED));
                    }
                }
            });

            // One engine run per model; every column lands in a single output pass
            let mut columns: Vec<(String, AlignedResults)> = Vec::with_capacity(config.models.len());
            let mut interrupted = false;
            for (index, model) in config.models.iter().enumerate() {
                let model_id = model.model_id();
                let column = config.output_column(model);
                info!(
                    model = %model_id,
                    position = index + 1,
                    models = config.models.len(),
                    "Running model"
                );

                let strategy = PoolStrategy::select(
                    &config.engine,
                    default_worker_command(&cli.config, cli.verbose, index),
                )
                .context("Invalid engine configuration")?;
                let store = open_store(&config, checkpoint_dir.clone());
                let settings =
                    EngineSettings::from_config(&config, model).with_retry_failed(retry_failed);
                let progress: Arc<dyn ProgressSink> = if no_progress_bar {
                    Arc::new(LogProgress)
                } else {
                    Arc::new(BarProgress::new(records.len()))
                };
                let engine = Engine::new(settings, store, strategy).with_progress(progress);
                let factory = Arc::new(CommandInference::new(model, &config.input.field));

                let outcome = match engine.run(&records, factory, cancel.clone()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Keep the columns of models that already finished
                        if !columns.is_empty() {
                            write_output(&output, &records, &columns)?;
                        }
                        return Err(e).with_context(|| format!("Model {model_id} failed"));
                    }
                };
                print_summary(&model_id, &column, &outcome);
                interrupted |= outcome.cancelled;
                columns.push((column, outcome.results));
            }

            write_output(&output, &records, &columns)?;
            println!("\nOutput:      {output:?}");

            if interrupted {
                println!("Re-run the same command to resume.");
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
