#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use distill_harness::checkpoint::scan_completed;
use distill_harness::{InferenceEngine, PromptTemplate, RunConfig, RunMode, RunPhase, RunStatus};

const DEFAULT_LOG_FILTER: &str = "distill_harness=info,distill=info";

#[derive(Parser)]
#[command(name = "distill", version, about = "Resumable batch inference CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every unfinished task in a JSONL input
    Run(RunArgs),
    /// Report how many tasks an output log already covers
    Checkpoint {
        #[arg(long)]
        output: PathBuf,
        /// Fingerprint suffix the log was written with
        #[arg(long, default_value = "")]
        suffix: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Single,
    Compare,
    Distill,
}

#[derive(Args)]
struct RunArgs {
    /// JSON file with a full run configuration; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Defaults to DEEPSEEK_API_KEY
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    /// Per-attempt timeout
    #[arg(long)]
    timeout_seconds: Option<u64>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    retry_delay_ms: Option<u64>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// First template file (before / original)
    #[arg(long)]
    prompt_a: Option<PathBuf>,
    /// Second template file (after / optimized)
    #[arg(long)]
    prompt_b: Option<PathBuf>,
    /// Override the fingerprint suffix
    #[arg(long)]
    suffix: Option<String>,
    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_logging(args.log_file.as_deref())?;
            let config = build_config(&args)?;
            let status = run(config).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.phase == RunPhase::Error {
                let message = status.error.unwrap_or_else(|| "run failed".to_string());
                return Err(message.into());
            }
        }
        Commands::Checkpoint { output, suffix } => {
            init_logging(None)?;
            let scan = tokio::task::spawn_blocking(move || scan_completed(&output, &suffix))
                .await??;
            println!(
                "{} completed fingerprints ({} records, {} unreadable lines)",
                scan.completed.len(),
                scan.records,
                scan.skipped_lines
            );
        }
    }

    Ok(())
}

async fn run(config: RunConfig) -> Result<RunStatus, Box<dyn std::error::Error>> {
    eprintln!(
        "[distill] {} -> {} (model={}, workers={}, mode={})",
        config.input_path.display(),
        config.output_path.display(),
        config.model,
        config.workers,
        config.mode.name()
    );

    let engine = InferenceEngine::new();
    let handle = engine.start(config)?;

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[distill] stop requested; in-flight requests will be discarded");
            stopper.cancel();
        }
    });

    let mut progress = std::pin::pin!(handle.poll_interval(Duration::from_secs(1)));
    while let Some(status) = progress.next().await {
        eprintln!(
            "[distill] {} {}/{} written={} failed={} skipped={}",
            status.phase.as_str(),
            status.processed,
            status.total,
            status.written,
            status.failed,
            status.skipped
        );
    }

    Ok(handle.wait().await?)
}

fn build_config(args: &RunArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    config.apply_env()?;

    if let Some(input) = &args.input {
        config.input_path = input.clone();
    }
    if let Some(output) = &args.output {
        config.output_path = output.clone();
    }
    if let Some(key) = &args.api_key {
        config.api_key = key.clone();
    }
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(secs) = args.timeout_seconds {
        config.timeout_seconds = secs;
    }
    if let Some(t) = args.temperature {
        config.temperature = t;
    }
    if let Some(n) = args.max_attempts {
        config.max_attempts = n;
    }
    if let Some(ms) = args.retry_delay_ms {
        config.retry_base_delay_ms = ms;
    }
    if let Some(suffix) = &args.suffix {
        config.fingerprint_suffix = Some(suffix.clone());
    }

    match args.mode {
        None => {}
        Some(ModeArg::Single) => config.mode = RunMode::Single,
        Some(mode) => {
            let (Some(a), Some(b)) = (&args.prompt_a, &args.prompt_b) else {
                return Err("--mode compare/distill requires --prompt-a and --prompt-b".into());
            };
            let (a, b) = (read_template(a)?, read_template(b)?);
            config.mode = match mode {
                ModeArg::Compare => RunMode::Compare {
                    before: a,
                    after: b,
                },
                _ => RunMode::Distill {
                    original: a,
                    optimized: b,
                },
            };
        }
    }

    config.validate()?;
    Ok(config)
}

fn read_template(path: &Path) -> Result<PromptTemplate, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read template {}: {e}", path.display()))?;
    Ok(PromptTemplate::new(text.trim()))
}

fn init_logging(log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}
