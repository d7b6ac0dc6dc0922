//! Run orchestration: load, filter, dispatch, persist, report.
//!
//! An [`InferenceEngine`] owns one [`StatusReporter`] and one
//! [`CancellationSignal`]. [`InferenceEngine::start`] spawns a run and hands
//! back a [`RunHandle`] that can be awaited, polled, subscribed to or stopped.

pub mod cancel;
pub mod config;
pub mod scheduler;
pub mod status;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::checkpoint::{scan_completed, CheckpointError, SUFFIX_FIELD};
use crate::fingerprint::fingerprint;
use crate::gateway::{Completer, OpenAiCompatAdapter, ProviderError, StreamingGateway};
use crate::prompts::format_output;
use crate::sink::{JsonlResultSink, ResultSink, SinkError};
use crate::task::{load_tasks, TaskLoadError, TaskRecord};

pub use cancel::CancellationSignal;
pub use config::{ConfigError, RunConfig, RunMode, Variant};
pub use scheduler::{CompletionStream, Scheduler, TaskOutcome};
pub use status::{RunPhase, RunStatus, StatusReporter};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Tasks(#[from] TaskLoadError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("engine worker failed: {0}")]
    Join(String),
}

/// What one dispatched task produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// The record with its output fields attached, ready to append.
    Completed(Value),
    /// A variant came back empty after every retry. The task stays unresolved.
    Unusable { field: &'static str },
}

/// Drives runs; at most one run per engine is active at a time.
pub struct InferenceEngine {
    reporter: Arc<StatusReporter>,
    cancel: CancellationSignal,
    completer: Option<Arc<dyn Completer>>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceEngine {
    pub fn new() -> Self {
        Self {
            reporter: Arc::new(StatusReporter::new()),
            cancel: CancellationSignal::new(),
            completer: None,
            sink: None,
        }
    }

    /// Use `completer` instead of building an HTTP gateway from each config.
    pub fn with_completer(mut self, completer: Arc<dyn Completer>) -> Self {
        self.completer = Some(completer);
        self
    }

    /// Append results through `sink` instead of a [`JsonlResultSink`] on the
    /// configured output path. The checkpoint is still read from, and the
    /// lock still taken on, that path.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn status(&self) -> RunStatus {
        self.reporter.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.reporter.subscribe()
    }

    /// Request cooperative cancellation of the active run.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Begin a run in the background.
    ///
    /// Fails with [`EngineError::AlreadyRunning`] while another run on this
    /// engine is `running`. Every other failure is reported through the run's
    /// status as phase `error`.
    pub fn start(&self, config: RunConfig) -> Result<RunHandle, EngineError> {
        let current_file = config.input_path.display().to_string();
        let run_id = self
            .reporter
            .begin(current_file)
            .ok_or(EngineError::AlreadyRunning)?;
        self.cancel.reset();

        let ctx = RunContext {
            run_id,
            reporter: self.reporter.clone(),
            cancel: self.cancel.clone(),
            completer: self.completer.clone(),
            sink: self.sink.clone(),
        };
        let join = tokio::spawn(ctx.execute(config));

        Ok(RunHandle {
            run_id,
            join,
            status: self.reporter.subscribe(),
            cancel: self.cancel.clone(),
        })
    }

    /// Start a run and wait for its terminal status.
    pub async fn run(&self, config: RunConfig) -> Result<RunStatus, EngineError> {
        self.start(config)?.wait().await
    }
}

/// Handle to one background run.
pub struct RunHandle {
    run_id: Uuid,
    join: JoinHandle<RunStatus>,
    status: watch::Receiver<RunStatus>,
    cancel: CancellationSignal,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal phase.
    pub async fn wait(self) -> Result<RunStatus, EngineError> {
        self.join.await.map_err(|e| EngineError::Join(e.to_string()))
    }

    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status mutation.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// A detached stop switch, e.g. for a signal handler.
    pub fn stopper(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    /// Snapshot now and then once per `period`; ends after the first terminal
    /// snapshot.
    pub fn poll_interval(&self, period: Duration) -> impl Stream<Item = RunStatus> + Send + 'static {
        let period = period.max(Duration::from_millis(1));
        let state: (watch::Receiver<RunStatus>, Option<Interval>, bool) =
            (self.status.clone(), None, false);
        futures::stream::unfold(state, move |(rx, ticker, done)| async move {
            if done {
                return None;
            }
            let mut ticker = ticker.unwrap_or_else(|| {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            ticker.tick().await;
            let snapshot = rx.borrow().clone();
            let done = snapshot.phase.is_terminal();
            Some((snapshot, (rx, Some(ticker), done)))
        })
    }
}

/// Build the HTTP-backed gateway described by `config`.
pub fn build_gateway(
    config: &RunConfig,
) -> Result<StreamingGateway<OpenAiCompatAdapter>, EngineError> {
    config.validate_credentials()?;
    let adapter =
        OpenAiCompatAdapter::with_config(config.api_key.trim(), &config.base_url, config.timeout())?;
    Ok(StreamingGateway::new(adapter, &config.model)
        .with_policy(config.retry_policy())
        .with_temperature(config.temperature))
}

/// Run every variant of `mode` for one task, one call at a time.
pub async fn process_task(
    completer: &dyn Completer,
    mode: &RunMode,
    task: TaskRecord,
) -> TaskResult {
    let mut outputs = Vec::new();
    for variant in mode.variants() {
        let (instruction, input) = match variant.template {
            Some(template) => template.render(task.instruction(), task.input()),
            None => (task.instruction().to_string(), task.input().to_string()),
        };
        let completion = completer.complete(&instruction, &input).await;
        if !completion.is_usable() {
            return TaskResult::Unusable {
                field: variant.field,
            };
        }
        outputs.push((variant.field, format_output(&completion)));
    }
    TaskResult::Completed(task.into_output(outputs))
}

struct RunContext {
    run_id: Uuid,
    reporter: Arc<StatusReporter>,
    cancel: CancellationSignal,
    completer: Option<Arc<dyn Completer>>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl RunContext {
    async fn execute(self, config: RunConfig) -> RunStatus {
        if let Err(e) = self.drive(&config).await {
            tracing::error!(run_id = %self.run_id, error = %e, "Run failed");
            self.reporter.fail(e.to_string());
        }
        let status = self.reporter.snapshot();
        tracing::info!(
            run_id = %self.run_id,
            phase = status.phase.as_str(),
            total = status.total,
            written = status.written,
            failed = status.failed,
            skipped = status.skipped,
            "Run finished"
        );
        status
    }

    async fn drive(&self, config: &RunConfig) -> Result<(), EngineError> {
        config.validate()?;
        let completer: Arc<dyn Completer> = match &self.completer {
            Some(completer) => completer.clone(),
            None => Arc::new(build_gateway(config)?),
        };
        let suffix = config.effective_suffix();

        let input_path = config.input_path.clone();
        let output_path = config.output_path.clone();
        let scan_suffix = suffix.clone();
        let (loaded, checkpoint) = tokio::task::spawn_blocking(move || {
            let loaded = load_tasks(&input_path)?;
            let checkpoint = scan_completed(&output_path, &scan_suffix)?;
            Ok::<_, EngineError>((loaded, checkpoint))
        })
        .await
        .map_err(|e| EngineError::Join(e.to_string()))??;

        let total = loaded.tasks.len();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let (mut empty, mut done, mut duplicate) = (0usize, 0usize, 0usize);
        for task in loaded.tasks {
            if !task.is_dispatchable() {
                empty += 1;
                tracing::debug!("Skipping task with empty instruction and input");
                continue;
            }
            let fp = fingerprint(&task, &suffix);
            if checkpoint.completed.contains(&fp) {
                done += 1;
            } else if !seen.insert(fp) {
                duplicate += 1;
            } else if suffix.is_empty() {
                pending.push(task.without_field(SUFFIX_FIELD));
            } else {
                pending.push(task.with_field(SUFFIX_FIELD, suffix.as_str()));
            }
        }
        self.reporter.set_totals(total, empty + done + duplicate);
        tracing::info!(
            run_id = %self.run_id,
            input = %config.input_path.display(),
            output = %config.output_path.display(),
            total,
            pending = pending.len(),
            already_done = done,
            duplicates = duplicate,
            empty,
            workers = config.workers,
            mode = config.mode.name(),
            suffix = %suffix,
            "Run starting"
        );

        let jsonl = JsonlResultSink::new(&config.output_path);
        let _lock = jsonl.lock_exclusive()?;
        let sink: Arc<dyn ResultSink> = match &self.sink {
            Some(sink) => sink.clone(),
            None => {
                jsonl.prepare()?;
                Arc::new(jsonl)
            }
        };

        let mode = Arc::new(config.mode.clone());
        let scheduler = Scheduler::new(config.workers);
        let mut stream = scheduler.run(
            pending,
            |task: TaskRecord| {
                let completer = completer.clone();
                let mode = mode.clone();
                async move { process_task(completer.as_ref(), &mode, task).await }
            },
            self.cancel.clone(),
        );

        while let Some(outcome) = stream.next().await {
            match outcome {
                TaskOutcome::Finished {
                    value: TaskResult::Completed(record),
                    index,
                } => self.persist(&sink, index, record).await,
                TaskOutcome::Finished {
                    value: TaskResult::Unusable { field },
                    index,
                } => {
                    tracing::warn!(run_id = %self.run_id, index, field, "No usable output; task left for resume");
                    self.reporter.record_failed();
                }
                TaskOutcome::Failed { index, error } => {
                    tracing::error!(run_id = %self.run_id, index = ?index, error = %error, "Task failed");
                    self.reporter.record_failed();
                }
            }
        }

        if stream.was_cancelled() {
            tracing::info!(run_id = %self.run_id, "Run stopped on request");
            self.reporter.finish(RunPhase::Stopped);
        } else {
            self.reporter.finish(RunPhase::Completed);
        }
        Ok(())
    }

    async fn persist(&self, sink: &Arc<dyn ResultSink>, index: usize, record: Value) {
        let writer = sink.clone();
        let line = record.clone();
        let appended = tokio::task::spawn_blocking(move || writer.append(&line))
            .await
            .map_err(|e| SinkError::Join(e.to_string()))
            .and_then(|r| r);
        match appended {
            Ok(()) => self.reporter.record_written(record),
            Err(e) => {
                tracing::error!(run_id = %self.run_id, index, error = %e, "Failed to append result");
                self.reporter.record_failed();
            }
        }
    }
}
