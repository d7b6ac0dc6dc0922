#![forbid(unsafe_code)]

//! # distill-harness
//!
//! Resumable batch inference against streaming reasoning-model endpoints.
//!
//! Each task (`instruction` + `input`) is sent once to a chat completion
//! endpoint that streams a reasoning channel next to the answer channel. The
//! two are kept apart and written as
//! `<think>…</think> <answer>…</answer>` to an append-only JSONL log.
//! Because every record is fingerprinted by content, re-running against the
//! same log processes only what is still missing.
//!
//! The engine caps in-flight requests, retries transient failures with
//! backoff, and exposes live status plus cooperative cancellation through a
//! [`RunHandle`].

pub mod checkpoint;
pub mod engine;
pub mod fingerprint;
pub mod gateway;
pub mod prompts;
pub mod sink;
pub mod task;

pub use checkpoint::{load_completed, scan_completed, CheckpointError, CheckpointScan};
pub use engine::{
    build_gateway, process_task, CancellationSignal, ConfigError, EngineError, InferenceEngine,
    RunConfig, RunHandle, RunMode, RunPhase, RunStatus, Scheduler, StatusReporter, TaskOutcome,
    TaskResult,
};
pub use fingerprint::{fingerprint, fingerprint_fields, Fingerprint};
pub use gateway::{
    ChatStreamProvider, Completer, OpenAiCompatAdapter, ProviderError, RetryPolicy,
    StreamedCompletion, StreamingGateway,
};
pub use prompts::{format_output, PromptTemplate};
pub use sink::{JsonlResultSink, ResultSink, SinkError};
pub use task::{load_tasks, LoadedTasks, TaskLoadError, TaskRecord};
