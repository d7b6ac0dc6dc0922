//! Run state and the reporter that owns it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

/// Records kept for live preview.
pub const RECENT_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Stopped,
    Completed,
    Error,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Point-in-time snapshot of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub phase: RunPhase,
    /// Valid task records in the input.
    pub total: usize,
    /// Written + failed + skipped.
    pub processed: usize,
    pub written: usize,
    pub failed: usize,
    /// Already in the output log, duplicated within the input, or empty.
    pub skipped: usize,
    pub current_file: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Most recently written records, newest last.
    pub recent: VecDeque<Value>,
}

impl RunStatus {
    /// Tasks not yet accounted for.
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed)
    }
}

/// Sole writer of [`RunStatus`].
///
/// Every mutation happens under one mutex and is published to subscribers
/// before the lock is released, so no reader sees a half-applied update.
#[derive(Debug)]
pub struct StatusReporter {
    state: Mutex<RunStatus>,
    tx: watch::Sender<RunStatus>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunStatus::default());
        Self {
            state: Mutex::new(RunStatus::default()),
            tx,
        }
    }

    pub fn snapshot(&self) -> RunStatus {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.tx.subscribe()
    }

    /// Reset to a fresh `running` state. Returns `None` if a run is active.
    pub fn begin(&self, current_file: impl Into<String>) -> Option<Uuid> {
        let current_file = current_file.into();
        self.update(|state| {
            if state.phase == RunPhase::Running {
                return None;
            }
            let run_id = Uuid::new_v4();
            *state = RunStatus {
                run_id: Some(run_id),
                phase: RunPhase::Running,
                current_file: Some(current_file),
                started_at: Some(Utc::now()),
                ..RunStatus::default()
            };
            Some(run_id)
        })
    }

    /// Record the task count and how many of them were filtered out up front.
    pub fn set_totals(&self, total: usize, skipped: usize) {
        self.update(|state| {
            state.total = total;
            state.skipped = skipped;
            state.processed = skipped;
        });
    }

    pub fn record_written(&self, record: Value) {
        self.update(|state| {
            state.written += 1;
            state.processed += 1;
            if state.recent.len() == RECENT_CAPACITY {
                state.recent.pop_front();
            }
            state.recent.push_back(record);
        });
    }

    pub fn record_failed(&self) {
        self.update(|state| {
            state.failed += 1;
            state.processed += 1;
        });
    }

    /// Move a running run to a terminal phase. Terminal phases are sticky.
    pub fn finish(&self, phase: RunPhase) {
        self.update(|state| {
            if state.phase == RunPhase::Running && phase.is_terminal() {
                state.phase = phase;
                state.finished_at = Some(Utc::now());
            }
        });
    }

    /// Engine-level failure: record the error and enter `error`.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            if state.phase == RunPhase::Running {
                state.phase = RunPhase::Error;
                state.error = Some(message);
                state.finished_at = Some(Utc::now());
            }
        });
    }

    fn update<T>(&self, f: impl FnOnce(&mut RunStatus) -> T) -> T {
        let mut state = self.lock();
        let out = f(&mut state);
        self.tx.send_replace(state.clone());
        out
    }

    fn lock(&self) -> MutexGuard<'_, RunStatus> {
        // A panic mid-update leaves plain counters behind; keep serving them.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
