//! Bounded-concurrency task pool that yields results in completion order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;

use super::cancel::CancellationSignal;

/// What became of one dispatched task.
#[derive(Debug)]
pub enum TaskOutcome<R> {
    Finished { index: usize, value: R },
    /// The task panicked or was lost by the runtime. `index` is `None` only in
    /// the latter case.
    Failed {
        index: Option<usize>,
        error: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    /// A concurrency of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Submit `tasks` up front and return a stream of their outcomes.
    ///
    /// At most `concurrency` futures produced by `process` exist at once.
    /// Nothing is dispatched until the stream is first polled.
    pub fn run<T, R, F, Fut>(
        &self,
        tasks: Vec<T>,
        process: F,
        cancel: CancellationSignal,
    ) -> CompletionStream<T, R, F>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        CompletionStream {
            pending: tasks.into_iter().enumerate(),
            in_flight: JoinSet::new(),
            process,
            concurrency: self.concurrency,
            cancel,
            cancelled: false,
        }
    }
}

pub struct CompletionStream<T, R, F> {
    pending: std::iter::Enumerate<std::vec::IntoIter<T>>,
    in_flight: JoinSet<(usize, Result<R, String>)>,
    process: F,
    concurrency: usize,
    cancel: CancellationSignal,
    cancelled: bool,
}

impl<T, R, F, Fut> CompletionStream<T, R, F>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    /// Next finished task, first-finished first.
    ///
    /// Returns `None` when every task has been drained, or as soon as the
    /// cancellation signal is observed. After cancellation no further task is
    /// dispatched, and tasks still in flight are detached: they run to
    /// completion in the background but their results are never yielded.
    pub async fn next(&mut self) -> Option<TaskOutcome<R>> {
        if self.cancelled {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.halt();
            return None;
        }
        self.fill();
        if self.in_flight.is_empty() {
            return None;
        }

        let cancel = self.cancel.clone();
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = self.in_flight.join_next() => joined,
        };

        let Some(joined) = joined else {
            self.halt();
            return None;
        };
        Some(match joined {
            Ok((index, Ok(value))) => TaskOutcome::Finished { index, value },
            Ok((index, Err(error))) => {
                tracing::error!(index, error = %error, "Task panicked");
                TaskOutcome::Failed {
                    index: Some(index),
                    error,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Task lost by runtime");
                TaskOutcome::Failed {
                    index: None,
                    error: e.to_string(),
                }
            }
        })
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Tasks not yet yielded: queued plus in flight.
    pub fn remaining(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn fill(&mut self) {
        while self.in_flight.len() < self.concurrency {
            let Some((index, task)) = self.pending.next() else {
                break;
            };
            let fut = (self.process)(task);
            self.in_flight.spawn(async move {
                let result = AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .map_err(panic_message);
                (index, result)
            });
        }
    }

    fn halt(&mut self) {
        let detached = self.in_flight.len();
        let dropped = self.pending.len();
        self.in_flight.detach_all();
        self.pending = Vec::new().into_iter().enumerate();
        self.cancelled = true;
        tracing::info!(detached, dropped, "Scheduler stopped");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
