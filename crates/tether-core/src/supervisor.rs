//! Background task supervision for one connection.
//!
//! Every task is a spawned tokio task wrapped in a supervisor future that:
//! 1. races the activity against the task's [`CancellationToken`]
//! 2. turns errors and panics into a [`TaskError`]
//! 3. runs the caller's completion callback, if any
//! 4. runs the failure observer exactly once
//!
//! At most one live task exists per identifier. Starting a task under a busy
//! identifier cancels the previous one with [`CancelReason::DuplicateStart`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::{BoxError, TaskError};

/// How a supervised task ended.
pub type TaskOutcome = Result<(), TaskError>;

/// Hook invoked with the task id for failures (and, optionally, cancellations).
pub type TaskErrorHook = Arc<dyn Fn(&str, &TaskError) + Send + Sync>;

/// Completion callback registered by the caller of [`TaskSupervisor::start_task`].
pub type DoneCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;

/// Why a task was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// A new task was started under the same identifier.
    DuplicateStart,
    /// The connection is being torn down.
    ConnectionClosed,
    /// The task was cancelled individually.
    Requested,
}

impl CancelReason {
    /// Stable tag for logs and observers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuplicateStart => "task-duplicate-started",
            Self::ConnectionClosed => "task-websocket-closed",
            Self::Requested => "task-cancelled",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TaskEntry {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    handle: JoinHandle<()>,
}

impl TaskEntry {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    /// First reason wins; later requests only re-signal the token.
    fn cancel(&self, reason: CancelReason) -> bool {
        if !self.is_live() {
            return false;
        }
        let _ = self.reason.set(reason);
        self.token.cancel();
        true
    }
}

/// Owns the background tasks of one connection.
pub struct TaskSupervisor {
    tasks: Mutex<IndexMap<String, TaskEntry>>,
    error_hook: TaskErrorHook,
    process_cancel_errors: bool,
}

impl TaskSupervisor {
    /// Create a supervisor that reports failures to `error_hook`.
    pub fn new(error_hook: TaskErrorHook) -> Self {
        Self {
            tasks: Mutex::new(IndexMap::new()),
            error_hook,
            process_cancel_errors: false,
        }
    }

    /// Create a supervisor that logs failures with [`log_task_error`].
    pub fn logging() -> Self {
        Self::new(Arc::new(log_task_error))
    }

    /// Also report cancellations to the error hook.
    #[must_use]
    pub fn with_cancel_errors(mut self, enabled: bool) -> Self {
        self.process_cancel_errors = enabled;
        self
    }

    /// Whether cancellations are reported to the error hook.
    pub fn processes_cancel_errors(&self) -> bool {
        self.process_cancel_errors
    }

    /// Spawn `activity` under `task_id`.
    ///
    /// A live task already registered under `task_id` is cancelled first.
    /// `on_done` runs with the outcome before the failure observer.
    pub fn start_task<F, E>(
        &self,
        task_id: impl Into<String>,
        activity: F,
        on_done: Option<DoneCallback>,
    ) where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let task_id = task_id.into();
        let mut tasks = self.tasks.lock();

        if let Some(previous) = tasks.get(&task_id) {
            if previous.cancel(CancelReason::DuplicateStart) {
                debug!(task_id = %task_id, "cancelled previous task with the same id");
            }
        }

        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let activity = async move { activity.await.map_err(|e| TaskError::Failed(e.into())) };
        let handle = tokio::spawn(supervise(
            task_id.clone(),
            activity,
            token.clone(),
            Arc::clone(&reason),
            on_done,
            Arc::clone(&self.error_hook),
            self.process_cancel_errors,
        ));

        debug!(task_id = %task_id, "task started");
        let _ = tasks.insert(
            task_id,
            TaskEntry {
                token,
                reason,
                handle,
            },
        );
    }

    /// Cancel the live task under `task_id`.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .get(task_id)
            .is_some_and(|entry| entry.cancel(CancelReason::Requested))
    }

    /// Request cancellation of every live task without waiting for them.
    ///
    /// Returns how many tasks were signalled.
    pub fn cancel_all(&self) -> usize {
        self.tasks
            .lock()
            .values()
            .filter(|entry| entry.cancel(CancelReason::ConnectionClosed))
            .count()
    }

    /// Whether a live task is registered under `task_id`.
    pub fn is_active(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .get(task_id)
            .is_some_and(TaskEntry::is_live)
    }

    /// Number of live tasks.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().values().filter(|e| e.is_live()).count()
    }

    /// Registered identifiers in insertion order, finished tasks included.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Cancel everything and wait up to `timeout` for the tasks to finish.
    ///
    /// Finished entries are removed. Returns `false` on timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            for entry in tasks.values() {
                let _ = entry.cancel(CancelReason::ConnectionClosed);
            }
            tasks.drain(..).map(|(_, entry)| entry.handle).collect()
        };

        let drained = tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_ok();
        if !drained {
            debug!(?timeout, "task shutdown timed out");
        }
        drained
    }
}

impl fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("tasks", &self.task_ids())
            .field("process_cancel_errors", &self.process_cancel_errors)
            .finish_non_exhaustive()
    }
}

async fn supervise<F>(
    task_id: String,
    activity: F,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    on_done: Option<DoneCallback>,
    error_hook: TaskErrorHook,
    process_cancel_errors: bool,
) where
    F: Future<Output = TaskOutcome> + Send,
{
    let outcome = tokio::select! {
        biased;
        () = token.cancelled() => {
            let reason = reason.get().copied().unwrap_or(CancelReason::Requested);
            Err(TaskError::Cancelled(reason))
        }
        result = AssertUnwindSafe(activity).catch_unwind() => match result {
            Ok(outcome) => outcome,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        },
    };

    if let Some(on_done) = on_done {
        if std::panic::catch_unwind(AssertUnwindSafe(|| on_done(&outcome))).is_err() {
            error!(task_id = %task_id, "task completion callback panicked");
        }
    }

    observe(&task_id, &outcome, &error_hook, process_cancel_errors);
}

/// Route a finished task's outcome to the error hook.
///
/// Failures and panics always reach the hook. Cancellations only do when
/// `process_cancel_errors` is set.
pub fn observe(
    task_id: &str,
    outcome: &TaskOutcome,
    error_hook: &TaskErrorHook,
    process_cancel_errors: bool,
) {
    match outcome {
        Ok(()) => debug!(task_id, "task completed"),
        Err(TaskError::Cancelled(reason)) if !process_cancel_errors => {
            debug!(task_id, %reason, "task cancelled");
        }
        Err(err) => error_hook(task_id, err),
    }
}

/// Default task error hook: log the failure with its full detail.
pub fn log_task_error(task_id: &str, err: &TaskError) {
    let mut chain = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    error!(task_id, error = %err, detail = ?err, causes = ?chain, "background task failed");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
