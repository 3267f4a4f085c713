use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while building a `JobScheduler` or a `LocalTaskManager`.
///
/// These are configuration errors: they are returned synchronously and are
/// never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("'TaskManager' is not provided")]
  MissingTaskManager,
  #[error("'ActivityScheduler' is not provided")]
  MissingActivityScheduler,
  #[error("'TaskFactory' is not provided")]
  MissingTaskFactory,
  #[error("Job identifier must not be empty")]
  EmptyJobId,
  #[error("No Tokio runtime is available to drive the scheduler")]
  NoRuntime,
}

/// Why a `JobScheduler` stopped for good.
///
/// Stop reasons are never returned from a method call; they are delivered
/// asynchronously inside a `SchedulerStop` event.
#[derive(Error, Debug, Clone)]
pub enum StopReason {
  /// The task factory failed to produce the next task.
  #[error("no 'Task' is provided any more: {0}")]
  NoTaskIsProvided(TaskError),
  /// The task manager accessor resolved to nothing.
  #[error("no any 'TaskManager' is provided")]
  NoTaskManager,
  /// The backoff policy signalled "stop".
  #[error("backoff is stopped")]
  BackoffStopped,
}

impl StopReason {
  /// A short, stable name for the reason, handy for metrics labels and assertions.
  pub fn name(&self) -> &'static str {
    match self {
      StopReason::NoTaskIsProvided(_) => "NoTaskIsProvided",
      StopReason::NoTaskManager => "NoTaskManager",
      StopReason::BackoffStopped => "BackoffStopped",
    }
  }
}

/// Shared, cloneable error source carried by `TaskError::Failed`.
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// Failure of a single task execution (or of its construction).
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  /// The task observed cancellation of its context (or was cancelled explicitly).
  #[error("task is cancelled")]
  Cancelled,
  /// The task ran and reported a failure.
  #[error("{0}")]
  Failed(SharedError),
  /// The task panicked while running.
  #[error("task panicked: {0}")]
  Panicked(String),
  /// The runtime dropped the task before it could finish (e.g. runtime shutdown).
  #[error("task was aborted before completion")]
  Aborted,
}

impl TaskError {
  /// Wraps any error type as a task failure.
  pub fn failed<E>(err: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    TaskError::Failed(Arc::new(err))
  }

  /// Builds a task failure from a plain message.
  pub fn msg(message: impl fmt::Display) -> Self {
    TaskError::Failed(Arc::new(Message(message.to_string())))
  }

  /// Cancellation is a neutral outcome, not a failure that counts against retries.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, TaskError::Cancelled)
  }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl StdError for Message {}
