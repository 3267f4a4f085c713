//! JobKeeper: A Periodic Job Scheduler for Tokio
//!
//! Runs named jobs over and over: each [`JobScheduler`] owns one job, decides
//! when it runs next, retries failed runs with a backoff policy, and publishes
//! every step of its lifecycle as an ordered stream of [`JobEvent`]s.
//!
//! # Features
//!
//! - Pluggable "when to run next" policies via [`ActivityScheduler`]
//!   ([`ConstIntervalScheduler`] or any closure).
//! - Retry policies via [`Backoff`]: stop, zero, constant, exponential, max-retries.
//! - Pause/resume with [`JobScheduler::enable`]; disabling cancels the running job.
//! - Cancellation is neutral: an interrupted run resets the backoff instead of
//!   counting as a failure.
//! - Ordered lifecycle events through an observer bus ([`Subject`], [`Observer`]);
//!   observers see a run's `JobFinished` before the next run is planned.
//! - A task manager ([`LocalTaskManager`]) that joins tasks sharing an id instead of
//!   running them twice.
//! - Integrates with `tracing`: every scheduler logs inside its own span, and
//!   [`tracing_observer`] forwards events to your subscriber.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use jobkeeper::{
//!   activity::ConstIntervalScheduler, backoff::ExponentialBackoff, tracing_observer, AppContext,
//!   JobScheduler, LocalTaskManager, SimpleTask, TaskError, TaskValue,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("info,jobkeeper=debug").init();
//!
//!     let ctx = AppContext::new().with_task_manager(Arc::new(LocalTaskManager::new()?));
//!
//!     let scheduler = JobScheduler::builder("refresh-cache")
//!         .activity(ConstIntervalScheduler::new(Duration::from_secs(30)))
//!         .backoff(ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(60)))
//!         .task_factory(|token| {
//!             let task = SimpleTask::new("refresh cache", move |_args| async move {
//!                 if token.is_cancelled() {
//!                     return Err(TaskError::Cancelled);
//!                 }
//!                 // ... do the work ...
//!                 Ok(vec![TaskValue::new(42u64)])
//!             });
//!             Ok((task.boxed(), vec![]))
//!         })
//!         .build(&ctx)?;
//!
//!     scheduler.subject().attach(&[tracing_observer()]);
//!     scheduler.schedule();
//!     scheduler.enable(true);
//!
//!     tokio::time::sleep(Duration::from_secs(120)).await;
//!     scheduler.close();
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`JobSchedulerBuilder`] (or a [`JobSchedulerConfig`]) to configure a scheduler:
//! - `activity`: when successful runs repeat (required).
//! - `task_factory`: creates the task of each run from the run's cancellation token (required).
//! - `backoff`: retry policy after failures. Defaults to [`StopBackoff`](backoff::StopBackoff).
//! - `task_manager` / `task_manager_provider`: where runs execute. Defaults to the
//!   manager registered on the [`AppContext`].
//! - `min_delay`: floor for every computed sleep (one second by default).
//!
//! # Job Lifecycle
//!
//! - `schedule()` arms the first run; nothing runs until the scheduler is also enabled.
//! - Successful (or cancelled) runs are followed by the next activation of the
//!   activity scheduler; failed runs by the next backoff delay.
//! - A factory error, a missing task manager, or an exhausted backoff stop the
//!   scheduler for good with a `SchedulerStop` event.
//! - `close()` (or dropping the scheduler) publishes `SchedulerClosed`, cancels
//!   the running job, and ends all activity.

// Declare modules within the crate
pub mod activity;
pub mod backoff;
pub mod context;
pub mod error;
pub mod job;
pub mod observer;
pub mod scheduler;
pub mod task;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{JobScheduler, JobSchedulerBuilder, JobSchedulerConfig, DEFAULT_MIN_DELAY};

// Policies
pub use activity::{ActivityScheduler, ConstIntervalScheduler};
pub use backoff::Backoff;

// Error types
pub use error::{BuildError, StopReason, TaskError};

// Events
pub use job::{
  subscribe_on_all_events, tracing_observer, JobEvent, JobEventKind, JobFinished, JobResult,
  TaskFactory, TaskManagerProvider,
};
pub use observer::{Event, EventSource, Observer, Subject};

// Tasks
pub use context::{AppContext, AppIdentity};
pub use task::manager::{LocalTaskManager, TaskControl, TaskManager, TaskOutcome, TaskState, TaskStatus};
pub use task::{CancelHandle, CancellableTask, SimpleTask, Task, TaskValue};

/// Installs a `tracing_subscriber` formatter honouring `RUST_LOG`, defaulting
/// to `info,jobkeeper=debug`. Does nothing if a global subscriber is already set.
#[cfg(feature = "tracing_setup")]
pub fn init_tracing() {
  use tracing_subscriber::EnvFilter;

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,jobkeeper=debug"));
  let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
