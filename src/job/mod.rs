//! Job-level building blocks: lifecycle events and the machinery that runs a
//! single named job on its schedule.

pub mod events;
mod notify;
pub(crate) mod runner;
mod timer;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use crate::error::TaskError;
use crate::observer::Observer;
use crate::task::manager::TaskManager;
use crate::task::{Task, TaskValue};

pub use events::{tracing_observer, JobEvent, JobEventKind, JobFinished, JobId, JobResult};

/// Creates the task for the next run, together with its arguments.
///
/// The token is the run's context: it is cancelled when the run is disabled,
/// the scheduler closes, or the application shuts down. A factory error stops
/// the scheduler for good.
pub type TaskFactory = Arc<
  dyn Fn(CancellationToken) -> Result<(Box<dyn Task>, Vec<TaskValue>), TaskError>
    + Send
    + Sync
    + 'static,
>;

/// Resolves the task manager a run is handed to. `None` stops the scheduler.
pub type TaskManagerProvider =
  Arc<dyn Fn(&AppContext) -> Option<Arc<dyn TaskManager>> + Send + Sync + 'static>;

/// Subscribes `observer` to every job event kind.
pub fn subscribe_on_all_events(observer: &Observer<JobEvent>) {
  observer.subscribe(JobEventKind::ALL);
}
