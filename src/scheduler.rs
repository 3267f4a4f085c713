use crate::activity::ActivityScheduler;
use crate::backoff::{Backoff, StopBackoff};
use crate::context::AppContext;
use crate::error::{BuildError, StopReason, TaskError};
use crate::job::events::JobEvent;
use crate::job::runner::{JobRunner, RunnerParts};
use crate::job::{TaskFactory, TaskManagerProvider};
use crate::observer::EventSource;
use crate::task::manager::TaskManager;
use crate::task::{Task, TaskValue};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Floor applied to every computed sleep, so a job never spins.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Everything a [`JobScheduler`] is made of. Immutable once the scheduler is built.
///
/// `activity` and `task_factory` are mandatory. Without a `backoff` the
/// scheduler stops at the first failed run. Without a `task_manager` provider
/// the manager registered on the [`AppContext`] is used.
pub struct JobSchedulerConfig {
  pub job_id: String,
  pub activity: Option<Arc<dyn ActivityScheduler>>,
  pub backoff: Option<Box<dyn Backoff>>,
  pub task_factory: Option<TaskFactory>,
  pub task_manager: Option<TaskManagerProvider>,
  pub min_delay: Duration,
}

impl Default for JobSchedulerConfig {
  fn default() -> Self {
    Self {
      job_id: String::new(),
      activity: None,
      backoff: None,
      task_factory: None,
      task_manager: None,
      min_delay: DEFAULT_MIN_DELAY,
    }
  }
}

impl fmt::Debug for JobSchedulerConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobSchedulerConfig")
      .field("job_id", &self.job_id)
      .field("activity", &self.activity.is_some())
      .field("backoff", &self.backoff.is_some())
      .field("task_factory", &self.task_factory.is_some())
      .field("task_manager", &self.task_manager.is_some())
      .field("min_delay", &self.min_delay)
      .finish()
  }
}

/// Builder for configuring and creating a [`JobScheduler`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use jobkeeper::{
///   activity::ConstIntervalScheduler, backoff::ExponentialBackoff, AppContext, JobScheduler,
///   LocalTaskManager, SimpleTask,
/// };
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let ctx = AppContext::new().with_task_manager(Arc::new(LocalTaskManager::new()?));
/// let scheduler = JobScheduler::builder("sync-users")
///   .activity(ConstIntervalScheduler::new(Duration::from_secs(60)))
///   .backoff(ExponentialBackoff::default().with_max_retries(5))
///   .task_factory(|_ctx| Ok((SimpleTask::new("sync users", |_| async { Ok(vec![]) }).boxed(), vec![])))
///   .build(&ctx)?;
/// scheduler.schedule();
/// scheduler.enable(true);
/// # Ok(())
/// # }
/// ```
pub struct JobSchedulerBuilder {
  config: JobSchedulerConfig,
}

impl JobSchedulerBuilder {
  /// Creates a builder for the job named `job_id`.
  /// - `backoff`: `StopBackoff` unless set.
  /// - `min_delay`: one second.
  pub fn new(job_id: impl Into<String>) -> Self {
    Self {
      config: JobSchedulerConfig {
        job_id: job_id.into(),
        ..JobSchedulerConfig::default()
      },
    }
  }

  /// Sets the activity scheduler deciding when successful runs repeat (required).
  pub fn activity<S: ActivityScheduler + 'static>(self, activity: S) -> Self {
    self.activity_arc(Arc::new(activity))
  }

  pub fn activity_arc(mut self, activity: Arc<dyn ActivityScheduler>) -> Self {
    self.config.activity = Some(activity);
    self
  }

  /// Sets the retry policy applied after failed runs.
  pub fn backoff<B: Backoff + 'static>(mut self, backoff: B) -> Self {
    self.config.backoff = Some(Box::new(backoff));
    self
  }

  /// Sets the function creating the task of every run (required).
  pub fn task_factory<F>(mut self, factory: F) -> Self
  where
    F: Fn(CancellationToken) -> Result<(Box<dyn Task>, Vec<TaskValue>), TaskError>
      + Send
      + Sync
      + 'static,
  {
    self.config.task_factory = Some(Arc::new(factory));
    self
  }

  /// Uses a fixed task manager.
  pub fn task_manager(mut self, manager: Arc<dyn TaskManager>) -> Self {
    self.config.task_manager = Some(Arc::new(move |_: &AppContext| Some(Arc::clone(&manager))));
    self
  }

  /// Resolves the task manager on every run. Resolving to `None` stops the scheduler.
  pub fn task_manager_provider<F>(mut self, provider: F) -> Self
  where
    F: Fn(&AppContext) -> Option<Arc<dyn TaskManager>> + Send + Sync + 'static,
  {
    self.config.task_manager = Some(Arc::new(provider));
    self
  }

  /// Sets the floor applied to every computed sleep.
  pub fn min_delay(mut self, delay: Duration) -> Self {
    self.config.min_delay = delay;
    self
  }

  /// Builds the scheduler. It starts disabled and unscheduled.
  ///
  /// # Errors
  ///
  /// See [`JobScheduler::new`].
  pub fn build(self, ctx: &AppContext) -> Result<JobScheduler, BuildError> {
    JobScheduler::new(ctx, self.config)
  }
}

/// Runs one named job over and over on the schedule of its activity scheduler.
///
/// A freshly built scheduler does nothing until both [`schedule`](Self::schedule)
/// and [`enable(true)`](Self::enable) were called. Progress is reported only
/// through [`JobEvent`]s published on [`subject`](Self::subject); fatal
/// conditions end in a `SchedulerStop` event rather than an error return.
///
/// Dropping the scheduler closes it.
pub struct JobScheduler {
  runner: Arc<JobRunner>,
}

impl JobScheduler {
  /// Returns a builder for the job named `job_id`.
  pub fn builder(job_id: impl Into<String>) -> JobSchedulerBuilder {
    JobSchedulerBuilder::new(job_id)
  }

  /// Creates a scheduler from `config`, bound to the lifetime of `ctx`.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingTaskManager`]: no provider is configured and `ctx` has no task manager.
  /// - [`BuildError::MissingActivityScheduler`], [`BuildError::MissingTaskFactory`]: a mandatory part is missing.
  /// - [`BuildError::EmptyJobId`]: the job id is empty.
  /// - [`BuildError::NoRuntime`]: called outside of a Tokio runtime.
  pub fn new(ctx: &AppContext, config: JobSchedulerConfig) -> Result<Self, BuildError> {
    let JobSchedulerConfig {
      job_id,
      activity,
      backoff,
      task_factory,
      task_manager,
      min_delay,
    } = config;

    let task_manager = match task_manager {
      Some(provider) => provider,
      None => {
        let manager = ctx.task_manager().ok_or(BuildError::MissingTaskManager)?;
        Arc::new(move |_: &AppContext| Some(Arc::clone(&manager))) as TaskManagerProvider
      }
    };
    let activity = activity.ok_or(BuildError::MissingActivityScheduler)?;
    let factory = task_factory.ok_or(BuildError::MissingTaskFactory)?;
    if job_id.is_empty() {
      return Err(BuildError::EmptyJobId);
    }
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    let backoff = backoff.unwrap_or_else(|| Box::new(StopBackoff) as Box<dyn Backoff>);

    debug!(%job_id, ?min_delay, "Building job scheduler.");
    let runner = JobRunner::new(RunnerParts {
      job_id: Arc::from(job_id),
      ctx: ctx.clone(),
      activity,
      backoff,
      factory,
      task_manager,
      min_delay,
      runtime,
    });
    Ok(Self { runner })
  }

  pub fn id(&self) -> &str {
    self.runner.job_id()
  }

  /// Where observers attach. Detaching everyone through it is not allowed.
  pub fn subject(&self) -> EventSource<JobEvent> {
    EventSource::new(self.runner.subject().clone())
  }

  /// Turns runs on or off. Only an actual change has an effect.
  ///
  /// Disabling stops the pending timer and cancels the running job.
  /// Enabling resets the backoff and, when the scheduler is scheduled and
  /// idle, re-arms the timer from the last success. This also happens before
  /// any run has completed: a scheduler whose first deadline passed while it
  /// was disabled runs as soon as the `min_delay` floor allows.
  pub fn enable(&self, enabled: bool) {
    self.runner.enable(enabled);
  }

  pub fn is_enabled(&self) -> bool {
    self.runner.is_enabled()
  }

  /// Arms the timer for the first run. Further calls are no-ops.
  pub fn schedule(&self) {
    self.runner.schedule();
  }

  /// Replaces the activity scheduler. An idle, enabled scheduler re-arms its
  /// timer with the new policy right away; otherwise it applies from the next run.
  ///
  /// A disabled scheduler keeps its timer stopped. The new policy is picked up
  /// by the next `enable(true)`.
  pub fn set_scheduler<S: ActivityScheduler + 'static>(&self, activity: S) {
    self.runner.set_scheduler(Arc::new(activity));
  }

  /// Closes the scheduler: `SchedulerClosed` is published, the timer stops
  /// and a running job is cancelled. Idempotent.
  pub fn close(&self) {
    self.runner.close();
  }

  pub fn is_closed(&self) -> bool {
    self.runner.is_closed()
  }

  pub fn is_running(&self) -> bool {
    self.runner.is_running()
  }

  /// Why the scheduler stopped for good, if it did.
  pub fn stop_reason(&self) -> Option<StopReason> {
    self.runner.stop_reason()
  }

  /// Number of runs started so far.
  pub fn rounds(&self) -> u64 {
    self.runner.rounds()
  }

  pub fn last_succeeded_at(&self) -> Option<DateTime<Utc>> {
    self.runner.last_succeeded_at()
  }

  pub fn last_finished_at(&self) -> Option<DateTime<Utc>> {
    self.runner.last_finished_at()
  }
}

impl fmt::Debug for JobScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobScheduler")
      .field("id", &self.id())
      .field("enabled", &self.is_enabled())
      .field("closed", &self.is_closed())
      .field("rounds", &self.rounds())
      .finish()
  }
}

impl Drop for JobScheduler {
  fn drop(&mut self) {
    self.runner.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::activity::ConstIntervalScheduler;
  use crate::task::manager::LocalTaskManager;
  use crate::task::SimpleTask;

  fn factory(
  ) -> impl Fn(CancellationToken) -> Result<(Box<dyn Task>, Vec<TaskValue>), TaskError> + Send + Sync + 'static
  {
    |_| Ok((SimpleTask::new("noop", |_| async { Ok(vec![]) }).boxed(), vec![]))
  }

  #[tokio::test]
  async fn build_validates_in_order() {
    let bare = AppContext::new();
    let err = JobScheduler::builder("job").build(&bare).unwrap_err();
    assert_eq!(err, BuildError::MissingTaskManager);

    let ctx = AppContext::new().with_task_manager(Arc::new(LocalTaskManager::new().unwrap()));
    let err = JobScheduler::builder("job").build(&ctx).unwrap_err();
    assert_eq!(err, BuildError::MissingActivityScheduler);

    let err = JobScheduler::builder("job")
      .activity(ConstIntervalScheduler::new(Duration::from_secs(1)))
      .build(&ctx)
      .unwrap_err();
    assert_eq!(err, BuildError::MissingTaskFactory);

    let err = JobScheduler::builder("")
      .activity(ConstIntervalScheduler::new(Duration::from_secs(1)))
      .task_factory(factory())
      .build(&ctx)
      .unwrap_err();
    assert_eq!(err, BuildError::EmptyJobId);

    let scheduler = JobScheduler::builder("job")
      .activity(ConstIntervalScheduler::new(Duration::from_secs(1)))
      .task_factory(factory())
      .build(&ctx)
      .unwrap();
    assert_eq!(scheduler.id(), "job");
    assert!(!scheduler.is_enabled());
    assert_eq!(scheduler.rounds(), 0);
  }

  #[test]
  fn build_needs_a_runtime() {
    let err = JobScheduler::builder("job")
      .activity(ConstIntervalScheduler::new(Duration::from_secs(1)))
      .task_factory(factory())
      .task_manager_provider(|_| None)
      .build(&AppContext::new())
      .unwrap_err();
    assert_eq!(err, BuildError::NoRuntime);
  }

  #[tokio::test]
  async fn provider_skips_context_lookup() {
    let scheduler = JobScheduler::builder("job")
      .activity(ConstIntervalScheduler::new(Duration::from_secs(1)))
      .task_factory(factory())
      .task_manager_provider(|_| None)
      .build(&AppContext::new());
    assert!(scheduler.is_ok());
  }
}
