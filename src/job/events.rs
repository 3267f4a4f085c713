//! Lifecycle events published by a [`JobScheduler`](super::JobScheduler).

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::{StopReason, TaskError};
use crate::observer::{Event, Observer};
use crate::task::manager::TaskOutcome;
use crate::task::TaskValue;

pub type JobId = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventKind {
  SchedulerStarted,
  SchedulerEnabled,
  JobStarted,
  JobFinished,
  SchedulerStop,
  SchedulerClosed,
  Log,
}

impl JobEventKind {
  pub const ALL: [JobEventKind; 7] = [
    JobEventKind::SchedulerStarted,
    JobEventKind::SchedulerEnabled,
    JobEventKind::JobStarted,
    JobEventKind::JobFinished,
    JobEventKind::SchedulerStop,
    JobEventKind::SchedulerClosed,
    JobEventKind::Log,
  ];
}

/// An event about one job scheduler. Every event carries the job id.
#[derive(Debug, Clone)]
pub enum JobEvent {
  SchedulerStarted { job_id: JobId },
  SchedulerEnabled { job_id: JobId, enabled: bool },
  JobStarted { job_id: JobId, round: u64, at: DateTime<Utc> },
  JobFinished(JobFinished),
  /// The scheduler gave up on the job for good.
  SchedulerStop { job_id: JobId, reason: StopReason },
  SchedulerClosed { job_id: JobId },
  Log { job_id: JobId, text: String },
}

impl JobEvent {
  pub fn job_id(&self) -> &str {
    match self {
      JobEvent::SchedulerStarted { job_id }
      | JobEvent::SchedulerEnabled { job_id, .. }
      | JobEvent::JobStarted { job_id, .. }
      | JobEvent::SchedulerStop { job_id, .. }
      | JobEvent::SchedulerClosed { job_id }
      | JobEvent::Log { job_id, .. } => job_id,
      JobEvent::JobFinished(finished) => &finished.job_id,
    }
  }
}

impl Event for JobEvent {
  type Kind = JobEventKind;

  fn kind(&self) -> JobEventKind {
    match self {
      JobEvent::SchedulerStarted { .. } => JobEventKind::SchedulerStarted,
      JobEvent::SchedulerEnabled { .. } => JobEventKind::SchedulerEnabled,
      JobEvent::JobStarted { .. } => JobEventKind::JobStarted,
      JobEvent::JobFinished(_) => JobEventKind::JobFinished,
      JobEvent::SchedulerStop { .. } => JobEventKind::SchedulerStop,
      JobEvent::SchedulerClosed { .. } => JobEventKind::SchedulerClosed,
      JobEvent::Log { .. } => JobEventKind::Log,
    }
  }
}

impl fmt::Display for JobEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobEvent::SchedulerStarted { job_id } => write!(f, "[{}]: scheduler is started", job_id),
      JobEvent::SchedulerEnabled { job_id, enabled } => {
        let state = if *enabled { "enabled" } else { "disabled" };
        write!(f, "[{}]: scheduler is {}", job_id, state)
      }
      JobEvent::JobStarted { job_id, round, at } => {
        write!(f, "[{}]: job round {} started at {}", job_id, round, at.to_rfc3339())
      }
      JobEvent::JobFinished(finished) => fmt::Display::fmt(finished, f),
      JobEvent::SchedulerStop { job_id, reason } => {
        write!(f, "[{}]: scheduler is stopped: {}", job_id, reason)
      }
      JobEvent::SchedulerClosed { job_id } => write!(f, "[{}]: scheduler is closed", job_id),
      JobEvent::Log { job_id, text } => write!(f, "[{}]: {}", job_id, text),
    }
  }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub enum JobResult {
  /// The task never produced output.
  StartFailure(TaskError),
  Output(Vec<TaskValue>),
}

/// The result of one job run.
#[derive(Debug, Clone)]
pub struct JobFinished {
  pub job_id: JobId,
  pub round: u64,
  pub at: DateTime<Utc>,
  pub result: JobResult,
}

impl JobFinished {
  pub(crate) fn new(job_id: JobId, round: u64, at: DateTime<Utc>, outcome: TaskOutcome) -> Self {
    let result = match outcome {
      TaskOutcome::StartFailed(err) => JobResult::StartFailure(err),
      TaskOutcome::Completed(values) => JobResult::Output(values),
    };
    Self {
      job_id,
      round,
      at,
      result,
    }
  }

  /// The error that decides whether the run failed.
  ///
  /// A start failure wins. Otherwise it is the first error-typed output value.
  pub fn find_error(&self) -> Option<&TaskError> {
    match &self.result {
      JobResult::StartFailure(err) => Some(err),
      JobResult::Output(values) => values.iter().find_map(TaskValue::as_error),
    }
  }

  /// No error, or only a cancellation.
  pub fn is_success(&self) -> bool {
    self.find_error().map_or(true, TaskError::is_cancelled)
  }

  pub fn output(&self) -> &[TaskValue] {
    match &self.result {
      JobResult::Output(values) => values,
      JobResult::StartFailure(_) => &[],
    }
  }
}

impl fmt::Display for JobFinished {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.find_error() {
      Some(err) => write!(f, "[{}]: job round {} failed: {}", self.job_id, self.round, err),
      None => write!(f, "[{}]: job round {} finished", self.job_id, self.round),
    }
  }
}

/// A synchronous observer subscribed to every event kind that forwards
/// events to `tracing`.
pub fn tracing_observer() -> Arc<Observer<JobEvent>> {
  let observer = Observer::new(|event: &JobEvent| match event {
    JobEvent::Log { job_id, text } => debug!(%job_id, "{}", text),
    JobEvent::SchedulerStop { job_id, reason } => {
      error!(%job_id, reason = reason.name(), error = %reason, "Job scheduler stopped.")
    }
    JobEvent::JobFinished(finished) => match finished.find_error() {
      Some(err) if !err.is_cancelled() => {
        warn!(job_id = %finished.job_id, round = finished.round, error = %err, "Job failed.")
      }
      _ => info!(job_id = %finished.job_id, round = finished.round, "Job finished."),
    },
    other => info!(job_id = %other.job_id(), kind = ?other.kind(), "{}", other),
  });
  observer.subscribe(JobEventKind::ALL);
  observer
}
