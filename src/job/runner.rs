//! The state machine behind a [`JobScheduler`](crate::JobScheduler).
//!
//! Three kinds of callers drive a runner concurrently: the timer task firing a
//! run, the task manager reporting a finished run, and users calling
//! `enable`/`set_scheduler`/`close`. All mutable state sits behind one mutex;
//! the enable flag and the round counter are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, trace, warn, Instrument, Span};

use super::events::{JobEvent, JobFinished, JobId};
use super::notify::Notifier;
use super::timer::Timer;
use super::{TaskFactory, TaskManagerProvider};
use crate::activity::ActivityScheduler;
use crate::backoff::Backoff;
use crate::context::AppContext;
use crate::error::{StopReason, TaskError};
use crate::observer::Subject;
use crate::task::manager::{TaskCompletion, TaskOutcome};
use crate::task::{override_task_id, CancelHandle, CancellableTask, TaskValue};

struct RunningJob {
  round: u64,
  cancel: CancelHandle,
}

struct RunnerState {
  activity: Arc<dyn ActivityScheduler>,
  backoff: Box<dyn Backoff>,
  timer: Option<Timer>,
  running: Option<RunningJob>,
  last_succeeded_at: Option<DateTime<Utc>>,
  last_finished_at: Option<DateTime<Utc>>,
  /// Set once a fatal condition stopped the scheduler for good.
  halted: Option<StopReason>,
}

struct PreparedJob {
  task: CancellableTask,
  args: Vec<TaskValue>,
}

pub(crate) struct RunnerParts {
  pub job_id: JobId,
  pub ctx: AppContext,
  pub activity: Arc<dyn ActivityScheduler>,
  pub backoff: Box<dyn Backoff>,
  pub factory: TaskFactory,
  pub task_manager: TaskManagerProvider,
  pub min_delay: Duration,
  pub runtime: Handle,
}

pub(crate) struct JobRunner {
  job_id: JobId,
  ctx: AppContext,
  factory: TaskFactory,
  task_manager: TaskManagerProvider,
  min_delay: Duration,
  runtime: Handle,
  span: Span,
  subject: Subject<JobEvent>,
  notifier: Notifier,
  enabled: AtomicBool,
  scheduled: AtomicBool,
  closing: AtomicBool,
  rounds: AtomicU64,
  closed: CancellationToken,
  state: Mutex<RunnerState>,
}

impl JobRunner {
  pub(crate) fn new(parts: RunnerParts) -> Arc<Self> {
    let span = info_span!("job_scheduler", job_id = %parts.job_id, app = field::Empty);
    if let Some(identity) = parts.ctx.identity() {
      span.record("app", field::display(identity));
    }
    let subject = Subject::new();
    let notifier = Notifier::start(&parts.runtime, subject.clone(), span.clone());
    Arc::new(Self {
      job_id: parts.job_id,
      ctx: parts.ctx,
      factory: parts.factory,
      task_manager: parts.task_manager,
      min_delay: parts.min_delay,
      runtime: parts.runtime,
      span,
      subject,
      notifier,
      enabled: AtomicBool::new(false),
      scheduled: AtomicBool::new(false),
      closing: AtomicBool::new(false),
      rounds: AtomicU64::new(0),
      closed: CancellationToken::new(),
      state: Mutex::new(RunnerState {
        activity: parts.activity,
        backoff: parts.backoff,
        timer: None,
        running: None,
        last_succeeded_at: None,
        last_finished_at: None,
        halted: None,
      }),
    })
  }

  pub(crate) fn job_id(&self) -> &str {
    &self.job_id
  }

  pub(crate) fn subject(&self) -> &Subject<JobEvent> {
    &self.subject
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.is_cancelled() || self.ctx.is_shut_down()
  }

  pub(crate) fn is_enabled(&self) -> bool {
    !self.is_closed() && self.enabled.load(Ordering::SeqCst)
  }

  pub(crate) fn is_running(&self) -> bool {
    self.state.lock().running.is_some()
  }

  pub(crate) fn stop_reason(&self) -> Option<StopReason> {
    self.state.lock().halted.clone()
  }

  pub(crate) fn last_succeeded_at(&self) -> Option<DateTime<Utc>> {
    self.state.lock().last_succeeded_at
  }

  pub(crate) fn last_finished_at(&self) -> Option<DateTime<Utc>> {
    self.state.lock().last_finished_at
  }

  pub(crate) fn rounds(&self) -> u64 {
    self.rounds.load(Ordering::SeqCst)
  }

  fn log(&self, text: impl Into<String>) -> JobEvent {
    JobEvent::Log {
      job_id: self.job_id.clone(),
      text: text.into(),
    }
  }

  fn activity_delay(&self, state: &RunnerState, start: Option<DateTime<Utc>>) -> Duration {
    let next = state.activity.next_activation(start);
    let delay = next.signed_duration_since(Utc::now()).to_std().unwrap_or(Duration::ZERO);
    delay.max(self.min_delay)
  }

  fn backoff_delay(&self, state: &mut RunnerState) -> Option<Duration> {
    state.backoff.next_backoff().map(|delay| delay.max(self.min_delay))
  }

  // --- Public operations ---

  pub(crate) fn schedule(self: &Arc<Self>) {
    if self.scheduled.swap(true, Ordering::SeqCst) {
      trace!(parent: &self.span, "Schedule called again, ignoring.");
      return;
    }
    let _enter = self.span.enter();
    let mut state = self.state.lock();
    if self.closing.load(Ordering::SeqCst) {
      trace!("Scheduler is closing, not arming the timer.");
      return;
    }
    state.backoff.reset();
    let delay = self.activity_delay(&state, None);
    self.notifier.notify([
      self.log(format!("scheduler is started; job will run in ({:?})", delay)),
      JobEvent::SchedulerStarted {
        job_id: self.job_id.clone(),
      },
    ]);
    let runner = Arc::downgrade(self);
    state.timer = Some(Timer::start(
      &self.runtime,
      delay,
      move || {
        if let Some(runner) = runner.upgrade() {
          runner.run_job();
        }
      },
      self.span.clone(),
    ));
    info!(?delay, "Job scheduler started.");
  }

  pub(crate) fn enable(&self, enabled: bool) {
    let _enter = self.span.enter();
    // The flag flips under the state lock so timer changes and events follow the flag order.
    let mut state = self.state.lock();
    if self
      .enabled
      .compare_exchange(!enabled, enabled, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return;
    }
    let mut text;
    if enabled {
      text = String::from("caught 'enable' signal");
      state.backoff.reset();
      if state.running.is_none() && state.halted.is_none() {
        let delay = self.activity_delay(&state, state.last_succeeded_at);
        if let Some(timer) = &state.timer {
          timer.reset(delay);
          text.push_str(&format!("; job will run in ({:?})", delay));
        }
      }
    } else {
      text = String::from("caught 'disable' signal");
      if let Some(timer) = &state.timer {
        timer.stop();
      }
      if let Some(job) = &state.running {
        text.push_str("; current job will stop");
        job.cancel.cancel();
      }
    }
    info!(enabled, "{}", text);
    self.notifier.notify([
      self.log(text),
      JobEvent::SchedulerEnabled {
        job_id: self.job_id.clone(),
        enabled,
      },
    ]);
  }

  pub(crate) fn set_scheduler(&self, activity: Arc<dyn ActivityScheduler>) {
    let _enter = self.span.enter();
    let mut state = self.state.lock();
    state.activity = activity;
    if state.running.is_some() || state.halted.is_some() || !self.is_enabled() {
      return;
    }
    let Some(timer) = &state.timer else {
      return;
    };
    let delay = self.activity_delay(&state, state.last_succeeded_at);
    timer.reset(delay);
    debug!(?delay, "Activity scheduler replaced.");
    self.notifier.notify([self.log(format!(
      "activity scheduler is replaced; job will run in ({:?})",
      delay
    ))]);
  }

  pub(crate) fn close(&self) {
    if self.closing.swap(true, Ordering::SeqCst) {
      return;
    }
    self.scheduled.store(true, Ordering::SeqCst);
    let _enter = self.span.enter();
    let (running, timer) = {
      let mut state = self.state.lock();
      self.notifier.notify([
        self.log("scheduler will close"),
        JobEvent::SchedulerClosed {
          job_id: self.job_id.clone(),
        },
      ]);
      self.closed.cancel();
      (state.running.as_ref().map(|job| job.cancel.clone()), state.timer.take())
    };
    if let Some(cancel) = running {
      cancel.cancel();
    }
    if let Some(timer) = timer {
      timer.stop();
    }
    self.notifier.close();
    info!("Job scheduler closed.");
  }

  // --- Run cycle ---

  fn run_job(self: &Arc<Self>) {
    let _enter = self.span.enter();
    {
      let state = self.state.lock();
      if state.running.is_some() || state.halted.is_some() || self.is_closed() {
        return;
      }
      if !self.is_enabled() {
        self.notifier.notify([self.log("job won't start cause scheduler is disabled")]);
        return;
      }
    }

    let job = match self.prepare_job() {
      Ok(job) => job,
      Err(err) => {
        self.halt(StopReason::NoTaskIsProvided(err));
        return;
      }
    };
    let Some(manager) = (self.task_manager)(&self.ctx) else {
      job.task.cancel();
      self.halt(StopReason::NoTaskManager);
      return;
    };

    let round = {
      let mut state = self.state.lock();
      if state.running.is_some() || state.halted.is_some() || !self.is_enabled() {
        job.task.cancel();
        debug!("Scheduler changed state while the job was prepared, not starting it.");
        return;
      }
      let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
      state.running = Some(RunningJob {
        round,
        cancel: job.task.cancel_handle(),
      });
      self.notifier.notify([
        self.log(format!("job round {} is starting", round)),
        JobEvent::JobStarted {
          job_id: self.job_id.clone(),
          round,
          at: Utc::now(),
        },
      ]);
      round
    };
    info!(round, "Job started.");

    let runner = Arc::clone(self);
    let completion: TaskCompletion =
      Box::new(move |_info, outcome| runner.finish_job(round, outcome.clone()));
    manager.schedule(Box::new(job.task), Some(completion), job.args);
  }

  fn prepare_job(&self) -> Result<PreparedJob, TaskError> {
    let token = self.ctx.shutdown_token().child_token();
    let (task, args) = match (self.factory)(token.clone()) {
      Ok(created) => created,
      Err(err) => {
        token.cancel();
        return Err(err);
      }
    };
    let mut task = override_task_id(task, self.job_id.to_string());
    let hook = task.take_cancel_hook();
    let task = CancellableTask::with_token(task, token, move || {
      if let Some(hook) = hook {
        hook();
      }
    });
    Ok(PreparedJob { task, args })
  }

  fn finish_job(self: Arc<Self>, round: u64, outcome: TaskOutcome) {
    let span = self.span.clone();
    let _enter = span.enter();
    let at = Utc::now();
    let finished = JobFinished::new(self.job_id.clone(), round, at, outcome);
    let failure = finished.find_error().cloned();

    let gate = {
      let mut state = self.state.lock();
      if state.running.as_ref().is_some_and(|job| job.round == round) {
        if let Some(job) = state.running.take() {
          job.cancel.cancel();
        }
      }
      state.last_finished_at = Some(at);
      if failure.is_none() {
        state.last_succeeded_at = Some(at);
      }
      let text = match &failure {
        Some(err) => format!("job round {} has failed; error: {}", round, err),
        None => format!("job round {} has successfully finished", round),
      };
      self.notifier.notify([self.log(text), JobEvent::JobFinished(finished)]);
      self.notifier.allow_continue()
    };
    match &failure {
      Some(err) if !err.is_cancelled() => warn!(round, error = %err, "Job failed."),
      _ => info!(round, "Job finished."),
    }

    self
      .runtime
      .clone()
      .spawn(self.plan_next_run(failure, gate).instrument(span.clone()));
  }

  /// Waits until observers have seen the finished run, then arms the next one.
  async fn plan_next_run(self: Arc<Self>, failure: Option<TaskError>, gate: oneshot::Receiver<()>) {
    tokio::select! {
      _ = gate => {}
      _ = self.closed.cancelled() => {}
      _ = self.ctx.shutdown_token().cancelled() => {}
    }
    if !self.is_enabled() {
      self
        .notifier
        .notify([self.log("scheduler won't plan the next run cause it is disabled")]);
      return;
    }

    let failure = failure.filter(|err| !err.is_cancelled());
    let mut state = self.state.lock();
    if state.halted.is_some() || state.running.is_some() {
      return;
    }
    let delay = match failure {
      None => {
        state.backoff.reset();
        let last = state.last_succeeded_at;
        self.activity_delay(&state, last)
      }
      Some(err) => match self.backoff_delay(&mut state) {
        Some(delay) => {
          debug!(error = %err, ?delay, "Retrying after backoff.");
          delay
        }
        None => {
          self.halt_locked(&mut state, StopReason::BackoffStopped);
          return;
        }
      },
    };
    let wake_at = ChronoDuration::from_std(delay)
      .ok()
      .and_then(|d| Utc::now().checked_add_signed(d))
      .unwrap_or_else(Utc::now);
    self.notifier.notify([self.log(format!(
      "scheduler will sleep ({:?}) until ({})",
      delay,
      wake_at.to_rfc3339()
    ))]);
    if let Some(timer) = &state.timer {
      timer.reset(delay);
    }
  }

  fn halt(&self, reason: StopReason) {
    let mut state = self.state.lock();
    self.halt_locked(&mut state, reason);
  }

  fn halt_locked(&self, state: &mut RunnerState, reason: StopReason) {
    if state.halted.is_some() {
      return;
    }
    warn!(reason = reason.name(), error = %reason, "Job scheduler is stopping for good.");
    if let Some(timer) = &state.timer {
      timer.stop();
    }
    state.halted = Some(reason.clone());
    self.notifier.notify([
      self.log(format!("scheduler will stop by reason: {}", reason)),
      JobEvent::SchedulerStop {
        job_id: self.job_id.clone(),
        reason,
      },
    ]);
  }
}
