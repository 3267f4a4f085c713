//! Task managers run tasks and report their completion.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use super::{Task, TaskId, TaskInfo, TaskValue};
use crate::error::{BuildError, TaskError};

/// Callback invoked once when a task finishes.
///
/// Completions are called from a runtime worker, never from inside
/// [`TaskManager::schedule`].
pub type TaskCompletion = Box<dyn FnOnce(&TaskInfo, &TaskOutcome) + Send + 'static>;

/// How a task ended.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
  /// The task never produced a result (it panicked or was aborted).
  StartFailed(TaskError),
  /// The task produced its output values. A task returning `Err(e)` is
  /// reported as a single `TaskValue::Error(e)`.
  Completed(Vec<TaskValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
  Scheduled,
  Finished,
}

/// Snapshot of a task as seen by its manager.
#[derive(Debug, Clone)]
pub struct TaskState {
  pub info: TaskInfo,
  pub status: TaskStatus,
  pub args: Vec<TaskValue>,
  pub outcome: Option<TaskOutcome>,
  pub scheduled_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
}

/// Runs tasks. Scheduling a task whose id is already in flight joins the
/// running one instead of starting a second copy.
pub trait TaskManager: Send + Sync {
  fn schedule(
    &self,
    task: Box<dyn Task>,
    completion: Option<TaskCompletion>,
    args: Vec<TaskValue>,
  ) -> TaskControl;

  /// State of an in-flight task.
  fn query_task_state(&self, id: &str) -> Option<TaskState>;

  /// All in-flight tasks.
  fn enumerate(&self) -> Vec<TaskState>;
}

struct TaskSlot {
  state: Mutex<TaskState>,
  receivers: Mutex<Vec<TaskCompletion>>,
  done: watch::Sender<bool>,
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct TaskControl {
  slot: Arc<TaskSlot>,
}

impl TaskControl {
  pub fn id(&self) -> TaskId {
    self.slot.state.lock().info.id.clone()
  }

  pub fn state(&self) -> TaskState {
    self.slot.state.lock().clone()
  }

  pub fn is_finished(&self) -> bool {
    *self.slot.done.borrow()
  }

  /// Waits until the task has finished and returns its final state.
  pub async fn wait_completed(&self) -> TaskState {
    let mut rx = self.slot.done.subscribe();
    // The sender lives inside the slot we hold, so the channel cannot close here.
    let _ = rx.wait_for(|done| *done).await;
    self.state()
  }
}

impl fmt::Debug for TaskControl {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.slot.state.lock();
    f.debug_struct("TaskControl")
      .field("id", &state.info.id)
      .field("status", &state.status)
      .finish()
  }
}

type ActiveTasks = Arc<Mutex<HashMap<TaskId, Arc<TaskSlot>>>>;

/// A task manager that spawns every task on a Tokio runtime.
pub struct LocalTaskManager {
  runtime: Handle,
  active: ActiveTasks,
}

impl LocalTaskManager {
  /// Binds to the runtime of the calling context.
  pub fn new() -> Result<Self, BuildError> {
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    Ok(Self::with_handle(runtime))
  }

  pub fn with_handle(runtime: Handle) -> Self {
    Self {
      runtime,
      active: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn active_count(&self) -> usize {
    self.active.lock().len()
  }
}

impl fmt::Debug for LocalTaskManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LocalTaskManager")
      .field("active", &self.active_count())
      .finish()
  }
}

impl TaskManager for LocalTaskManager {
  fn schedule(
    &self,
    task: Box<dyn Task>,
    completion: Option<TaskCompletion>,
    args: Vec<TaskValue>,
  ) -> TaskControl {
    let info = task.info();
    let mut active = self.active.lock();

    if let Some(slot) = active.get(&info.id) {
      debug!(task_id = %info.id, "Task is already in flight, joining it.");
      if let Some(completion) = completion {
        slot.receivers.lock().push(completion);
      }
      return TaskControl { slot: Arc::clone(slot) };
    }

    let (done, _) = watch::channel(false);
    let slot = Arc::new(TaskSlot {
      state: Mutex::new(TaskState {
        info: info.clone(),
        status: TaskStatus::Scheduled,
        args: args.clone(),
        outcome: None,
        scheduled_at: Utc::now(),
        finished_at: None,
      }),
      receivers: Mutex::new(completion.into_iter().collect()),
      done,
    });
    active.insert(info.id.clone(), Arc::clone(&slot));
    drop(active);

    trace!(task_id = %info.id, description = %info.description, "Spawning task.");
    let work = self.runtime.spawn(task.invoke(args));
    let active = Arc::clone(&self.active);
    let finished = Arc::clone(&slot);
    self.runtime.spawn(async move {
      let outcome = match work.await {
        Ok(Ok(values)) => TaskOutcome::Completed(values),
        Ok(Err(err)) => TaskOutcome::Completed(vec![TaskValue::Error(err)]),
        Err(join_err) if join_err.is_panic() => {
          let message = panic_message(join_err.into_panic());
          error!(task_id = %info.id, panic = %message, "Task panicked.");
          TaskOutcome::StartFailed(TaskError::Panicked(message))
        }
        Err(_) => {
          warn!(task_id = %info.id, "Task was aborted before completion.");
          TaskOutcome::StartFailed(TaskError::Aborted)
        }
      };
      finish_task(&active, &info, &finished, outcome);
    });

    TaskControl { slot }
  }

  fn query_task_state(&self, id: &str) -> Option<TaskState> {
    let slot = self.active.lock().get(id).cloned();
    slot.map(|slot| slot.state.lock().clone())
  }

  fn enumerate(&self) -> Vec<TaskState> {
    let slots: Vec<_> = self.active.lock().values().cloned().collect();
    slots.iter().map(|slot| slot.state.lock().clone()).collect()
  }
}

fn finish_task(active: &ActiveTasks, info: &TaskInfo, slot: &Arc<TaskSlot>, outcome: TaskOutcome) {
  {
    let mut active = active.lock();
    if active.get(&info.id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
      active.remove(&info.id);
    }
  }
  {
    let mut state = slot.state.lock();
    state.status = TaskStatus::Finished;
    state.outcome = Some(outcome.clone());
    state.finished_at = Some(Utc::now());
  }
  // Joiners registered before the removal above are all in the list now.
  let receivers = std::mem::take(&mut *slot.receivers.lock());
  slot.done.send_replace(true);
  trace!(task_id = %info.id, receivers = receivers.len(), "Task finished.");
  for receiver in receivers {
    receiver(info, &outcome);
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::SimpleTask;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn runs_task_and_reports_output() {
    let manager = LocalTaskManager::new().unwrap();
    let task = SimpleTask::new("echo", |args: Vec<TaskValue>| async move { Ok(args) }).boxed();
    let control = manager.schedule(task, None, vec![TaskValue::new(7i64)]);
    let state = control.wait_completed().await;
    assert_eq!(state.status, TaskStatus::Finished);
    match state.outcome {
      Some(TaskOutcome::Completed(values)) => {
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].downcast_ref::<i64>(), Some(&7));
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(manager.active_count(), 0);
  }

  #[tokio::test]
  async fn same_id_joins_running_task() {
    let manager = LocalTaskManager::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let notified = Arc::new(AtomicUsize::new(0));

    let make = |runs: Arc<AtomicUsize>| {
      let task = SimpleTask::new("slow", move |_| async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(vec![])
      })
      .boxed();
      crate::task::override_task_id(task, "shared")
    };
    let completion = |n: Arc<AtomicUsize>| -> TaskCompletion {
      Box::new(move |_, _| {
        n.fetch_add(1, Ordering::SeqCst);
      })
    };

    let first = manager.schedule(make(runs.clone()), Some(completion(notified.clone())), vec![]);
    let second = manager.schedule(make(runs.clone()), Some(completion(notified.clone())), vec![]);
    assert_eq!(manager.enumerate().len(), 1);
    assert!(manager.query_task_state("shared").is_some());

    first.wait_completed().await;
    second.wait_completed().await;
    // Completions run right after the done flag flips; give them a moment.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert!(manager.query_task_state("shared").is_none());
  }

  #[tokio::test]
  async fn panicking_task_is_a_start_failure() {
    let manager = LocalTaskManager::new().unwrap();
    let task = SimpleTask::new("boom", |_| async {
      if true {
        panic!("kaboom");
      }
      Ok(vec![])
    })
    .boxed();
    let state = manager.schedule(task, None, vec![]).wait_completed().await;
    match state.outcome {
      Some(TaskOutcome::StartFailed(TaskError::Panicked(msg))) => assert_eq!(msg, "kaboom"),
      other => panic!("unexpected outcome: {:?}", other),
    }
  }

  #[tokio::test]
  async fn failed_task_reports_error_value() {
    let manager = LocalTaskManager::new().unwrap();
    let task = SimpleTask::new("fails", |_| async { Err(TaskError::msg("nope")) }).boxed();
    let state = manager.schedule(task, None, vec![]).wait_completed().await;
    match state.outcome {
      Some(TaskOutcome::Completed(values)) => {
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].as_error().map(|e| e.to_string()), Some("nope".to_string()));
      }
      other => panic!("unexpected outcome: {:?}", other),
    }
  }
}
