//! Units of work executed by a [`TaskManager`](manager::TaskManager).
//!
//! A task follows a fixed contract: it takes a list of argument values and
//! resolves to either a list of output values or a [`TaskError`].

pub mod manager;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;

/// Identity of a task inside a task manager. Tasks sharing an id are joined.
pub type TaskId = String;

/// What a task resolves to.
pub type TaskResult = Result<Vec<TaskValue>, TaskError>;

/// A one-shot cancellation hook a task may expose in addition to its context.
pub type CancelHook = Box<dyn FnOnce() + Send + 'static>;

/// A single argument or output value of a task.
///
/// Values are type-erased and cheap to clone. An `Error` value marks the
/// position that reports the run's failure.
#[derive(Clone)]
pub enum TaskValue {
  Value(Arc<dyn Any + Send + Sync>),
  Error(TaskError),
}

impl TaskValue {
  pub fn new<T: Any + Send + Sync>(value: T) -> Self {
    TaskValue::Value(Arc::new(value))
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    match self {
      TaskValue::Value(v) => v.downcast_ref::<T>(),
      TaskValue::Error(_) => None,
    }
  }

  pub fn as_error(&self) -> Option<&TaskError> {
    match self {
      TaskValue::Error(e) => Some(e),
      TaskValue::Value(_) => None,
    }
  }
}

impl From<TaskError> for TaskValue {
  fn from(err: TaskError) -> Self {
    TaskValue::Error(err)
  }
}

impl fmt::Debug for TaskValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskValue::Error(e) => f.debug_tuple("Error").field(e).finish(),
      TaskValue::Value(v) => {
        if let Some(s) = v.downcast_ref::<String>() {
          f.debug_tuple("Value").field(s).finish()
        } else if let Some(s) = v.downcast_ref::<&'static str>() {
          f.debug_tuple("Value").field(s).finish()
        } else if let Some(n) = v.downcast_ref::<i64>() {
          f.debug_tuple("Value").field(n).finish()
        } else if let Some(n) = v.downcast_ref::<u64>() {
          f.debug_tuple("Value").field(n).finish()
        } else if let Some(n) = v.downcast_ref::<i32>() {
          f.debug_tuple("Value").field(n).finish()
        } else if let Some(b) = v.downcast_ref::<bool>() {
          f.debug_tuple("Value").field(b).finish()
        } else {
          f.debug_tuple("Value").field(&format_args!("<opaque>")).finish()
        }
      }
    }
  }
}

/// Descriptive data of a task, handed to completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
  pub id: TaskId,
  pub description: String,
}

impl fmt::Display for TaskInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description)
  }
}

/// A unit of work that can be handed to a task manager.
pub trait Task: Send + 'static {
  fn id(&self) -> &str;

  fn description(&self) -> &str;

  /// Consumes the task and starts its work.
  fn invoke(self: Box<Self>, args: Vec<TaskValue>) -> BoxFuture<'static, TaskResult>;

  /// Hands out the task's own cancellation hook, if it has one.
  fn take_cancel_hook(&mut self) -> Option<CancelHook> {
    None
  }

  fn info(&self) -> TaskInfo {
    TaskInfo {
      id: self.id().to_string(),
      description: self.description().to_string(),
    }
  }
}

type TaskFn = Box<dyn FnOnce(Vec<TaskValue>) -> BoxFuture<'static, TaskResult> + Send + 'static>;

/// A task built from an async closure. Each instance gets a fresh UUID id.
pub struct SimpleTask {
  id: TaskId,
  description: String,
  func: TaskFn,
  cancel_hook: Option<CancelHook>,
}

impl SimpleTask {
  pub fn new<F, Fut>(description: impl Into<String>, func: F) -> Self
  where
    F: FnOnce(Vec<TaskValue>) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
  {
    Self {
      id: Uuid::new_v4().to_string(),
      description: description.into(),
      func: Box::new(move |args| func(args).boxed()),
      cancel_hook: None,
    }
  }

  /// Attaches a hook invoked (once) when the task gets cancelled.
  pub fn with_cancel_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
    self.cancel_hook = Some(Box::new(hook));
    self
  }

  pub fn boxed(self) -> Box<dyn Task> {
    Box::new(self)
  }
}

impl fmt::Debug for SimpleTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SimpleTask")
      .field("id", &self.id)
      .field("description", &self.description)
      .field("func", &format_args!("<Fn>"))
      .finish()
  }
}

impl Task for SimpleTask {
  fn id(&self) -> &str {
    &self.id
  }

  fn description(&self) -> &str {
    &self.description
  }

  fn invoke(self: Box<Self>, args: Vec<TaskValue>) -> BoxFuture<'static, TaskResult> {
    (self.func)(args)
  }

  fn take_cancel_hook(&mut self) -> Option<CancelHook> {
    self.cancel_hook.take()
  }
}

/// Replaces the id of a wrapped task.
pub struct TaskIdOverride {
  inner: Box<dyn Task>,
  id: TaskId,
}

/// Wraps `task` so that it reports `id` as its identity.
pub fn override_task_id(task: Box<dyn Task>, id: impl Into<TaskId>) -> Box<dyn Task> {
  Box::new(TaskIdOverride {
    inner: task,
    id: id.into(),
  })
}

impl Task for TaskIdOverride {
  fn id(&self) -> &str {
    &self.id
  }

  fn description(&self) -> &str {
    self.inner.description()
  }

  fn invoke(self: Box<Self>, args: Vec<TaskValue>) -> BoxFuture<'static, TaskResult> {
    self.inner.invoke(args)
  }

  fn take_cancel_hook(&mut self) -> Option<CancelHook> {
    self.inner.take_cancel_hook()
  }
}

// --- Cancellation ---

struct Canceller {
  token: CancellationToken,
  hook: Mutex<Option<CancelHook>>,
}

impl Canceller {
  fn fire(&self) {
    self.token.cancel();
    let hook = self.hook.lock().take();
    if let Some(hook) = hook {
      hook();
    }
  }
}

impl Drop for Canceller {
  // The last handle going away releases whatever the canceller guards.
  fn drop(&mut self) {
    self.token.cancel();
    if let Some(hook) = self.hook.get_mut().take() {
      hook();
    }
  }
}

/// Shared handle that cancels a [`CancellableTask`].
///
/// The canceller runs exactly once: on the first `cancel()` call, or when the
/// last handle is dropped, whichever comes first.
#[derive(Clone)]
pub struct CancelHandle {
  inner: Arc<Canceller>,
}

impl CancelHandle {
  pub fn new(canceller: impl FnOnce() + Send + 'static) -> Self {
    Self::with_token(CancellationToken::new(), canceller)
  }

  /// A handle driven by `token`: cancelling the handle cancels the token, and
  /// a cancelled token interrupts the task even if nobody called `cancel()`.
  pub fn with_token(token: CancellationToken, canceller: impl FnOnce() + Send + 'static) -> Self {
    Self {
      inner: Arc::new(Canceller {
        token,
        hook: Mutex::new(Some(Box::new(canceller))),
      }),
    }
  }

  pub fn cancel(&self) {
    self.inner.fire();
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.token.is_cancelled()
  }

  /// Resolves once the handle has been cancelled.
  pub async fn cancelled(&self) {
    self.inner.token.cancelled().await
  }
}

impl fmt::Debug for CancelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelHandle")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

/// A task paired with a cancellation handle.
///
/// Cancelling interrupts the running work at its next await point; the task
/// then resolves to [`TaskError::Cancelled`].
pub struct CancellableTask {
  task: Box<dyn Task>,
  handle: CancelHandle,
}

impl CancellableTask {
  pub fn new(task: Box<dyn Task>, canceller: impl FnOnce() + Send + 'static) -> Self {
    Self {
      task,
      handle: CancelHandle::new(canceller),
    }
  }

  /// Ties the task to an existing cancellation token, usually the context
  /// the task itself was created with.
  pub fn with_token(
    task: Box<dyn Task>,
    token: CancellationToken,
    canceller: impl FnOnce() + Send + 'static,
  ) -> Self {
    Self {
      task,
      handle: CancelHandle::with_token(token, canceller),
    }
  }

  pub fn cancel_handle(&self) -> CancelHandle {
    self.handle.clone()
  }

  pub fn cancel(&self) {
    self.handle.cancel();
  }
}

impl Task for CancellableTask {
  fn id(&self) -> &str {
    self.task.id()
  }

  fn description(&self) -> &str {
    self.task.description()
  }

  fn invoke(self: Box<Self>, args: Vec<TaskValue>) -> BoxFuture<'static, TaskResult> {
    let handle = self.handle;
    let work = self.task.invoke(args);
    async move {
      if handle.is_cancelled() {
        return Err(TaskError::Cancelled);
      }
      tokio::select! {
        result = work => result,
        _ = handle.cancelled() => Err(TaskError::Cancelled),
      }
    }
    .boxed()
  }
}
