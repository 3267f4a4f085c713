use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::task::manager::TaskManager;

/// Who is running the schedulers. Shows up in the schedulers' tracing spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
  pub name: String,
  pub version: String,
  pub instance_id: Uuid,
}

impl AppIdentity {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      instance_id: Uuid::new_v4(),
    }
  }
}

impl fmt::Display for AppIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{} ({})", self.name, self.version, self.instance_id)
  }
}

/// Application-wide context shared by job schedulers.
///
/// Cancelling the shutdown token stops every scheduler built from this
/// context: running jobs see their context cancelled and no further runs
/// are planned.
#[derive(Clone, Default)]
pub struct AppContext {
  shutdown: CancellationToken,
  task_manager: Option<Arc<dyn TaskManager>>,
  identity: Option<Arc<AppIdentity>>,
}

impl AppContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_task_manager(mut self, manager: Arc<dyn TaskManager>) -> Self {
    self.task_manager = Some(manager);
    self
  }

  pub fn with_identity(mut self, identity: AppIdentity) -> Self {
    self.identity = Some(Arc::new(identity));
    self
  }

  pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
    self.shutdown = token;
    self
  }

  /// A context whose shutdown follows this one but can also be triggered on its own.
  pub fn child(&self) -> Self {
    Self {
      shutdown: self.shutdown.child_token(),
      task_manager: self.task_manager.clone(),
      identity: self.identity.clone(),
    }
  }

  pub fn task_manager(&self) -> Option<Arc<dyn TaskManager>> {
    self.task_manager.clone()
  }

  pub fn identity(&self) -> Option<&AppIdentity> {
    self.identity.as_deref()
  }

  pub fn shutdown_token(&self) -> &CancellationToken {
    &self.shutdown
  }

  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  pub fn is_shut_down(&self) -> bool {
    self.shutdown.is_cancelled()
  }
}

impl fmt::Debug for AppContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AppContext")
      .field("identity", &self.identity)
      .field("task_manager", &self.task_manager.is_some())
      .field("shut_down", &self.is_shut_down())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn child_follows_parent_shutdown() {
    let parent = AppContext::new().with_identity(AppIdentity::new("svc", "1.0.0"));
    let child = parent.child();
    assert_eq!(child.identity().map(|i| i.name.as_str()), Some("svc"));
    child.shutdown();
    assert!(child.is_shut_down());
    assert!(!parent.is_shut_down());

    let other = parent.child();
    parent.shutdown();
    assert!(other.is_shut_down());
  }
}
