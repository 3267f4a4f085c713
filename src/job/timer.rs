//! A resettable one-shot timer backed by a Tokio task.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{trace, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
  Idle,
  At(Instant),
}

/// Fires its callback once per arming. Dropping the timer ends its task.
pub(crate) struct Timer {
  control: watch::Sender<Deadline>,
}

impl Timer {
  pub(crate) fn start<F>(runtime: &Handle, delay: Duration, on_fire: F, span: Span) -> Self
  where
    F: Fn() + Send + Sync + 'static,
  {
    let (control, rx) = watch::channel(Deadline::At(Instant::now() + delay));
    runtime.spawn(run(rx, Arc::new(on_fire)).instrument(span));
    Self { control }
  }

  /// Re-arms the timer to fire after `delay`, replacing any pending deadline.
  pub(crate) fn reset(&self, delay: Duration) {
    self.control.send_replace(Deadline::At(Instant::now() + delay));
  }

  pub(crate) fn stop(&self) {
    self.control.send_replace(Deadline::Idle);
  }
}

async fn run(mut rx: watch::Receiver<Deadline>, on_fire: Arc<dyn Fn() + Send + Sync>) {
  loop {
    let deadline = *rx.borrow_and_update();
    match deadline {
      Deadline::Idle => {
        if rx.changed().await.is_err() {
          break;
        }
      }
      Deadline::At(at) => {
        tokio::select! {
          _ = tokio::time::sleep_until(at) => {
            trace!("Timer fired.");
            on_fire();
            // Wait for the next arming; the fired deadline must not fire twice.
            if rx.changed().await.is_err() {
              break;
            }
          }
          changed = rx.changed() => {
            if changed.is_err() {
              break;
            }
          }
        }
      }
    }
  }
  trace!("Timer task ended.");
}
