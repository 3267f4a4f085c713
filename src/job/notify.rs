//! The scheduler's ordered event queue.
//!
//! A single worker drains the queue and hands every batch to the subject, so
//! observers see a scheduler's events in the order they were enqueued.

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, Instrument, Span};

use super::events::JobEvent;
use crate::observer::Subject;

enum Notice {
  Events(Vec<JobEvent>),
  /// Released once every notice enqueued before it has been delivered.
  AllowContinue(oneshot::Sender<()>),
  Close,
}

pub(crate) struct Notifier {
  tx: mpsc::UnboundedSender<Notice>,
}

impl Notifier {
  pub(crate) fn start(runtime: &Handle, subject: Subject<JobEvent>, span: Span) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();
    runtime.spawn(
      async move {
        trace!("Event queue worker started.");
        while let Some(notice) = rx.recv().await {
          match notice {
            Notice::Events(events) => subject.notify(&events),
            Notice::AllowContinue(gate) => {
              let _ = gate.send(());
            }
            Notice::Close => break,
          }
        }
        trace!("Event queue worker stopped.");
      }
      .instrument(span),
    );
    Self { tx }
  }

  pub(crate) fn notify(&self, events: impl IntoIterator<Item = JobEvent>) {
    let events: Vec<JobEvent> = events.into_iter().collect();
    if events.is_empty() {
      return;
    }
    if let Err(mpsc::error::SendError(Notice::Events(dropped))) = self.tx.send(Notice::Events(events)) {
      debug!(dropped = dropped.len(), "Event queue is closed, dropping events.");
    }
  }

  /// A gate that opens after everything enqueued so far has been delivered.
  ///
  /// If the queue is already closed the gate opens right away.
  pub(crate) fn allow_continue(&self) -> oneshot::Receiver<()> {
    let (gate, opened) = oneshot::channel();
    // A failed send drops the sender, which resolves the receiver.
    let _ = self.tx.send(Notice::AllowContinue(gate));
    opened
  }

  pub(crate) fn close(&self) {
    let _ = self.tx.send(Notice::Close);
  }
}
