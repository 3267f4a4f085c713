//! A small observer/subject event bus.
//!
//! Observers subscribe to event kinds. A [`Subject`] delivers a batch of
//! events to every attached observer: synchronous observers run inline on the
//! notifying task, asynchronous ones on a freshly spawned task.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, trace};

/// An event with a discriminating kind observers can filter on.
pub trait Event: Clone + Send + Sync + 'static {
  type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

  fn kind(&self) -> Self::Kind;
}

pub type EventReceiver<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

struct ObserverState<E: Event> {
  receiver: Option<EventReceiver<E>>,
  kinds: HashSet<E::Kind>,
}

/// Receives the events it subscribed to.
pub struct Observer<E: Event> {
  id: u64,
  asynchronous: bool,
  state: RwLock<ObserverState<E>>,
}

impl<E: Event> Observer<E> {
  /// A synchronous observer, called inline on the notifying task.
  pub fn new<F>(receiver: F) -> Arc<Self>
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    Self::build(Arc::new(receiver), false)
  }

  /// An asynchronous observer, called on a spawned task per notification.
  pub fn new_async<F>(receiver: F) -> Arc<Self>
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    Self::build(Arc::new(receiver), true)
  }

  fn build(receiver: EventReceiver<E>, asynchronous: bool) -> Arc<Self> {
    Arc::new(Self {
      id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
      asynchronous,
      state: RwLock::new(ObserverState {
        receiver: Some(receiver),
        kinds: HashSet::new(),
      }),
    })
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn is_async(&self) -> bool {
    self.asynchronous
  }

  pub fn subscribe(&self, kinds: impl IntoIterator<Item = E::Kind>) {
    self.state.write().kinds.extend(kinds);
  }

  pub fn unsubscribe(&self, kinds: impl IntoIterator<Item = E::Kind>) {
    let mut state = self.state.write();
    for kind in kinds {
      state.kinds.remove(&kind);
    }
  }

  /// Replaces the subscription set with `kinds`.
  pub fn subscribe_all(&self, kinds: impl IntoIterator<Item = E::Kind>) {
    let mut state = self.state.write();
    state.kinds.clear();
    state.kinds.extend(kinds);
  }

  pub fn unsubscribe_all(&self) {
    self.state.write().kinds.clear();
  }

  pub fn is_subscribed(&self, kind: E::Kind) -> bool {
    self.state.read().kinds.contains(&kind)
  }

  /// Stops delivery for good.
  pub fn close(&self) {
    let mut state = self.state.write();
    state.receiver = None;
    state.kinds.clear();
  }

  pub fn is_closed(&self) -> bool {
    self.state.read().receiver.is_none()
  }

  /// Delivers the subscribed subset of `events`, in order.
  pub fn observe(&self, events: &[E]) {
    let (receiver, wanted): (EventReceiver<E>, Vec<&E>) = {
      let state = self.state.read();
      let Some(receiver) = state.receiver.clone() else {
        return;
      };
      let wanted = events.iter().filter(|e| state.kinds.contains(&e.kind())).collect();
      (receiver, wanted)
    };
    for event in wanted {
      receiver(event);
    }
  }
}

impl<E: Event> fmt::Debug for Observer<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.read();
    f.debug_struct("Observer")
      .field("id", &self.id)
      .field("async", &self.asynchronous)
      .field("kinds", &state.kinds)
      .field("closed", &state.receiver.is_none())
      .finish()
  }
}

/// A set of observers events are broadcast to.
pub struct Subject<E: Event> {
  observers: Arc<RwLock<Vec<Arc<Observer<E>>>>>,
}

impl<E: Event> Clone for Subject<E> {
  fn clone(&self) -> Self {
    Self {
      observers: Arc::clone(&self.observers),
    }
  }
}

impl<E: Event> Default for Subject<E> {
  fn default() -> Self {
    Self {
      observers: Arc::new(RwLock::new(Vec::new())),
    }
  }
}

impl<E: Event> Subject<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Attaches observers. An observer already attached is not added twice.
  pub fn attach(&self, observers: &[Arc<Observer<E>>]) {
    let mut list = self.observers.write();
    for observer in observers {
      if !list.iter().any(|o| o.id == observer.id) {
        list.push(Arc::clone(observer));
      }
    }
  }

  pub fn detach(&self, observers: &[Arc<Observer<E>>]) {
    self
      .observers
      .write()
      .retain(|o| !observers.iter().any(|d| d.id == o.id));
  }

  pub fn detach_all(&self) {
    self.observers.write().clear();
  }

  pub fn observer_count(&self) -> usize {
    self.observers.read().len()
  }

  /// Broadcasts `events` to a snapshot of the attached observers.
  ///
  /// Asynchronous observers need a Tokio runtime; without one they are
  /// called inline like synchronous ones.
  pub fn notify(&self, events: &[E]) {
    if events.is_empty() {
      return;
    }
    let snapshot: Vec<Arc<Observer<E>>> = self.observers.read().clone();
    trace!(observers = snapshot.len(), events = events.len(), "Notifying observers.");

    let runtime = Handle::try_current().ok();
    let mut shared: Option<Arc<Vec<E>>> = None;
    for observer in snapshot.iter().filter(|o| o.asynchronous) {
      match &runtime {
        Some(runtime) => {
          let batch = Arc::clone(shared.get_or_insert_with(|| Arc::new(events.to_vec())));
          let observer = Arc::clone(observer);
          runtime.spawn(async move { observer.observe(&batch) });
        }
        None => observer.observe(events),
      }
    }
    for observer in snapshot.iter().filter(|o| !o.asynchronous) {
      observer.observe(events);
    }
  }
}

impl<E: Event> fmt::Debug for Subject<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subject")
      .field("observers", &self.observer_count())
      .finish()
  }
}

/// Read-only view of a subject: observers can be attached and detached, but
/// nobody outside the owner can drop all of them at once.
pub struct EventSource<E: Event> {
  subject: Subject<E>,
}

impl<E: Event> Clone for EventSource<E> {
  fn clone(&self) -> Self {
    Self {
      subject: self.subject.clone(),
    }
  }
}

impl<E: Event> EventSource<E> {
  pub fn new(subject: Subject<E>) -> Self {
    Self { subject }
  }

  pub fn attach(&self, observers: &[Arc<Observer<E>>]) {
    self.subject.attach(observers);
  }

  pub fn detach(&self, observers: &[Arc<Observer<E>>]) {
    self.subject.detach(observers);
  }

  /// Suppressed: only the owner of the subject may detach everyone.
  pub fn detach_all(&self) {
    debug!("Ignoring detach_all on a read-only event source.");
  }

  pub fn observer_count(&self) -> usize {
    self.subject.observer_count()
  }
}

impl<E: Event> fmt::Debug for EventSource<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventSource")
      .field("observers", &self.observer_count())
      .finish()
  }
}
