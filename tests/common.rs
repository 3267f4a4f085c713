//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::{
  activity::ConstIntervalScheduler, AppContext, JobEvent, JobEventKind, JobScheduler,
  JobSchedulerBuilder, LocalTaskManager, Observer, SimpleTask, Task, TaskError, TaskValue,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::TestWriter;

/// Sleep floor used by every test scheduler, keeps tests fast.
pub const MIN_DELAY: StdDuration = StdDuration::from_millis(20);

pub type FactoryResult = Result<(Box<dyn Task>, Vec<TaskValue>), TaskError>;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// An application context with a local task manager on the current runtime.
pub fn app_context() -> AppContext {
  AppContext::new().with_task_manager(Arc::new(
    LocalTaskManager::new().expect("tests run inside a runtime"),
  ))
}

// A builder preconfigured with a fast floor and a long interval.
pub fn builder(job_id: &str) -> JobSchedulerBuilder {
  JobScheduler::builder(job_id)
    .min_delay(MIN_DELAY)
    .activity(ConstIntervalScheduler::new(StdDuration::from_secs(10)))
}

/// Collects every event a scheduler publishes, in delivery order.
pub struct Recorder {
  events: Arc<Mutex<Vec<JobEvent>>>,
  observer: Arc<Observer<JobEvent>>,
}

impl Recorder {
  pub fn attach(scheduler: &JobScheduler) -> Self {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let observer = Observer::new(move |e: &JobEvent| sink.lock().push(e.clone()));
    observer.subscribe(JobEventKind::ALL);
    scheduler.subject().attach(&[observer.clone()]);
    Self { events, observer }
  }

  pub fn events(&self) -> Vec<JobEvent> {
    self.events.lock().clone()
  }

  /// Event kinds without log lines.
  pub fn kinds(&self) -> Vec<JobEventKind> {
    use jobkeeper::Event;
    self
      .events
      .lock()
      .iter()
      .map(|e| e.kind())
      .filter(|k| *k != JobEventKind::Log)
      .collect()
  }

  pub fn count(&self, kind: JobEventKind) -> usize {
    self.kinds().iter().filter(|k| **k == kind).count()
  }

  pub fn logs(&self) -> Vec<String> {
    self
      .events
      .lock()
      .iter()
      .filter_map(|e| match e {
        JobEvent::Log { text, .. } => Some(text.clone()),
        _ => None,
      })
      .collect()
  }

  /// Waits until at least `n` events of `kind` were recorded.
  pub async fn wait_for(&self, kind: JobEventKind, n: usize, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      if self.count(kind) >= n {
        return true;
      }
      if tokio::time::Instant::now() >= deadline {
        return false;
      }
      tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
  }

  pub fn observer(&self) -> Arc<Observer<JobEvent>> {
    self.observer.clone()
  }
}

// Builds a task from an async closure, the way a factory would.
pub fn task<F, Fut>(work: F) -> Box<dyn Task>
where
  F: FnOnce() -> Fut + Send + 'static,
  Fut: Future<Output = Result<Vec<TaskValue>, TaskError>> + Send + 'static,
{
  SimpleTask::new("test task", move |_args| work()).boxed()
}

// A factory whose tasks bump `runs`, wait `delay`, and succeed.
pub fn counting_factory(
  runs: Arc<AtomicUsize>,
  delay: StdDuration,
) -> impl Fn(CancellationToken) -> FactoryResult + Send + Sync + 'static {
  move |_token| {
    let runs = runs.clone();
    Ok((
      task(move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Counting task executing.");
        if delay > StdDuration::ZERO {
          tokio::time::sleep(delay).await;
        }
        Ok(vec![])
      }),
      vec![],
    ))
  }
}

// A factory whose tasks always fail.
pub fn failing_factory(
  runs: Arc<AtomicUsize>,
) -> impl Fn(CancellationToken) -> FactoryResult + Send + Sync + 'static {
  move |_token| {
    let runs = runs.clone();
    Ok((
      task(move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::msg("task failed on purpose"))
      }),
      vec![],
    ))
  }
}

// A factory that hands out `limit` succeeding tasks, then fails to create more.
pub fn limited_factory(
  limit: usize,
  runs: Arc<AtomicUsize>,
) -> impl Fn(CancellationToken) -> FactoryResult + Send + Sync + 'static {
  let created = Arc::new(AtomicUsize::new(0));
  move |_token| {
    if created.fetch_add(1, Ordering::SeqCst) >= limit {
      return Err(TaskError::msg("no more tasks"));
    }
    let runs = runs.clone();
    Ok((
      task(move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(vec![TaskValue::new("done")])
      }),
      vec![],
    ))
  }
}

// A factory whose tasks sleep far longer than any test and watch their token.
pub fn blocking_factory() -> impl Fn(CancellationToken) -> FactoryResult + Send + Sync + 'static {
  move |token: CancellationToken| {
    Ok((
      task(move || async move {
        tokio::select! {
          _ = token.cancelled() => Err(TaskError::Cancelled),
          _ = tokio::time::sleep(StdDuration::from_secs(60)) => Ok(vec![]),
        }
      }),
      vec![],
    ))
  }
}
