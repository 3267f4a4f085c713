//! demos/retry_backoff.rs
//!
//! A job that keeps failing is retried with exponential backoff until the
//! policy gives up and the scheduler stops.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::{
  activity::ConstIntervalScheduler, backoff::ExponentialBackoff, AppContext, JobEvent,
  JobEventKind, JobScheduler, LocalTaskManager, Observer, SimpleTask, TaskError,
};
use tokio::sync::Notify;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobkeeper=info,retry_backoff=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let ctx = AppContext::new().with_task_manager(Arc::new(LocalTaskManager::new()?));

  let scheduler = JobScheduler::builder("flaky-upload")
    .activity(ConstIntervalScheduler::new(StdDuration::from_secs(60)))
    .backoff(
      ExponentialBackoff::new(StdDuration::from_millis(250), 2.0, StdDuration::from_secs(2))
        .with_max_retries(4),
    )
    .min_delay(StdDuration::from_millis(100))
    .task_factory(|_token| {
      let task = SimpleTask::new("upload", |_args| async {
        Err(TaskError::msg("remote end is unavailable"))
      });
      Ok((task.boxed(), vec![]))
    })
    .build(&ctx)?;

  let stopped = Arc::new(Notify::new());
  let signal = stopped.clone();
  let watcher = Observer::new(move |event: &JobEvent| match event {
    JobEvent::JobFinished(finished) => {
      if let Some(err) = finished.find_error() {
        warn!(round = finished.round, error = %err, "Upload attempt failed.");
      }
    }
    JobEvent::SchedulerStop { reason, .. } => {
      info!(reason = reason.name(), "Scheduler gave up.");
      signal.notify_one();
    }
    _ => {}
  });
  watcher.subscribe([JobEventKind::JobFinished, JobEventKind::SchedulerStop]);
  scheduler.subject().attach(&[watcher]);

  scheduler.schedule();
  scheduler.enable(true);

  stopped.notified().await;
  info!(rounds = scheduler.rounds(), "Done.");
  scheduler.close();
  Ok(())
}
