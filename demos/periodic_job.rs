//! demos/periodic_job.rs
//!
//! Runs a job on a constant interval, pauses it for a while, then closes it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobkeeper::{
  activity::ConstIntervalScheduler, tracing_observer, AppContext, AppIdentity, JobScheduler,
  LocalTaskManager, SimpleTask, TaskError, TaskValue,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobkeeper=debug,periodic_job=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Application Context ---
  let ctx = AppContext::new()
    .with_identity(AppIdentity::new("periodic-demo", env!("CARGO_PKG_VERSION")))
    .with_task_manager(Arc::new(LocalTaskManager::new()?));

  // --- Build Scheduler ---
  let ticks = Arc::new(AtomicUsize::new(0));
  let counter = ticks.clone();
  let scheduler = JobScheduler::builder("heartbeat")
    .activity(ConstIntervalScheduler::new(StdDuration::from_secs(2)))
    .task_factory(move |token| {
      let counter = counter.clone();
      let task = SimpleTask::new("heartbeat", move |_args| async move {
        if token.is_cancelled() {
          return Err(TaskError::Cancelled);
        }
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        info!("*** Heartbeat #{} ***", n);
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        Ok(vec![TaskValue::new(n as u64)])
      });
      Ok((task.boxed(), vec![]))
    })
    .build(&ctx)?;

  scheduler.subject().attach(&[tracing_observer()]);
  scheduler.schedule();
  scheduler.enable(true);

  tokio::time::sleep(StdDuration::from_secs(7)).await;
  info!("Pausing the job...");
  scheduler.enable(false);
  tokio::time::sleep(StdDuration::from_secs(3)).await;
  info!("Resuming the job...");
  scheduler.enable(true);
  tokio::time::sleep(StdDuration::from_secs(5)).await;

  scheduler.close();
  // Give the event queue a moment to flush.
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  info!("Heartbeats: {}", ticks.load(Ordering::SeqCst));
  Ok(())
}
