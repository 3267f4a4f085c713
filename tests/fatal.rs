//! tests/fatal.rs
//! Conditions that stop a scheduler for good, and application shutdown.

mod common;

use crate::common::{
  app_context, blocking_factory, builder, counting_factory, limited_factory, setup_tracing,
  Recorder,
};
use jobkeeper::{JobEvent, JobEventKind, StopReason, TaskError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_exhaustion_stops_with_no_task_provided() {
  setup_tracing();
  let ctx = app_context();
  let runs = Arc::new(AtomicUsize::new(0));
  let scheduler = builder("limited")
    .activity(jobkeeper::ConstIntervalScheduler::new(StdDuration::from_millis(30)))
    .task_factory(limited_factory(2, runs.clone()))
    .build(&ctx)
    .unwrap();
  let recorder = Recorder::attach(&scheduler);

  scheduler.schedule();
  scheduler.enable(true);
  assert!(
    recorder
      .wait_for(JobEventKind::SchedulerStop, 1, StdDuration::from_secs(3))
      .await,
    "scheduler should stop; got {:?}",
    recorder.kinds()
  );
  tokio::time::sleep(StdDuration::from_millis(150)).await;

  assert_eq!(
    recorder.kinds(),
    vec![
      JobEventKind::SchedulerStarted,
      JobEventKind::SchedulerEnabled,
      JobEventKind::JobStarted,
      JobEventKind::JobFinished,
      JobEventKind::JobStarted,
      JobEventKind::JobFinished,
      JobEventKind::SchedulerStop,
    ]
  );
  assert_eq!(runs.load(Ordering::SeqCst), 2);
  match scheduler.stop_reason() {
    Some(StopReason::NoTaskIsProvided(err)) => assert_eq!(err.to_string(), "no more tasks"),
    other => panic!("unexpected stop reason: {:?}", other),
  }
  assert!(recorder
    .logs()
    .iter()
    .any(|l| l.starts_with("scheduler will stop by reason")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_task_manager_stops_before_any_run() {
  setup_tracing();
  let runs = Arc::new(AtomicUsize::new(0));
  let scheduler = builder("no-manager")
    .task_factory(counting_factory(runs.clone(), StdDuration::ZERO))
    .task_manager_provider(|_| None)
    .build(&jobkeeper::AppContext::new())
    .unwrap();
  let recorder = Recorder::attach(&scheduler);

  scheduler.schedule();
  scheduler.enable(true);
  assert!(
    recorder
      .wait_for(JobEventKind::SchedulerStop, 1, StdDuration::from_secs(2))
      .await
  );
  tokio::time::sleep(StdDuration::from_millis(100)).await;

  assert_eq!(recorder.count(JobEventKind::JobStarted), 0);
  assert_eq!(recorder.count(JobEventKind::SchedulerStop), 1);
  assert_eq!(runs.load(Ordering::SeqCst), 0);
  assert!(matches!(scheduler.stop_reason(), Some(StopReason::NoTaskManager)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_sees_cancellation_of_its_run() {
  setup_tracing();
  let ctx = app_context();
  let cancelled = Arc::new(AtomicUsize::new(0));
  let c = cancelled.clone();
  let scheduler = builder("hooked")
    .task_factory(move |token| {
      let c = c.clone();
      let task = jobkeeper::SimpleTask::new("hooked", move |_| async move {
        token.cancelled().await;
        Err(TaskError::Cancelled)
      })
      .with_cancel_hook(move || {
        c.fetch_add(1, Ordering::SeqCst);
      });
      Ok((task.boxed(), vec![]))
    })
    .build(&ctx)
    .unwrap();
  let recorder = Recorder::attach(&scheduler);

  scheduler.schedule();
  scheduler.enable(true);
  assert!(
    recorder
      .wait_for(JobEventKind::JobStarted, 1, StdDuration::from_secs(2))
      .await
  );
  scheduler.enable(false);
  scheduler.enable(true);
  scheduler.enable(false);
  assert!(
    recorder
      .wait_for(JobEventKind::JobFinished, 1, StdDuration::from_secs(2))
      .await
  );
  // The task's own hook runs exactly once however often the run is cancelled.
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(cancelled.load(Ordering::SeqCst), 1);
  scheduler.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn app_shutdown_interrupts_and_stops_planning() {
  setup_tracing();
  let ctx = app_context();
  let scheduler = builder("shutdown")
    .task_factory(blocking_factory())
    .build(&ctx.child())
    .unwrap();
  let recorder = Recorder::attach(&scheduler);

  scheduler.schedule();
  scheduler.enable(true);
  assert!(
    recorder
      .wait_for(JobEventKind::JobStarted, 1, StdDuration::from_secs(2))
      .await
  );

  ctx.shutdown();
  assert!(
    recorder
      .wait_for(JobEventKind::JobFinished, 1, StdDuration::from_secs(2))
      .await
  );
  tokio::time::sleep(StdDuration::from_millis(150)).await;

  let finished = recorder
    .events()
    .into_iter()
    .find_map(|e| match e {
      JobEvent::JobFinished(f) => Some(f),
      _ => None,
    })
    .unwrap();
  assert!(matches!(finished.find_error(), Some(TaskError::Cancelled)));
  assert_eq!(recorder.count(JobEventKind::JobStarted), 1);
  assert!(!scheduler.is_enabled());
  assert!(scheduler.is_closed());
  assert!(scheduler.stop_reason().is_none());
}
