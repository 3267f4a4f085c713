//! Activity schedulers decide when a job should run next.
//!
//! They only look at the time of the last successful run; failures are
//! handled separately by a [`Backoff`](crate::backoff::Backoff) policy.

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

/// Computes the next activation time of a job.
pub trait ActivityScheduler: Send + Sync {
  /// Returns the next activation time given the last successful activation.
  ///
  /// `None` means the job never succeeded yet: "run as soon as possible".
  /// Times in the past are fine, the scheduler treats them as "now".
  fn next_activation(&self, last: Option<DateTime<Utc>>) -> DateTime<Utc>;
}

impl<F> ActivityScheduler for F
where
  F: Fn(Option<DateTime<Utc>>) -> DateTime<Utc> + Send + Sync,
{
  fn next_activation(&self, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    self(last)
  }
}

/// Runs the job every `interval`, measured from the last successful run.
///
/// If the last success is longer ago than `interval`, the job is due now.
#[derive(Clone, Copy)]
pub struct ConstIntervalScheduler {
  interval: ChronoDuration,
}

impl ConstIntervalScheduler {
  pub fn new(interval: StdDuration) -> Self {
    let interval = ChronoDuration::from_std(interval).unwrap_or_else(|e| {
      warn!(?interval, error = %e, "Interval is out of range, clamping to a century.");
      ChronoDuration::weeks(52 * 100)
    });
    Self { interval }
  }

  pub fn interval(&self) -> StdDuration {
    self.interval.to_std().unwrap_or(StdDuration::MAX)
  }
}

impl fmt::Debug for ConstIntervalScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConstIntervalScheduler")
      .field("interval", &self.interval())
      .finish()
  }
}

impl ActivityScheduler for ConstIntervalScheduler {
  fn next_activation(&self, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let Some(start) = last else {
      return now;
    };
    let elapsed = now.signed_duration_since(start);
    if elapsed < ChronoDuration::zero() {
      return start;
    }
    if elapsed > self.interval {
      return now;
    }
    start.checked_add_signed(self.interval).unwrap_or(now)
  }
}
