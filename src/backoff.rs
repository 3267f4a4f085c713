//! Backoff policies used to space out retries after a failed run.
//!
//! A policy yields the delay before the next retry, or `None` to signal
//! "stop": the scheduler then gives up on the job for good.

use std::time::Duration;

/// Produces retry delays for consecutive failures.
pub trait Backoff: Send {
  /// Delay before the next retry, or `None` when the policy gives up.
  fn next_backoff(&mut self) -> Option<Duration>;

  /// Restarts the failure sequence. Called after a success or a cancelled run.
  fn reset(&mut self);
}

impl<B: Backoff + ?Sized> Backoff for Box<B> {
  fn next_backoff(&mut self) -> Option<Duration> {
    (**self).next_backoff()
  }

  fn reset(&mut self) {
    (**self).reset()
  }
}

/// Never retries. This is the default policy of a scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBackoff;

impl Backoff for StopBackoff {
  fn next_backoff(&mut self) -> Option<Duration> {
    None
  }

  fn reset(&mut self) {}
}

/// Retries immediately (subject to the scheduler's minimum delay floor), forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroBackoff;

impl Backoff for ZeroBackoff {
  fn next_backoff(&mut self) -> Option<Duration> {
    Some(Duration::ZERO)
  }

  fn reset(&mut self) {}
}

/// Retries forever with the same delay.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
  delay: Duration,
}

impl ConstantBackoff {
  pub fn new(delay: Duration) -> Self {
    Self { delay }
  }
}

impl Backoff for ConstantBackoff {
  fn next_backoff(&mut self) -> Option<Duration> {
    Some(self.delay)
  }

  fn reset(&mut self) {}
}

/// Exponentially growing delays: `initial * multiplier^n`, capped at `max_interval`.
///
/// With `max_retries` set, the policy stops after that many consecutive retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
  initial: Duration,
  multiplier: f64,
  max_interval: Duration,
  max_retries: Option<u32>,
  attempt: u32,
}

impl Default for ExponentialBackoff {
  /// One minute base, factor 3, capped at five growth steps.
  fn default() -> Self {
    let initial = Duration::from_secs(60);
    Self {
      initial,
      multiplier: 3.0,
      max_interval: initial * 3u32.pow(5),
      max_retries: None,
      attempt: 0,
    }
  }
}

impl ExponentialBackoff {
  pub fn new(initial: Duration, multiplier: f64, max_interval: Duration) -> Self {
    Self {
      initial,
      multiplier: multiplier.max(1.0),
      max_interval,
      max_retries: None,
      attempt: 0,
    }
  }

  /// Gives up after `retries` consecutive retries.
  pub fn with_max_retries(mut self, retries: u32) -> Self {
    self.max_retries = Some(retries);
    self
  }

  /// Number of retries handed out since the last reset.
  pub fn attempt(&self) -> u32 {
    self.attempt
  }
}

impl Backoff for ExponentialBackoff {
  fn next_backoff(&mut self) -> Option<Duration> {
    if let Some(max) = self.max_retries {
      if self.attempt >= max {
        return None;
      }
    }
    let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
    let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
    let delay = if secs.is_finite() && secs < self.max_interval.as_secs_f64() {
      Duration::from_secs_f64(secs)
    } else {
      self.max_interval
    };
    self.attempt = self.attempt.saturating_add(1);
    Some(delay)
  }

  fn reset(&mut self) {
    self.attempt = 0;
  }
}

/// Wraps another policy and stops after `max_retries` consecutive retries.
#[derive(Debug, Clone)]
pub struct WithMaxRetries<B> {
  inner: B,
  max_retries: u32,
  attempt: u32,
}

impl<B: Backoff> WithMaxRetries<B> {
  pub fn new(inner: B, max_retries: u32) -> Self {
    Self {
      inner,
      max_retries,
      attempt: 0,
    }
  }
}

impl<B: Backoff> Backoff for WithMaxRetries<B> {
  fn next_backoff(&mut self) -> Option<Duration> {
    if self.attempt >= self.max_retries {
      return None;
    }
    self.attempt += 1;
    self.inner.next_backoff()
  }

  fn reset(&mut self) {
    self.attempt = 0;
    self.inner.reset();
  }
}

/// Hands out a fixed script of delays, then stops.
#[derive(Debug, Clone)]
pub struct ListBackoff {
  delays: Vec<Duration>,
  position: usize,
}

impl ListBackoff {
  pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
    Self {
      delays: delays.into_iter().collect(),
      position: 0,
    }
  }
}

impl Backoff for ListBackoff {
  fn next_backoff(&mut self) -> Option<Duration> {
    let delay = self.delays.get(self.position).copied();
    if delay.is_some() {
      self.position += 1;
    }
    delay
  }

  fn reset(&mut self) {
    self.position = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stop_backoff_always_stops() {
    let mut b = StopBackoff;
    assert_eq!(b.next_backoff(), None);
    b.reset();
    assert_eq!(b.next_backoff(), None);
  }

  #[test]
  fn exponential_grows_and_caps() {
    let mut b = ExponentialBackoff::new(
      Duration::from_millis(100),
      2.0,
      Duration::from_millis(500),
    );
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(200)));
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(400)));
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(500)));
    assert_eq!(b.attempt(), 4);
    b.reset();
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(100)));
  }

  #[test]
  fn exponential_default_matches_minute_base() {
    let mut b = ExponentialBackoff::default();
    assert_eq!(b.next_backoff(), Some(Duration::from_secs(60)));
    assert_eq!(b.next_backoff(), Some(Duration::from_secs(180)));
  }

  #[test]
  fn exponential_stops_after_max_retries() {
    let mut b = ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(60))
      .with_max_retries(2);
    assert!(b.next_backoff().is_some());
    assert!(b.next_backoff().is_some());
    assert_eq!(b.next_backoff(), None);
    b.reset();
    assert!(b.next_backoff().is_some());
  }

  #[test]
  fn max_retries_wrapper_resets_inner() {
    let mut b = WithMaxRetries::new(ListBackoff::new([Duration::from_secs(1), Duration::from_secs(2)]), 1);
    assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
    assert_eq!(b.next_backoff(), None);
    b.reset();
    assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
  }

  #[test]
  fn list_backoff_runs_out() {
    let mut b = ListBackoff::new([Duration::from_millis(5)]);
    assert_eq!(b.next_backoff(), Some(Duration::from_millis(5)));
    assert_eq!(b.next_backoff(), None);
    assert_eq!(b.next_backoff(), None);
  }
}
