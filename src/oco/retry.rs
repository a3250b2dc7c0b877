//! Retry/backoff policy and the clock it sleeps on.
//!
//! Both the position-confirmation poll and the protective-leg retries go
//! through a [`Clock`], so tests can run them on virtual time and assert
//! the exact waits requested.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// Linear backoff: the n-th wait (0-based) is `step * (n + 1)`, optionally capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub step: Duration,
    pub cap: Option<Duration>,
}

impl Backoff {
    pub fn linear(step: Duration) -> Self {
        Self { step, cap: None }
    }

    pub fn capped(step: Duration, cap: Duration) -> Self {
        Self {
            step,
            cap: Some(cap),
        }
    }

    pub fn delay(&self, n: u32) -> Duration {
        let delay = self.step.saturating_mul(n.saturating_add(1));
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Wait before the given 0-based attempt. The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => self.backoff.delay(n - 1),
        }
    }

    pub fn attempts(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (0..self.max_attempts).map(move |a| (a, self.delay_before(a)))
    }
}

#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` returns immediately after advancing time and
/// recording the requested duration.
#[derive(Default)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
