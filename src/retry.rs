//! Time-related building blocks: cancellable sleeping, exponential backoff for
//! uploads, and the bounded poll plan used while a remote task runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Run-wide cancellation flag, cheap to clone and share with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Abstraction over waiting so tests never block on real time.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current thread in short slices, returning early once the
/// token is cancelled.
#[derive(Debug, Clone)]
pub struct ThreadSleeper {
    cancel: CancelToken,
    slice: Duration,
}

impl ThreadSleeper {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            slice: Duration::from_millis(250),
        }
    }
}

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.cancel.is_cancelled() {
            let step = remaining.min(self.slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}

/// Exponential backoff between upload attempts.
///
/// The wait before attempt `n` (n >= 2) is `base * 2^(n-2)`, capped at `max`,
/// so attempt 2 waits `base`, attempt 3 waits `2 * base`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            max: max.max(base),
        }
    }

    /// Delay to wait before `attempt` (1-based). Attempt 1 never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Fixed-interval polling bounded by an iteration count derived from the
/// overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPlan {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPlan {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Maximum number of polls: `ceil(timeout / interval)`, at least one.
    pub fn max_polls(&self) -> u64 {
        let interval = self.interval.as_millis().max(1);
        let timeout = self.timeout.as_millis();
        let polls = timeout.div_ceil(interval).max(1);
        u64::try_from(polls).unwrap_or(u64::MAX)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = BackoffPolicy::new(3, Duration::from_secs(20), Duration::from_secs(300));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(20));
        assert_eq!(policy.delay_before(3), Duration::from_secs(40));
        assert_eq!(policy.delay_before(4), Duration::from_secs(80));
    }

    #[test]
    fn backoff_respects_cap() {
        let policy = BackoffPolicy::new(10, Duration::from_secs(20), Duration::from_secs(300));
        assert_eq!(policy.delay_before(6), Duration::from_secs(300));
        assert_eq!(policy.delay_before(40), Duration::from_secs(300));
    }

    #[test]
    fn backoff_clamps_zero_attempts() {
        let policy = BackoffPolicy::new(0, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.max, Duration::from_secs(1));
    }

    #[test]
    fn poll_plan_rounds_up() {
        let plan = PollPlan::new(Duration::from_secs(3), Duration::from_secs(10));
        assert_eq!(plan.max_polls(), 4);
        let exact = PollPlan::new(Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(exact.max_polls(), 2);
        let zero = PollPlan::new(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(zero.max_polls(), 1);
    }

    #[test]
    fn cancelled_sleeper_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let sleeper = ThreadSleeper::new(token.clone());
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(token.is_cancelled());
    }
}
