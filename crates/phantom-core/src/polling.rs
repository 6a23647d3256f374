//! Bounded polling with exponential backoff.
//!
//! Devices in the phantom only expose "are you there yet?" status queries, so
//! every wait is a poll loop. This module keeps those loops honest: each one has
//! a deadline and sleeps between checks instead of spinning on the port.

use crate::error::PhantomResult;
use crate::limits;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Defines how a status query is repeated until it succeeds or time runs out.
///
/// # Example
///
/// ```rust
/// use phantom_core::polling::PollPolicy;
/// use std::time::Duration;
///
/// let policy = PollPolicy::default().with_timeout(Duration::from_secs(5));
/// assert_eq!(policy.timeout, Duration::from_secs(5));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay after the first unsuccessful check.
    pub initial_interval: Duration,

    /// Upper bound for the delay between checks.
    pub max_interval: Duration,

    /// Growth factor applied to the delay after every check (>= 1.0).
    pub backoff_factor: f64,

    /// Total time budget for the wait.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    /// 20 ms first delay, growing by 1.5x up to 500 ms, one minute budget.
    fn default() -> Self {
        Self {
            initial_interval: limits::POLL_INTERVAL,
            max_interval: limits::MAX_POLL_INTERVAL,
            backoff_factor: 1.5,
            timeout: limits::MOVE_TIMEOUT,
        }
    }
}

impl PollPolicy {
    /// Replace the total time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fresh delay sequence for one wait.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_interval,
            max: self.max_interval.max(self.initial_interval),
            factor: self.backoff_factor.max(1.0),
        }
    }
}

/// Exponentially growing delay sequence, capped at a maximum.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    /// Delay to sleep now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        let grown = Duration::try_from_secs_f64(self.next.as_secs_f64() * self.factor)
            .unwrap_or(self.max);
        self.next = grown.min(self.max);
        current
    }
}

/// Run `check` until it yields `true` or the policy deadline passes.
///
/// # Returns
/// - Ok(true) once the check succeeded
/// - Ok(false) if the deadline passed first
/// - Err as soon as a check fails; errors are not retried
pub async fn poll_until<F, Fut>(policy: &PollPolicy, mut check: F) -> PhantomResult<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PhantomResult<bool>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut backoff = policy.backoff();

    loop {
        if check().await? {
            return Ok(true);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }

        let delay = backoff.next_delay().min(deadline - now);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PhantomError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            backoff_factor: 2.0,
            timeout: Duration::from_secs(1),
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn backoff_factor_below_one_is_clamped() {
        let policy = PollPolicy {
            backoff_factor: 0.1,
            ..PollPolicy::default()
        };
        let mut backoff = policy.backoff();
        let first = backoff.next_delay();
        assert!(backoff.next_delay() >= first);
    }

    #[test]
    fn infinite_factor_jumps_to_cap() {
        let policy = PollPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(40),
            backoff_factor: f64::INFINITY,
            timeout: Duration::from_secs(1),
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_succeeds_after_some_checks() {
        let calls = AtomicU32::new(0);
        let ok = poll_until(&PollPolicy::default(), || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) >= 3)
        })
        .await
        .unwrap();

        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out() {
        let policy = PollPolicy::default().with_timeout(Duration::from_secs(2));
        let start = Instant::now();
        let ok = poll_until(&policy, || async { Ok(false) }).await.unwrap();

        assert!(!ok);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_propagates_check_errors() {
        let err = poll_until(&PollPolicy::default(), || async {
            Err(PhantomError::protocol("test", "garbled"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PhantomError::Protocol { .. }));
    }
}
