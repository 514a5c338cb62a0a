//! Backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic; the stream client uses
//! them to pace reconnection attempts with lightweight jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling reconnect pacing and the optional attempt bound.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Delay used before the first reconnection attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
    /// Maximum number of consecutive failed attempts before the connection
    /// worker gives up. `None` retries without bound.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Computes the delay to apply before the given attempt.
    ///
    /// `attempt` is 1-based and should correspond to the number of
    /// consecutive failures so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Returns whether another attempt is allowed after `attempt` failures.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            jitter: Duration::from_millis(50),
            max_attempts: None,
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ (u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ReconnectPolicy;

    fn policy_without_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            jitter: Duration::ZERO,
            max_attempts: None,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = policy_without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(400));
    }

    #[test]
    fn unbounded_policy_always_allows_attempts() {
        let policy = policy_without_jitter();
        assert!(policy.allows_attempt(1));
        assert!(policy.allows_attempt(1_000_000));
    }

    #[test]
    fn bounded_policy_stops_after_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(3),
            ..policy_without_jitter()
        };
        assert!(policy.allows_attempt(3));
        assert!(!policy.allows_attempt(4));
    }

    #[test]
    fn jitter_stays_within_configured_bound() {
        let policy = ReconnectPolicy {
            jitter: Duration::from_millis(25),
            ..policy_without_jitter()
        };
        for attempt in 1..16 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(425));
        }
    }
}
