//! # Backoff policy for restarting crashed workers.
//!
//! [`BackoffPolicy`] controls how restart delays grow as a worker keeps
//! failing. It is parameterized by:
//! - [`BackoffPolicy::quick_attempts`] the number of early failures retried at
//!   the fixed minimum delay;
//! - [`BackoffPolicy::min`] the minimum (and early fixed) delay;
//! - [`BackoffPolicy::max`] the maximum delay cap.
//!
//! The delay for attempt `n` (0-indexed restart count) is `min` while
//! `n < quick_attempts`, and `min × 2^(n - quick_attempts)` clamped to `max`
//! afterwards. The schedule is fully deterministic: a worker that keeps
//! crashing is retried quickly a few times, then exponentially slower.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use modvisor::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::default();
//!
//! // The first three failures are retried at the fixed minimum
//! assert_eq!(backoff.next(0), Duration::from_secs(1));
//! assert_eq!(backoff.next(2), Duration::from_secs(1));
//!
//! // After that the delay doubles, capped at the maximum
//! assert_eq!(backoff.next(3), Duration::from_secs(1));
//! assert_eq!(backoff.next(5), Duration::from_secs(4));
//! assert_eq!(backoff.next(40), Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Restart backoff policy.
///
/// Encapsulates the parameters of the restart delay schedule:
/// - [`BackoffPolicy::quick_attempts`] — early failures retried at `min`;
/// - [`BackoffPolicy::min`] — the fixed early delay and exponential base;
/// - [`BackoffPolicy::max`] — the delay cap.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Number of early failures retried at the fixed [`BackoffPolicy::min`] delay.
    pub quick_attempts: u32,
    /// Fixed delay for the early retries; base of the exponential growth after.
    pub min: Duration,
    /// Maximum delay cap.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    /// Returns the default schedule:
    /// - `quick_attempts = 3`;
    /// - `min = 1s`;
    /// - `max = 60s`.
    fn default() -> Self {
        Self {
            quick_attempts: 3,
            min: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given attempt number (0-indexed).
    ///
    /// Attempts below [`BackoffPolicy::quick_attempts`] return `min` exactly.
    /// Beyond that, the delay is `min × 2^(attempt - quick_attempts)` clamped
    /// to [`BackoffPolicy::max`]. The result is monotonically non-decreasing
    /// in `attempt`.
    pub fn next(&self, attempt: u32) -> Duration {
        if attempt < self.quick_attempts {
            return self.min;
        }

        // Shifts past the cap would overflow; 31 doublings of any sub-day
        // minimum are already far beyond any sane `max`.
        let doublings = (attempt - self.quick_attempts).min(31);
        let scaled = self.min.saturating_mul(1u32 << doublings);
        scaled.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_attempts_return_min() {
        let policy = BackoffPolicy::default();
        for attempt in 0..3 {
            assert_eq!(
                policy.next(attempt),
                Duration::from_millis(1000),
                "attempt {} should use the fixed minimum",
                attempt
            );
        }
    }

    #[test]
    fn test_exponential_growth_after_quick_attempts() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.next(3), Duration::from_secs(1));
        assert_eq!(policy.next(4), Duration::from_secs(2));
        assert_eq!(policy.next(5), Duration::from_secs(4));
        assert_eq!(policy.next(6), Duration::from_secs(8));
        assert_eq!(policy.next(7), Duration::from_secs(16));
        assert_eq!(policy.next(8), Duration::from_secs(32));
    }

    #[test]
    fn test_clamped_to_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(9), Duration::from_secs(60));
        assert_eq!(policy.next(20), Duration::from_secs(60));
    }

    #[test]
    fn test_monotonically_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for attempt in 0..80 {
            let delay = policy.next(attempt);
            assert!(
                delay >= prev,
                "attempt {}: delay {:?} decreased below {:?}",
                attempt,
                delay,
                prev
            );
            prev = delay;
        }
    }

    #[test]
    fn test_huge_attempt_clamps_to_max() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_custom_schedule() {
        let policy = BackoffPolicy {
            quick_attempts: 1,
            min: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(100));
        assert_eq!(policy.next(2), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(350));
    }
}
