//! Exponential backoff policy for dead-letter reclaim scheduling.
//!
//! Reclaim attempts are infrequent and capped, decoupled from the
//! dispatcher's own poll interval: dead-lettering is the exceptional path and
//! must not contend with steady-state throughput.

use std::time::Duration;

/// Backoff policy: `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
///
/// # Default Values
///
/// - `base_delay`: 60 seconds
/// - `max_delay`: 1 hour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            base_delay: None,
            max_delay: None,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Attempt 1 waits `base_delay`, attempt 2 waits twice that, and so on,
    /// never exceeding `max_delay`. Attempt 0 is treated as attempt 1.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1_u32.checked_shl(exponent).unwrap_or(u32::MAX));
        delay.min(self.max_delay)
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl BackoffPolicyBuilder {
    /// Set the delay before the first retry.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set the cap for exponential growth.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_per_attempt() {
        let policy = BackoffPolicy::builder()
            .base_delay(Duration::from_secs(60))
            .build();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(480));
    }

    #[test]
    fn capped_at_max_delay() {
        let policy = BackoffPolicy::default();
        // 60s * 2^6 = 3840s > 1h cap
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(31), Duration::from_secs(3600));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic(base_secs in 1_u64..600, attempt in 1_u32..64) {
            let policy = BackoffPolicy::builder()
                .base_delay(Duration::from_secs(base_secs))
                .build();
            prop_assert!(
                policy.delay_for_attempt(attempt + 1) >= policy.delay_for_attempt(attempt)
            );
            prop_assert!(policy.delay_for_attempt(attempt) <= policy.max_delay.max(policy.base_delay));
        }
    }
}
