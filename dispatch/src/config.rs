//! Loop tuning configuration, loaded from environment variables with
//! sensible defaults.

use std::env;
use std::time::Duration;

/// Tuning knobs for the dispatcher and reclaimer loops.
///
/// All durations are configured as integer seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How often the dispatcher polls for pending outbox rows.
    pub poll_interval: Duration,
    /// Maximum rows claimed per dispatch cycle.
    pub batch_size: usize,
    /// How often the reclaimer polls for eligible dead-letter entries.
    pub dlq_poll_interval: Duration,
    /// Maximum entries processed per reclaim cycle.
    pub dlq_batch_size: usize,
    /// Reclaim attempts before an entry is quarantined.
    pub max_retries: i32,
    /// Delay before the first reclaim retry; doubles per attempt.
    pub base_retry_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 25,
            dlq_poll_interval: Duration::from_secs(30),
            dlq_batch_size: 50,
            max_retries: 5,
            base_retry_delay: Duration::from_secs(60),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_secs("OUTBOX_POLL_INTERVAL_SECS", defaults.poll_interval),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", defaults.batch_size),
            dlq_poll_interval: env_secs("DLQ_POLL_INTERVAL_SECS", defaults.dlq_poll_interval),
            dlq_batch_size: env_parse("DLQ_BATCH_SIZE", defaults.dlq_batch_size),
            max_retries: env_parse("DLQ_MAX_RETRIES", defaults.max_retries),
            base_retry_delay: env_secs("DLQ_BASE_DELAY_SECS", defaults.base_retry_delay),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(default, Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DispatchConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.dlq_poll_interval, Duration::from_secs(30));
        assert_eq!(config.dlq_batch_size, 50);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn unset_env_falls_back_to_defaults() {
        // Env-var readers are exercised indirectly: an unset or garbage
        // variable must yield the default rather than an error.
        assert_eq!(env_parse("RELAYBOX_TEST_UNSET_VAR", 25_usize), 25);
        assert_eq!(
            env_secs("RELAYBOX_TEST_UNSET_VAR", Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}
