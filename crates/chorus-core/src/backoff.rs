//! Reconnect policy and backoff calculation.
//!
//! The connection manager owns the async side (sleeping, cancellation);
//! this module only holds the parameters and the delay math:
//!
//! - [`ReconnectPolicy`]: attempt limit and delay bounds
//! - [`calculate_backoff_delay`]: capped exponential delay, no jitter

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnect parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Attempts allowed after an unintended close (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}
fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given zero-based attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
        ))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Capped exponential backoff: `min(max_delay, base_delay * 2^attempt)`.
///
/// `attempt` is zero-based. Large attempt numbers saturate instead of
/// overflowing.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    base_delay_ms
        .saturating_mul(1u64 << attempt.min(31))
        .min(max_delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn policy_defaults() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn policy_serde_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"maxAttempts": 2}"#).unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 1000);
    }

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(calculate_backoff_delay(0, 1000, 30_000), 1000);
        assert_eq!(calculate_backoff_delay(1, 1000, 30_000), 2000);
        assert_eq!(calculate_backoff_delay(2, 1000, 30_000), 4000);
        assert_eq!(calculate_backoff_delay(3, 1000, 30_000), 8000);
        assert_eq!(calculate_backoff_delay(4, 1000, 30_000), 16_000);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(calculate_backoff_delay(5, 1000, 30_000), 30_000);
        assert_eq!(calculate_backoff_delay(200, 1000, 30_000), 30_000);
    }

    #[test]
    fn allows_stops_at_limit() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn delay_for_returns_duration() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    proptest! {
        #[test]
        fn delays_never_exceed_cap(attempt in 0u32..1000, base in 1u64..10_000, cap in 1u64..1_000_000) {
            prop_assert!(calculate_backoff_delay(attempt, base, cap) <= cap);
        }

        #[test]
        fn delays_are_non_decreasing(attempt in 0u32..64, base in 1u64..10_000, cap in 1u64..1_000_000) {
            let a = calculate_backoff_delay(attempt, base, cap);
            let b = calculate_backoff_delay(attempt + 1, base, cap);
            prop_assert!(a <= b);
        }
    }
}
