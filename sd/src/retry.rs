//! Retry policy shared by lease renewal and watch reconnection

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter plus the thresholds at which consecutive
/// failures become a liveness risk and, optionally, fatal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// First retry delay in milliseconds
    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,

    /// Consecutive failures after which a liveness-risk warning is logged
    #[serde(rename = "liveness-risk-after")]
    pub liveness_risk_after: u32,

    /// Consecutive failures after which the role gives up (unset = retry forever)
    #[serde(rename = "escalate-after")]
    pub escalate_after: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            liveness_risk_after: 3,
            escalate_after: Some(60),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(ms)
    }

    /// Delay before retry number `attempt`, jittered into `[base/2, base]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        if base < 2 {
            return Duration::from_millis(base);
        }
        let jittered = rand::rng().random_range(base / 2..=base);
        Duration::from_millis(jittered)
    }

    /// Whether `failures` consecutive failures should be reported as a liveness risk
    pub fn is_liveness_risk(&self, failures: u32) -> bool {
        failures >= self.liveness_risk_after.max(1)
    }

    /// Whether `failures` consecutive failures exhaust the budget
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.escalate_after.is_some_and(|limit| limit > 0 && failures >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            liveness_risk_after: 3,
            escalate_after: Some(5),
        }
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
        assert_eq!(p.base_delay(5), Duration::from_millis(1000));
        assert_eq!(p.base_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let p = policy();
        for attempt in 1..8 {
            let base = p.base_delay(attempt);
            let d = p.delay(attempt);
            assert!(d <= base);
            assert!(d >= base / 2);
        }
    }

    #[test]
    fn test_thresholds() {
        let p = policy();
        assert!(!p.is_liveness_risk(2));
        assert!(p.is_liveness_risk(3));
        assert!(!p.is_exhausted(4));
        assert!(p.is_exhausted(5));

        let forever = RetryPolicy {
            escalate_after: None,
            ..policy()
        };
        assert!(!forever.is_exhausted(u32::MAX));

        let zero = RetryPolicy {
            escalate_after: Some(0),
            ..policy()
        };
        assert!(!zero.is_exhausted(100));
    }

    #[test]
    fn test_deserialize_partial() {
        let p: RetryPolicy = serde_yaml::from_str("escalate-after: null\ninitial-backoff-ms: 50\n").unwrap();
        assert_eq!(p.initial_backoff_ms, 50);
        assert_eq!(p.max_backoff_ms, 5000);
        assert_eq!(p.escalate_after, None);
    }
}
