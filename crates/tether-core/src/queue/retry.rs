//! Exponential backoff policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bounded exponential backoff shared by the queue and the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Transient failures tolerated before an operation is dead-lettered
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1000,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count` (1-based): `min(base * 2^(n-1), cap)`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry_count - 1).min(63);
        let delay = self
            .base_delay_ms
            .checked_mul(1_u64 << exponent)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether `retry_count` failures still allow another attempt
    pub const fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count <= self.max_retries
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            max_retries: 3,
        }
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = policy();
        let delays: Vec<u64> = (1..=6)
            .map(|n| u64::try_from(policy.delay_for(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn delays_never_decrease() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for n in 0..200 {
            let delay = policy.delay_for(n);
            assert!(delay >= previous, "delay for {n} decreased");
            previous = delay;
        }
    }

    #[test]
    fn retry_budget_is_inclusive() {
        let policy = policy();
        assert!(policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn cap_below_base_is_invalid() {
        let policy = RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 5,
            max_retries: 1,
        };
        assert!(policy.validate().is_err());
    }
}
