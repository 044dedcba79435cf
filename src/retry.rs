//! Retry policy for failed transfers

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a transfer failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Network drop, timeout, 5xx and similar. Worth another attempt.
    Transient,
    /// 404, unparseable response, local storage failure. Retrying won't help.
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back in the queue, not to start before `delay` elapses
    Requeue { delay: Duration },
    /// Give up and leave the task `failed`
    Fail,
}

/// Exponential backoff with a retry cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after a failure, given how many automatic retries
    /// the task has already used
    pub fn decide(&self, retry_count: u32, class: ErrorClass) -> RetryDecision {
        match class {
            ErrorClass::Permanent => RetryDecision::Fail,
            ErrorClass::Transient if retry_count >= self.max_retries => RetryDecision::Fail,
            ErrorClass::Transient => RetryDecision::Requeue {
                delay: self.backoff(retry_count),
            },
        }
    }

    /// `min(base_delay * 2^retry_count, max_delay)`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_transient_errors_requeue_until_exhausted() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(
            policy.decide(0, ErrorClass::Transient),
            RetryDecision::Requeue {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(
            policy.decide(1, ErrorClass::Transient),
            RetryDecision::Requeue {
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.decide(2, ErrorClass::Transient), RetryDecision::Fail);
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, ErrorClass::Permanent), RetryDecision::Fail);
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(0, ErrorClass::Transient), RetryDecision::Fail);
    }
}
