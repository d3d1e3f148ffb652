use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TaskRouteError};

/// Coarse failure classes the retry policy reasons about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Auth,
    Timeout,
    Transport,
    Status(u16),
    InvalidResponse,
}

impl FailureKind {
    pub fn is_transient(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::Transport)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries allowed after a 5xx, independent of the route's transient budget.
    #[serde(default = "default_server_error_retries")]
    pub server_error_retries: u32,
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_factor() -> u32 {
    2
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_server_error_retries() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            server_error_retries: default_server_error_retries(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(TaskRouteError::config("retry.base_delay_ms must be > 0"));
        }
        if self.factor == 0 {
            return Err(TaskRouteError::config("retry.factor must be >= 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(TaskRouteError::config(
                "retry.max_delay_ms must be >= retry.base_delay_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Pure retry/backoff rules. No clock, no I/O, no randomness; jitter is
/// applied separately by [`with_jitter`].
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// `attempt` is the 1-based number of the attempt that just failed;
    /// `server_errors_retried` counts earlier 5xx failures that were retried.
    pub fn decide(
        &self,
        attempt: u32,
        kind: FailureKind,
        max_retries: u32,
        server_errors_retried: u32,
    ) -> RetryDecision {
        if attempt == 0 || attempt > max_retries {
            return RetryDecision::GiveUp;
        }
        let retry = match kind {
            kind if kind.is_transient() => true,
            FailureKind::Status(status) if status >= 500 => {
                server_errors_retried < self.config.server_error_retries
            }
            _ => false,
        };
        if !retry {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.backoff(attempt),
        }
    }

    /// Delay before retry number `retry` (1-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = u64::from(self.config.factor)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let millis = self
            .config
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.config.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Upper bound on a whole dispatch: every attempt times out and every
    /// backoff runs at its full, un-jittered length.
    pub fn deadline(&self, attempt_timeout: Duration, max_retries: u32) -> Duration {
        let attempts = attempt_timeout.saturating_mul(max_retries.saturating_add(1));
        (1..=max_retries)
            .map(|retry| self.backoff(retry))
            .fold(attempts, Duration::saturating_add)
    }
}

/// Equal jitter: keep half the delay, randomize the other half.
pub fn with_jitter(delay: Duration, random: u64) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let half = millis / 2;
    let spread = millis - half;
    Duration::from_millis(half + random % spread.saturating_add(1))
}

pub(crate) fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn backoff_doubles_from_200ms_and_caps_at_2s() {
        let delays: Vec<u128> = (1..=6)
            .map(|retry| policy().backoff(retry).as_millis())
            .collect();
        assert_eq!(delays, [200, 400, 800, 1600, 2000, 2000]);
        assert_eq!(policy().backoff(200), Duration::from_secs(2));
    }

    #[test]
    fn transient_failures_use_the_route_budget() {
        for kind in [FailureKind::Transport, FailureKind::Timeout] {
            assert_eq!(
                policy().decide(1, kind, 2, 0),
                RetryDecision::Retry {
                    delay: Duration::from_millis(200)
                }
            );
            assert_eq!(
                policy().decide(2, kind, 2, 0),
                RetryDecision::Retry {
                    delay: Duration::from_millis(400)
                }
            );
            assert_eq!(policy().decide(3, kind, 2, 0), RetryDecision::GiveUp);
            assert_eq!(policy().decide(2, kind, 1, 0), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn server_errors_are_retried_once() {
        assert!(matches!(
            policy().decide(1, FailureKind::Status(503), 2, 0),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            policy().decide(2, FailureKind::Status(503), 2, 1),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy().decide(1, FailureKind::Status(500), 0, 0),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn server_error_after_a_transient_failure_still_gets_its_retry() {
        assert!(matches!(
            policy().decide(2, FailureKind::Status(503), 2, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            policy().decide(2, FailureKind::Transport, 2, 1),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            policy().decide(3, FailureKind::Status(503), 2, 0),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn terminal_failures_are_never_retried() {
        for kind in [
            FailureKind::Auth,
            FailureKind::Status(400),
            FailureKind::Status(404),
            FailureKind::Status(429),
            FailureKind::InvalidResponse,
        ] {
            assert_eq!(policy().decide(1, kind, 5, 0), RetryDecision::GiveUp, "{kind:?}");
        }
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let delay = Duration::from_millis(400);
        for random in [0, 1, 199, 200, 201, u64::MAX] {
            let jittered = with_jitter(delay, random);
            assert!(jittered >= Duration::from_millis(200), "{jittered:?}");
            assert!(jittered <= delay, "{jittered:?}");
        }
        assert_eq!(with_jitter(Duration::ZERO, 42), Duration::ZERO);
    }

    #[test]
    fn deadline_covers_all_attempts_and_backoffs() {
        let deadline = policy().deadline(Duration::from_secs(30), 2);
        assert_eq!(deadline, Duration::from_millis(90_000 + 200 + 400));
        assert_eq!(
            policy().deadline(Duration::from_secs(60), 0),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn config_validation() {
        RetryConfig::default().validate().unwrap();
        let bad = RetryConfig {
            max_delay_ms: 10,
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
