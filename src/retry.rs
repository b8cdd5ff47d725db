//! Retry backoff computation. Pure, no I/O.

use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The exponent is capped so the delay saturates at `1024 * base_interval`
/// and the multiplication cannot overflow.
const MAX_EXPONENT: u32 = 10;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// `base_interval * 2^n` for the n-th attempt, capped at `2^10`.
    #[default]
    Exponential,
    /// Always `base_interval`.
    Fixed,
}

impl FromStr for RetryStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(RetryStrategy::Exponential),
            "fixed" => Ok(RetryStrategy::Fixed),
            other => Err(Error::InvalidStrategy(other.to_owned())),
        }
    }
}

/// Strategy plus base interval, shared by every worker in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How the delay grows with the attempt count.
    pub strategy: RetryStrategy,
    /// The base delay unit.
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            strategy: RetryStrategy::Exponential,
            base_interval: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following the just-completed attempt
    /// `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            RetryStrategy::Fixed => self.base_interval,
            RetryStrategy::Exponential => {
                self.base_interval * 2u32.pow(attempt.min(MAX_EXPONENT))
            }
        }
    }

    /// [`delay`](Self::delay) plus a uniform random jitter of up to 10%, so
    /// jobs that failed together do not retry in lockstep.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter_millis = (delay.as_millis() / 10) as u64;
        if jitter_millis == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            base_interval: Duration::from_secs(1),
        };
        for attempt in [1, 2, 5, 100] {
            assert_eq!(policy.delay(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Exponential,
            base_interval: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(10), Duration::from_secs(5 * 1024));
    }

    #[test]
    fn exponential_delay_saturates_at_cap() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Exponential,
            base_interval: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(11), policy.delay(10));
        assert_eq!(policy.delay(1000), policy.delay(10));
    }

    #[test]
    fn jitter_is_bounded_above_by_ten_percent() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            base_interval: Duration::from_secs(10),
        };
        for _ in 0..100 {
            let jittered = policy.delay_with_jitter(1);
            assert!(jittered >= Duration::from_secs(10));
            assert!(jittered <= Duration::from_secs(11));
        }
    }

    #[test]
    fn strategy_parses_from_config_strings() {
        assert_eq!(
            "exponential".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Exponential
        );
        assert_eq!("fixed".parse::<RetryStrategy>().unwrap(), RetryStrategy::Fixed);
        assert!("linear".parse::<RetryStrategy>().is_err());
    }
}
