use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;
use tracing::warn;

use crate::LimitError;
use crate::RetryConfig;
use crate::config::saturating_secs;

/// Exponential backoff for operations the remote resource throttled.
///
/// Delay for attempt `n` is `min(base_delay * 2^n, max_delay)`, optionally
/// scaled by a uniform factor in `[0.5, 1.0]`. A server supplied retry-after
/// value replaces the computed delay, clipped to `max_delay`. Once `n` reaches
/// `max_attempts` there is no delay: stop and surface the failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

/// How an attempt run by [`RetryPolicy::execute`] failed.
#[derive(Debug)]
pub enum Failure<E> {
    /// The resource asked us to slow down, optionally saying for how long (seconds).
    Throttled { retry_after: Option<f64>, error: E },
    /// Retrying will not help.
    Fatal(E),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay: saturating_secs(config.base_delay_secs),
            max_delay: saturating_secs(config.max_delay_secs),
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: bool,
    ) -> Result<Self, LimitError> {
        if max_delay < base_delay {
            return Err(LimitError::config(format!(
                "max_delay ({max_delay:?}) must not be less than base_delay ({base_delay:?})"
            )));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        })
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self, LimitError> {
        config.validate()?;
        Self::new(
            config.max_attempts,
            saturating_secs(config.base_delay_secs),
            saturating_secs(config.max_delay_secs),
            config.jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (zero based), or `None` to give up.
    ///
    /// A negative or non-finite `server_retry_after` is ignored.
    pub fn get_retry_delay(&self, attempt: u32, server_retry_after: Option<f64>) -> Option<Duration> {
        self.get_retry_delay_with(&mut rand::rng(), attempt, server_retry_after)
    }

    /// [`Self::get_retry_delay`] with a caller supplied source of jitter.
    pub fn get_retry_delay_with<R>(
        &self,
        rng: &mut R,
        attempt: u32,
        server_retry_after: Option<f64>,
    ) -> Option<Duration>
    where
        R: Rng + ?Sized,
    {
        if attempt >= self.max_attempts {
            return None;
        }
        let max = self.max_delay.as_secs_f64();

        if let Some(hint) = server_retry_after.filter(|s| s.is_finite() && *s >= 0.0) {
            return Some(saturating_secs(hint).min(self.max_delay));
        }

        // powi saturates to infinity rather than overflowing, and min() caps it.
        let exponent = attempt.min(1_023) as i32;
        let mut delay = (self.base_delay.as_secs_f64() * 2f64.powi(exponent)).min(max);
        if self.jitter {
            delay *= rng.random_range(0.5..=1.0);
        }
        Some(saturating_secs(delay).min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails fatally, or throttling outlasts the policy.
    ///
    /// `op` receives the zero based attempt number. Between attempts the calling
    /// thread sleeps for the policy delay. On give-up the last error is returned.
    pub fn execute<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, Failure<E>>,
    {
        let mut attempt = 0;
        loop {
            let (retry_after, error) = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Failure::Fatal(error)) => return Err(error),
                Err(Failure::Throttled { retry_after, error }) => (retry_after, error),
            };

            let Some(delay) = self.get_retry_delay(attempt, retry_after) else {
                warn!(attempts = attempt + 1, "still throttled; giving up");
                return Err(error);
            };
            debug!(attempt, ?delay, ?retry_after, "throttled; backing off");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn fixed(max_attempts: u32, base: f64, max: f64) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_secs_f64(base),
            Duration::from_secs_f64(max),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_exponential_backoff_then_give_up() {
        let policy = fixed(3, 1.0, 10.0);
        assert_eq!(policy.get_retry_delay(0, None), Some(Duration::from_secs(1)));
        assert_eq!(policy.get_retry_delay(1, None), Some(Duration::from_secs(2)));
        assert_eq!(policy.get_retry_delay(2, None), Some(Duration::from_secs(4)));
        assert_eq!(policy.get_retry_delay(3, None), None);
        assert_eq!(policy.get_retry_delay(4, None), None);
    }

    #[test]
    fn test_max_delay_capped() {
        let policy = fixed(20, 1.0, 5.0);
        assert_eq!(policy.get_retry_delay(3, None), Some(Duration::from_secs(5)));
        assert_eq!(policy.get_retry_delay(19, None), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = fixed(u32::MAX, 1.0, 30.0);
        assert_eq!(
            policy.get_retry_delay(u32::MAX - 1, None),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_server_hint_takes_precedence() {
        let policy = fixed(3, 1.0, 10.0);
        assert_eq!(
            policy.get_retry_delay(2, Some(0.5)),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            policy.get_retry_delay(0, Some(120.0)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(policy.get_retry_delay(0, Some(1e300)), Some(Duration::from_secs(10)));
        assert_eq!(policy.get_retry_delay(3, Some(1.0)), None);
    }

    #[test]
    fn test_invalid_server_hint_is_ignored() {
        let policy = fixed(3, 1.0, 10.0);
        for hint in [-1.0, f64::NAN, f64::INFINITY] {
            assert_eq!(
                policy.get_retry_delay(1, Some(hint)),
                Some(Duration::from_secs(2))
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy =
            RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(60), true).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.get_retry_delay_with(&mut rng, 2, None).unwrap();
            assert!(delay >= Duration::from_secs(4), "{delay:?}");
            assert!(delay <= Duration::from_secs(8), "{delay:?}");
        }
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let policy = RetryPolicy::default();
        let a = policy.get_retry_delay_with(&mut StdRng::seed_from_u64(42), 1, None);
        let b = policy.get_retry_delay_with(&mut StdRng::seed_from_u64(42), 1, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_policies_are_rejected() {
        assert!(matches!(
            RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1), false),
            Err(LimitError::Configuration(_))
        ));
        let config = RetryConfig {
            base_delay_secs: -1.0,
            ..RetryConfig::default()
        };
        assert!(RetryPolicy::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 2,
            base_delay_secs: 0.25,
            max_delay_secs: 1.0,
            jitter: false,
        })
        .unwrap();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(
            policy.get_retry_delay(1, None),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_unrepresentable_delays_do_not_panic() {
        let config = RetryConfig {
            base_delay_secs: 1e300,
            max_delay_secs: 1e300,
            ..RetryConfig::default()
        };
        assert!(matches!(
            RetryPolicy::from_config(&config),
            Err(LimitError::Configuration(_))
        ));

        let policy = fixed(3, 1.0, 10.0);
        assert_eq!(
            policy.get_retry_delay(0, Some(1e300)),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_execute_retries_throttled_attempts() {
        let policy = fixed(5, 0.001, 0.01);
        let mut seen = Vec::new();
        let result: Result<&str, &str> = policy.execute(|attempt| {
            seen.push(attempt);
            if attempt < 2 {
                Err(Failure::Throttled {
                    retry_after: None,
                    error: "slow down",
                })
            } else {
                Ok("done")
            }
        });
        assert_eq!(result, Ok("done"));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_execute_gives_up_with_last_error() {
        let policy = fixed(2, 0.001, 0.01);
        let mut calls = 0;
        let result: Result<(), u32> = policy.execute(|attempt| {
            calls += 1;
            Err(Failure::Throttled {
                retry_after: Some(0.0),
                error: attempt,
            })
        });
        assert_eq!(result, Err(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_execute_stops_on_fatal() {
        let policy = fixed(5, 0.001, 0.01);
        let mut calls = 0;
        let result: Result<(), &str> = policy.execute(|_| {
            calls += 1;
            Err(Failure::Fatal("bad request"))
        });
        assert_eq!(result, Err("bad request"));
        assert_eq!(calls, 1);
    }
}
