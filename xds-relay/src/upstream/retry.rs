//! Reconnect backoff for upstream streams.

use std::time::Duration;

use crate::error::{Error, Result};

/// Backoff policy for re-establishing upstream streams.
///
/// The delay grows exponentially from `initial_backoff` up to `max_backoff`,
/// and every delay is spread by a random `jitter` fraction so that streams
/// that failed together do not reconnect together.
///
/// Reconnection never gives up. Once more than `retry_ceiling` consecutive
/// attempts have failed, the failures are reported at error level.
///
/// # Example
///
/// ```
/// use xds_relay::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_millis(500)).unwrap()
///     .with_max_backoff(Duration::from_secs(10)).unwrap()
///     .with_jitter(0.1).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first reconnect attempt.
    ///
    /// Default: 1 second.
    pub initial_backoff: Duration,

    /// Upper bound for the un-jittered delay.
    ///
    /// Default: 30 seconds.
    pub max_backoff: Duration,

    /// Growth factor applied after each failed attempt.
    ///
    /// Default: 2.0.
    pub backoff_multiplier: f64,

    /// Fraction of the delay added or removed at random, in `[0, 1]`.
    ///
    /// Default: 0.2.
    pub jitter: f64,

    /// Consecutive failures after which reconnects are logged as errors.
    ///
    /// Default: None (always logged as warnings).
    pub retry_ceiling: Option<usize>,
}

impl RetryPolicy {
    /// Create a policy with custom delays and the default jitter.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backoff_multiplier` is less than 1.0
    /// - `max_backoff` is less than `initial_backoff`
    /// - `initial_backoff` is zero
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }

        if backoff_multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }

        if max_backoff < initial_backoff {
            return Err(Error::Validation(format!(
                "max_backoff ({max_backoff:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }

        Ok(Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            ..Self::default()
        })
    }

    /// Set the initial backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is zero or greater than `max_backoff`.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if duration > self.max_backoff {
            let max_backoff = self.max_backoff;
            return Err(Error::Validation(format!(
                "initial_backoff ({duration:?}) must be <= max_backoff ({max_backoff:?})"
            )));
        }
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Set the maximum backoff duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `duration` is less than `initial_backoff`.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration < self.initial_backoff {
            let initial_backoff = self.initial_backoff;
            return Err(Error::Validation(format!(
                "max_backoff ({duration:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }
        self.max_backoff = duration;
        Ok(self)
    }

    /// Set the backoff multiplier.
    ///
    /// # Errors
    ///
    /// Returns an error if `multiplier` is less than 1.0.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    /// Set the jitter fraction.
    ///
    /// # Errors
    ///
    /// Returns an error if `jitter` is outside `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&jitter) {
            return Err(Error::Validation(format!(
                "jitter must be within [0, 1], got {jitter}"
            )));
        }
        self.jitter = jitter;
        Ok(self)
    }

    /// Set the number of failures after which reconnects are logged as errors.
    pub fn with_retry_ceiling(mut self, ceiling: Option<usize>) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// The un-jittered delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// ```
    /// use xds_relay::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_duration(0), Duration::from_secs(1));
    /// assert_eq!(policy.backoff_duration(1), Duration::from_secs(2));
    /// assert_eq!(policy.backoff_duration(10), Duration::from_secs(30));
    /// ```
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let ceiling = self.max_backoff.as_secs_f64() / self.initial_backoff.as_secs_f64();
        if !multiplier.is_finite() || multiplier >= ceiling {
            return self.max_backoff;
        }
        self.initial_backoff.mul_f64(multiplier)
    }

    /// Spread `delay` by a random fraction of at most `jitter`.
    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = self.jitter * (2.0 * fastrand::f64() - 1.0);
        delay.mul_f64(1.0 + spread)
    }
}

impl Default for RetryPolicy {
    /// Defaults:
    /// - `initial_backoff`: 1 second
    /// - `max_backoff`: 30 seconds
    /// - `backoff_multiplier`: 2.0
    /// - `jitter`: 0.2
    /// - `retry_ceiling`: None
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            retry_ceiling: None,
        }
    }
}

/// Stateful backoff calculator based on a [`RetryPolicy`].
///
/// ```
/// use xds_relay::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default().with_jitter(0.0).unwrap();
/// let mut backoff = Backoff::new(policy);
///
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
///
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Create a new backoff calculator from a retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get the next jittered delay and advance the attempt counter.
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.policy.backoff_duration(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.policy.apply_jitter(delay)
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Returns true once the failures exceed the policy's retry ceiling.
    pub fn past_ceiling(&self) -> bool {
        self.policy
            .retry_ceiling
            .is_some_and(|ceiling| self.attempt > ceiling)
    }

    /// Reset after a healthy stream.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
