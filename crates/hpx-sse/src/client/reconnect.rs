use std::time::Duration;

use rand::Rng;

/// Retry policy for a [`Subscription`](super::Subscription).
///
/// With the defaults the delay is a fixed `interval`; set `backoff_factor`
/// above 1.0 for exponential backoff capped at `max_interval`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub interval: Duration,
    /// Attempts allowed before the subscription gives up. Reset by a
    /// successful open.
    pub max_attempts: u32,
    /// Backoff multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    pub max_interval: Duration,
    /// Random jitter factor (0.0–1.0).
    pub jitter: f64,
    /// Use the server's `retry:` advisory in place of `interval`.
    pub respect_server_retry: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_attempts: 5,
            backoff_factor: 1.0,
            max_interval: Duration::from_secs(60),
            jitter: 0.0,
            respect_server_retry: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create a fixed-interval policy.
    #[must_use]
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the base interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff factor.
    #[must_use]
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max_interval = max;
        self
    }

    /// Set the jitter factor.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set whether the server's `retry:` advisory overrides `interval`.
    #[must_use]
    pub fn respect_server_retry(mut self, respect: bool) -> Self {
        self.respect_server_retry = respect;
        self
    }

    /// Validate the policy.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("Reconnect interval must be > 0".to_string());
        }
        if self.max_interval < self.interval {
            return Err("Max reconnect interval must be >= reconnect interval".to_string());
        }
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay before the reconnection attempt with zero-based index
    /// `attempt`.
    pub fn delay_for(&self, attempt: u32, server_hint: Option<Duration>) -> Duration {
        let initial = match server_hint {
            Some(hint) if self.respect_server_retry && !hint.is_zero() => hint,
            _ => self.interval,
        };
        calculate_backoff(
            initial,
            self.max_interval.max(initial),
            self.backoff_factor,
            self.jitter,
            attempt,
        )
    }
}

fn calculate_backoff(
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
) -> Duration {
    let exponent = factor.powf(f64::from(attempt));
    let base = (initial.as_secs_f64() * exponent).min(max.as_secs_f64());

    if jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - jitter) + randomized * jitter;
    Duration::from_secs_f64(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(1000));
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_fixed_interval_by_default() {
        let policy = ReconnectPolicy::new(Duration::from_millis(250), 3);
        for attempt in 0..3 {
            assert_eq!(policy.delay_for(attempt, None), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::default()
            .backoff_factor(2.0)
            .max_interval(Duration::from_secs(3));
        assert_eq!(policy.delay_for(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5, None), Duration::from_secs(3));
    }

    #[test]
    fn test_server_hint() {
        let policy = ReconnectPolicy::default();
        let hint = Some(Duration::from_millis(4000));
        assert_eq!(policy.delay_for(0, hint), Duration::from_millis(4000));

        let policy = policy.respect_server_retry(false);
        assert_eq!(policy.delay_for(0, hint), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_base() {
        let policy = ReconnectPolicy::default().jitter(1.0);
        for _ in 0..32 {
            assert!(policy.delay_for(0, None) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_validation() {
        let policy = ReconnectPolicy::default().interval(Duration::ZERO);
        assert_eq!(
            policy.validate().expect_err("should fail"),
            "Reconnect interval must be > 0"
        );

        let policy = ReconnectPolicy::default().backoff_factor(0.5);
        assert_eq!(
            policy.validate().expect_err("should fail"),
            "Backoff factor must be >= 1.0"
        );

        let policy = ReconnectPolicy::default().jitter(1.5);
        assert_eq!(
            policy.validate().expect_err("should fail"),
            "Jitter must be between 0.0 and 1.0"
        );

        let policy = ReconnectPolicy::default().max_interval(Duration::from_millis(10));
        assert!(policy.validate().is_err());
    }
}
