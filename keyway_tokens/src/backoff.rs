//! Error backoff schedules

use std::time::Duration;

/// Configuration for how long to wait after consecutive failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 100 ms with a multiplier of 2. Maximum delay is
    /// capped at 15 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_millis(100),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// After the first failure, the delay will be `initial_error_delay`. Each
    /// subsequent failure multiplies the delay by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// The delay after the first failure
    #[inline]
    pub fn initial_error_delay(&self) -> Duration {
        self.initial_error_delay
    }

    /// The longest delay this schedule will produce
    #[inline]
    pub fn max_error_delay(&self) -> Duration {
        self.max_error_delay
    }

    /// The delay to apply after the `failures`-th consecutive failure
    ///
    /// Failures are counted from 1; zero is treated as the first failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        self.multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.initial_error_delay.checked_mul(factor))
            .map_or(self.max_error_delay, |delay| delay.min(self.max_error_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_uses_the_initial_delay() {
        let config = ErrorBackoffConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
    }

    #[test]
    fn delay_grows_by_the_multiplier() {
        let config = ErrorBackoffConfig::default();
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(400));
        assert_eq!(config.delay_for(5), Duration::from_millis(1600));
    }

    #[test]
    fn delay_is_capped() {
        let config = ErrorBackoffConfig::default();
        assert_eq!(config.delay_for(9), Duration::from_secs(15));
        assert_eq!(config.delay_for(60), Duration::from_secs(15));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(15));
    }

    #[test]
    fn multiplier_of_one_is_a_constant_delay() {
        let config = ErrorBackoffConfig::new(Duration::from_secs(1), Duration::from_secs(5), 1);
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(40), Duration::from_secs(1));
    }
}
