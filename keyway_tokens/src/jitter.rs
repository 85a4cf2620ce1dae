//! Utilities for adding a bit of jitter to reduce stampeding

use std::time::Duration;

/// A type that provides some jittering of delays
pub trait JitterSource {
    /// Jitters a given delay
    fn jitter(&self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, delay: Duration) -> Duration {
        delay
    }
}

#[cfg(feature = "rand")]
mod random {
    use std::time::Duration;

    use rand::Rng;

    /// Extends a delay by a random amount
    ///
    /// Delays jittered by this type will have a value with a uniform distribution
    /// in the interval `[delay, delay + max_jitter)`.
    #[derive(Clone, Copy, Debug)]
    pub struct RandomJitter {
        max_jitter: Duration,
    }

    impl RandomJitter {
        /// Constructs a new instance that will extend delays by up to `max_jitter`
        pub fn new(max_jitter: Duration) -> Self {
            Self { max_jitter }
        }
    }

    impl super::JitterSource for RandomJitter {
        fn jitter(&self, delay: Duration) -> Duration {
            let max_millis = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
            if max_millis == 0 {
                return delay;
            }

            let jitter = rand::thread_rng().gen_range(0..max_millis);
            delay.saturating_add(Duration::from_millis(jitter))
        }
    }

}

#[cfg(feature = "rand")]
pub use random::RandomJitter;
