//! Capped exponential delay between reconnect attempts.
//!
//! There is no attempt limit: the channel retries for as long as the process
//! lives, and the cap only keeps it from hot-looping against a dead backend.
//!
//! ```text
//! attempt  delay (1s initial, x2, 30s cap)
//! 1        1s
//! 2        2s
//! 3        4s
//! 4        8s
//! 5        16s
//! 6+       30s
//! ```

use std::time::Duration;

/// Delay schedule for reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Ceiling for the delay.
    pub max: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl Backoff {
    /// Creates a schedule. A factor below 1 is treated as 1 (fixed delay).
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: factor.max(1.0),
        }
    }

    /// A fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Delay before the retry that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return self.initial.min(self.max);
        }

        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(16));
        assert_eq!(backoff.delay_for(6), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn fixed_never_grows() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        for failures in [1, 2, 10, 1_000] {
            assert_eq!(backoff.delay_for(failures), Duration::from_millis(250));
        }
    }

    #[test]
    fn factor_below_one_is_fixed() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 0.5);
        assert_eq!(backoff.delay_for(4), Duration::from_millis(10));
    }

    #[test]
    fn max_never_below_initial() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 2.0);
        assert_eq!(backoff.delay_for(3), Duration::from_secs(5));
    }
}
