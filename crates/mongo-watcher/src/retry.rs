//! Reconnect backoff for change stream watchers

use livequery_core::config::ReconnectConfig;
use std::time::Duration;

/// Exponential backoff between reconnect attempts
///
/// Attempts are unbounded; a watcher keeps reconnecting until cancelled.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for Backoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            multiplier: config.multiplier,
        }
    }
}

impl Backoff {
    /// Delay before the given (1-based) consecutive attempt
    ///
    /// A zero initial delay stays zero for every attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_millis(delay as u64), self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(30), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_initial_stays_zero_after_many_attempts() {
        let backoff = Backoff::from(&ReconnectConfig {
            initial_backoff: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(1025), Duration::ZERO);
        assert_eq!(backoff.delay(u32::MAX), Duration::ZERO);

        // Overflowing growth still lands on the cap
        assert_eq!(Backoff::default().delay(1025), Duration::from_secs(10));
    }
}
