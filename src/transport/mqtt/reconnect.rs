//! Pure reconnection policy
//!
//! Retries are unbounded; the delay between attempts doubles after every
//! failure up to a ceiling and returns to the base after a success.

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with a ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(base);
        Self {
            base,
            ceiling,
            current: base,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    /// Delay to wait before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failed attempt and return the next delay
    pub fn on_failure(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        self.current
    }

    /// Back to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectDecision {
    /// Sleep for `delay`, then attempt connection number `attempt` of this streak
    Proceed { attempt: u32, delay: Duration },
    /// `disconnect()` cancelled the loop
    AbortCancelled,
    /// No broker configuration is stored to reconnect with
    AbortNoBrokerConfig,
}

/// Determine whether the reconnect loop should continue (pure function)
pub fn should_attempt_reconnection(
    attempts_in_streak: u32,
    backoff: &Backoff,
    cancelled: bool,
    has_broker_config: bool,
) -> ReconnectDecision {
    if cancelled {
        return ReconnectDecision::AbortCancelled;
    }
    if !has_broker_config {
        return ReconnectDecision::AbortNoBrokerConfig;
    }
    ReconnectDecision::Proceed {
        attempt: attempts_in_streak.saturating_add(1),
        delay: backoff.current(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut backoff = Backoff::new(ms(1000), ms(30_000));
        assert_eq!(backoff.current(), ms(1000));

        let delays: Vec<Duration> = (0..7).map(|_| backoff.on_failure()).collect();
        assert_eq!(
            delays,
            vec![
                ms(2000),
                ms(4000),
                ms(8000),
                ms(16_000),
                ms(30_000),
                ms(30_000),
                ms(30_000)
            ]
        );
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(ms(100), ms(1000));
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.current(), ms(100));
    }

    #[test]
    fn test_ceiling_below_base_is_raised() {
        let backoff = Backoff::new(ms(500), ms(100));
        assert_eq!(backoff.current(), ms(500));
        let mut backoff = backoff;
        assert_eq!(backoff.on_failure(), ms(500));
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let backoff = Backoff::from_config(&ReconnectConfig::default());

        assert_eq!(
            should_attempt_reconnection(0, &backoff, false, true),
            ReconnectDecision::Proceed {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            should_attempt_reconnection(3, &backoff, true, true),
            ReconnectDecision::AbortCancelled
        );
        assert_eq!(
            should_attempt_reconnection(3, &backoff, false, false),
            ReconnectDecision::AbortNoBrokerConfig
        );
    }

    proptest! {
        #[test]
        fn backoff_is_monotone_and_capped(
            base in 1u64..5_000,
            extra in 0u64..60_000,
            failures in 0usize..40,
        ) {
            let ceiling = base + extra;
            let mut backoff = Backoff::new(ms(base), ms(ceiling));
            let mut previous = backoff.current();
            for _ in 0..failures {
                let next = backoff.on_failure();
                prop_assert!(next >= previous);
                prop_assert!(next <= ms(ceiling));
                previous = next;
            }
            backoff.reset();
            prop_assert_eq!(backoff.current(), ms(base));
        }
    }
}
