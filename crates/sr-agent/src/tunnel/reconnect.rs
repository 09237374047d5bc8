//! Reconnect delays

use std::time::Duration;

use rand::Rng;

use sr_core::config::BackoffConfig;

/// Exponential backoff with jitter between connection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    /// Random extra delay as a fraction of the base delay
    jitter: f64,
    /// Base delay for the next attempt
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a backoff with explicit parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            current: initial.min(max),
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the backoff
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts = self.attempts.saturating_add(1);

        let grown = base.as_secs_f64() * self.multiplier;
        self.current = if grown >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(grown)
        };

        if self.jitter > 0.0 {
            let extra = base.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
            base + Duration::from_secs_f64(extra)
        } else {
            base
        }
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
        self.attempts = 0;
    }

    /// Attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: u64, max: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_secs(initial),
            Duration::from_secs(max),
            2.0,
            0.0,
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = no_jitter(1, 60);
        let delays: Vec<u64> = (0..4).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8]);
        assert_eq!(backoff.attempts(), 4);
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = no_jitter(30, 60);
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = no_jitter(1, 60);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.5);
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
