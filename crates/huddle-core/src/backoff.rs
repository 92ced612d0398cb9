//! Exponential backoff with jitter, used when a room feed has to resubscribe
//! to its bridge.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Exponential backoff calculator.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_delay_ms: u64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a backoff with a custom configuration.
    #[must_use]
    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms;
        Self {
            config,
            current_delay_ms: initial,
            attempt: 0,
        }
    }

    /// Get the next delay.
    ///
    /// The first call returns the initial delay; later calls grow by the
    /// multiplier up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = if self.attempt == 0 {
            self.config.initial_delay_ms as f64
        } else {
            self.current_delay_ms as f64 * self.config.multiplier
        };
        self.attempt = self.attempt.saturating_add(1);

        let capped = base.min(self.config.max_delay_ms as f64);
        let delay = if self.config.jitter_factor > 0.0 {
            let range = capped * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-range..=range);
            (capped + jitter).max(1.0) as u64
        } else {
            capped.max(1.0) as u64
        };

        self.current_delay_ms = delay;
        Duration::from_millis(delay)
    }

    /// Return to the initial state, after a successful attempt.
    pub fn reset(&mut self) {
        self.current_delay_ms = self.config.initial_delay_ms;
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
