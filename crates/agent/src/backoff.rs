//! Reconnection backoff.

use std::time::Duration;

/// Configuration for reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Failed attempts before giving up (0 = retry forever).
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 1.5,
            max_retries: 0,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay for a given attempt number (1-based).
    ///
    /// Delays never decrease and never exceed `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_factor.max(1.0);
        let secs = self.initial_delay.as_secs_f64() * factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Attempt counter over a [`ReconnectConfig`].
///
/// One value covers one connect cycle; a new cycle starts a new `Backoff`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Records a failure and returns how long to wait, or `None` once
    /// `max_retries` failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.config.max_retries > 0 && self.attempt >= self.config.max_retries {
            return None;
        }
        Some(self.config.delay_for_attempt(self.attempt))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
