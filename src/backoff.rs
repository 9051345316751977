// MIT License - Copyright (c) 2026 Peter Wright
// Reconnect delay with capped exponential backoff

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay before reconnect attempt N is `initial * 2^(N-1)`, capped at `max`.
/// A link that stayed up for `reset_after` starts the sequence over.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    reset_after: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, reset_after: Duration) -> Self {
        Self {
            initial,
            max,
            reset_after,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            Duration::from_secs(config.reset_after_secs),
        )
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1u32 << (self.attempt - 1).min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Record how long the last connection stayed up.
    pub fn record_session(&mut self, uptime: Duration) {
        if uptime >= self.reset_after {
            self.attempt = 0;
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
