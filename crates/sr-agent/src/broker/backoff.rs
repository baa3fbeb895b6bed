//! Reconnection delay policy
//!
//! Delays grow geometrically up to the configured cap. Jitter is added
//! on top of the returned delay so a fleet of agents losing the same
//! broker does not reconnect in lockstep.

use std::time::Duration;

use sr_core::config::BackoffConfig;

/// Capped exponential backoff with jitter
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Return the delay to sleep before the next attempt and advance
    /// the schedule. Jitter extends the delay by at most
    /// `jitter * delay`, never shortens it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = grown.min(self.max);

        delay + Duration::from_secs_f64(delay.as_secs_f64() * self.jitter * rand::random::<f64>())
    }
}
