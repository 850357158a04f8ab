use std::time::Duration;

use tokio::time::Instant;

use super::config::RetryConfig;

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    started: Instant,
    next: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let next = config.initial_delay;
        Self {
            config,
            failures: 0,
            started: Instant::now(),
            next,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.failures
    }

    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once the attempt or time budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;

        if let Some(max_attempts) = self.config.max_attempts
            && self.failures >= max_attempts
        {
            return None;
        }

        let delay = self.next;
        if let Some(max_elapsed) = self.config.max_elapsed
            && self.started.elapsed() + delay > max_elapsed
        {
            return None;
        }

        let grown = delay.mul_f64(self.config.multiplier.max(1.0));
        self.next = grown.min(self.config.max_delay);
        Some(delay)
    }
}
