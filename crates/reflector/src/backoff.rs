use std::time::Duration;

/// Exponential retry delay: starts at `initial`, doubles per failure, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self { initial, max, current: initial, failures: 0 }
    }

    /// Delay to wait before the next attempt; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 { self.failures }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}
