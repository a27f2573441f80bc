use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter for automatic read retries.
///
/// Each delay is drawn from `[current / 2, current]`, then `current`
/// doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current.as_millis() as u64;
        let floor = ceiling / 2;
        let millis = rand::thread_rng().gen_range(floor..=ceiling);

        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        Duration::from_millis(millis)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
