use std::time::Duration;

use rand::Rng;

/// Exponential backoff policy with jitter.
///
/// A sink that exhausts `max_attempts` is considered unhealthy and the
/// pipeline halts rather than letting the event queue grow without bound.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay to sleep before retrying, or `None` once the retry budget
    /// is exhausted. Jitter is up to half the computed interval.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }

        let exp = self.config.initial_interval.as_secs_f64()
            * self.config.multiplier.powi(self.attempt as i32);
        let capped = exp.min(self.config.max_interval.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..capped / 2.0);

        self.attempt += 1;
        Some(Duration::from_secs_f64(capped + jitter))
    }
}
