// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Retries after the first attempt. Past this the batch fails.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

/// Exponential backoff with jitter for a single batch.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    current_backoff: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or None once the retry ceiling is
    /// reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_retries {
            return None;
        }
        self.attempts += 1;

        let backoff_ms = self.current_backoff.as_millis() as i64;

        let mut v = backoff_ms / 2;
        // avoid div by zero
        if v == 0 {
            v = 1;
        }

        let jitter = (rand::random::<i64>() % v) - (v / 2);
        let mut sleep_ms = backoff_ms + jitter;
        if sleep_ms < 0 {
            sleep_ms = 1;
        }

        self.current_backoff = std::cmp::min(self.current_backoff * 2, self.config.max_backoff);

        Some(Duration::from_millis(sleep_ms as u64))
    }
}
