//! Retry policy: bounded attempts with exponential backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::RetryConfig;

/// Decides whether a failed task is requeued and when.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0 disables).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            multiplier: 2.0,
            max_delay: config.max_delay,
            jitter: 0.1,
        }
    }

    /// No jitter: the same attempt always gets the same delay.
    pub fn deterministic(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the retry that follows failure number `attempts` (1-indexed):
    /// `base_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let mut delay = Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()));
        if self.jitter > 0.0 && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay = delay.mul_f64(1.0 + extra).min(self.max_delay);
        }
        delay
    }

    /// When a task that has now failed `attempts` times may run again, or
    /// `None` once `max_retries` is used up.
    pub fn schedule(
        &self,
        attempts: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if attempts > max_retries {
            return None;
        }
        let delay = chrono::Duration::from_std(self.next_delay(attempts)).ok()?;
        Some(now + delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::default().deterministic();

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default().deterministic();
        assert_eq!(policy.next_delay(30), Duration::from_secs(300));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.next_delay(2);
            assert!(d >= Duration::from_secs(4));
            assert!(d < Duration::from_secs_f64(4.5));
        }
    }

    #[test]
    fn schedule_stops_after_budget() {
        let policy = RetryPolicy::default().deterministic();
        let now = Utc::now();
        assert_eq!(policy.schedule(1, 2, now), Some(now + chrono::Duration::seconds(2)));
        assert_eq!(policy.schedule(2, 2, now), Some(now + chrono::Duration::seconds(4)));
        assert_eq!(policy.schedule(3, 2, now), None);
        assert_eq!(policy.schedule(1, 0, now), None);
    }
}
