//! rate_limiter.rs - Per-provider request quota
//!
//! Counts calls inside a window that starts at the first call after the
//! previous window ran out. A denial is returned immediately so the caller
//! can move on to another provider.

use chrono::{DateTime, Utc};

use crate::config::{wall, QuotaConfig};
use crate::error::GateError;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: QuotaConfig,
    window_start: Option<DateTime<Utc>>,
    requests_in_window: u32,
}

impl RateLimiter {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            window_start: None,
            requests_in_window: 0,
        }
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), GateError> {
        self.roll(now);
        if self.requests_in_window >= self.config.max_requests {
            return Err(GateError::QuotaExceeded);
        }
        self.requests_in_window += 1;
        Ok(())
    }

    pub fn has_capacity(&mut self, now: DateTime<Utc>) -> bool {
        self.roll(now);
        self.requests_in_window < self.config.max_requests
    }

    /// The provider itself reported the budget as spent (HTTP 429)
    pub fn exhaust(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.requests_in_window = self.config.max_requests;
    }

    pub fn window_start(&self) -> Option<DateTime<Utc>> {
        self.window_start
    }

    pub fn requests_in_window(&self) -> u32 {
        self.requests_in_window
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        match self.window_start {
            // A clock that stepped backwards keeps the current window
            Some(start) if now < start + wall(self.config.window) => {}
            _ => {
                self.window_start = Some(now);
                self.requests_in_window = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_denies_call_beyond_budget_then_grants_after_rollover() {
        let now = Utc::now();
        let mut limiter = RateLimiter::new(QuotaConfig::per_minute(3));

        for _ in 0..3 {
            assert!(limiter.try_acquire(now).is_ok());
        }
        assert_eq!(limiter.try_acquire(now + Duration::seconds(30)), Err(GateError::QuotaExceeded));
        assert_eq!(limiter.requests_in_window(), 3);

        let next_window = now + Duration::seconds(60);
        assert!(limiter.try_acquire(next_window).is_ok());
        assert_eq!(limiter.requests_in_window(), 1);
        assert_eq!(limiter.window_start(), Some(next_window));
    }

    #[test]
    fn test_clock_going_backwards_stays_in_window() {
        let now = Utc::now();
        let mut limiter = RateLimiter::new(QuotaConfig::per_minute(2));

        assert!(limiter.try_acquire(now).is_ok());
        assert!(limiter.try_acquire(now - Duration::seconds(5)).is_ok());
        assert_eq!(limiter.try_acquire(now - Duration::seconds(10)), Err(GateError::QuotaExceeded));
        assert_eq!(limiter.window_start(), Some(now));
    }

    #[test]
    fn test_exhaust_blocks_until_window_rolls() {
        let now = Utc::now();
        let mut limiter = RateLimiter::new(QuotaConfig::per_minute(10));

        assert!(limiter.try_acquire(now).is_ok());
        limiter.exhaust(now);

        assert!(!limiter.has_capacity(now + Duration::seconds(59)));
        assert!(limiter.has_capacity(now + Duration::seconds(60)));
    }
}
