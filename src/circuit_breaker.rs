//! circuit_breaker.rs - Per-provider circuit breaker
//!
//! ```text
//! Closed   -> Open      consecutive failures reach the threshold
//! Open     -> HalfOpen  cooldown elapsed; one trial call is admitted
//! HalfOpen -> Closed    trial succeeds
//! HalfOpen -> Open      trial fails; cooldown doubles
//! ```
//!
//! Calls admitted while closed can still fail after the circuit has opened.
//! Those late failures are counted but never trip the circuit again.
//!
//! The breaker holds no lock of its own. The registry keeps it behind the
//! provider's mutex together with the rate limiter, and every method takes
//! the current time explicitly.

use chrono::{DateTime, Utc};

use crate::config::{wall, BreakerConfig};
use crate::error::GateError;
use crate::models::CircuitState;

/// How a call was let through; handed back when its outcome is recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    /// The single call let through while half-open
    Trial,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    /// Trips since the last time the circuit closed; drives backoff
    consecutive_trips: u32,
    last_failure_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    disabled: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_trips: 0,
            last_failure_at: None,
            cooldown_until: None,
            trial_in_flight: false,
            disabled: false,
        }
    }

    /// A breaker that stays open forever (provider without credentials)
    pub fn disabled(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Open,
            disabled: true,
            ..Self::new(config)
        }
    }

    /// Ask to place a call. While half-open only one call may be outstanding.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<Permit, GateError> {
        if self.disabled {
            return Err(GateError::Disabled);
        }
        self.refresh(now);

        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => Err(GateError::CircuitOpen),
            CircuitState::HalfOpen if self.trial_in_flight => Err(GateError::CircuitOpen),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(Permit::Trial)
            }
        }
    }

    /// Whether a call would currently be admitted, without claiming anything
    pub fn is_available(&mut self, now: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        self.refresh(now);
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !self.trial_in_flight,
        }
    }

    pub fn record_success(&mut self) {
        if self.disabled {
            return;
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_trips = 0;
        self.cooldown_until = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, permit: Permit) {
        if self.disabled {
            return;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        match (self.state, permit) {
            (CircuitState::HalfOpen, Permit::Trial) => self.trip(now),
            (CircuitState::Closed, _) if self.consecutive_failures >= self.config.failure_threshold => {
                self.trip(now)
            }
            _ => {}
        }
    }

    /// A call was abandoned before it produced a result. Frees the half-open
    /// trial slot without counting anything against the provider.
    pub fn record_cancelled(&mut self, permit: Permit) {
        if permit == Permit::Trial {
            self.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// State as of `now`, applying any elapsed cooldown
    pub fn state_at(&mut self, now: DateTime<Utc>) -> CircuitState {
        self.refresh(now);
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        let cooldown = self.current_cooldown();
        self.state = CircuitState::Open;
        self.cooldown_until = Some(now + wall(cooldown));
        self.consecutive_trips = self.consecutive_trips.saturating_add(1);
        self.trial_in_flight = false;
    }

    fn current_cooldown(&self) -> std::time::Duration {
        let factor = 2u32.saturating_pow(self.consecutive_trips.min(16));
        self.config
            .cooldown
            .saturating_mul(factor)
            .min(self.config.max_cooldown)
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.state != CircuitState::Open {
            return;
        }
        if let Some(until) = self.cooldown_until {
            if now >= until {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = false;
            }
        }
    }
}
