//! registry.rs - Process-wide provider state
//!
//! One [`ProviderHandle`] per configured provider, created at startup and
//! passed to the price service. Each handle keeps its circuit breaker and
//! rate limiter behind its own mutex, so concurrent requests see one
//! serialized view per provider and never contend across providers.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::circuit_breaker::{CircuitBreaker, Permit};
use crate::config::{BreakerConfig, PricingConfig};
use crate::error::{ConfigError, GateError, ProviderError};
use crate::models::{CircuitState, PriceKey, ProviderState};
use crate::price_feed::{
    http_client, BanxicoSource, ExchangeRateApiSource, GoldApiSource, MetalsApiSource, PriceSource,
};
use crate::rate_limiter::RateLimiter;

#[derive(Debug)]
struct Gate {
    breaker: CircuitBreaker,
    limiter: RateLimiter,
}

pub struct ProviderHandle {
    source: Arc<dyn PriceSource>,
    gate: Mutex<Gate>,
}

impl ProviderHandle {
    pub fn new(source: Arc<dyn PriceSource>, breaker: BreakerConfig) -> Self {
        let limiter = RateLimiter::new(source.quota());
        ProviderHandle {
            source,
            gate: Mutex::new(Gate {
                breaker: CircuitBreaker::new(breaker),
                limiter,
            }),
        }
    }

    /// A provider that is never called, e.g. because its key is missing
    pub fn disabled(source: Arc<dyn PriceSource>, breaker: BreakerConfig) -> Self {
        let limiter = RateLimiter::new(source.quota());
        ProviderHandle {
            source,
            gate: Mutex::new(Gate {
                breaker: CircuitBreaker::disabled(breaker),
                limiter,
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub fn source(&self) -> Arc<dyn PriceSource> {
        Arc::clone(&self.source)
    }

    pub fn supports(&self, key: &PriceKey) -> bool {
        self.source.supports(key)
    }

    /// Claim a slot for one call: the circuit must admit it and the quota
    /// must have room. Either both are claimed or neither is. The returned
    /// permit goes back with the call's outcome.
    pub fn admit(&self, now: DateTime<Utc>) -> Result<Permit, GateError> {
        let mut gate = self.lock();

        if gate.breaker.is_disabled() {
            return Err(GateError::Disabled);
        }
        if !gate.breaker.is_available(now) {
            return Err(GateError::CircuitOpen);
        }
        gate.limiter.try_acquire(now)?;
        gate.breaker.try_acquire(now)
    }

    pub fn report_success(&self) {
        let mut gate = self.lock();
        if gate.breaker.state() == CircuitState::HalfOpen {
            info!("{}: trial call succeeded, circuit closed", self.source_id());
        }
        gate.breaker.record_success();
    }

    pub fn report_failure(&self, error: &ProviderError, permit: Permit, now: DateTime<Utc>) {
        let mut gate = self.lock();

        if let ProviderError::Unsupported(_) = error {
            gate.breaker.record_cancelled(permit);
            return;
        }
        if error.is_rate_limited() {
            debug!("{}: provider reported quota exhausted", self.source_id());
            gate.limiter.exhaust(now);
        }

        let was_open = gate.breaker.state() == CircuitState::Open;
        gate.breaker.record_failure(now, permit);
        if !was_open && gate.breaker.state() == CircuitState::Open {
            warn!(
                "{}: circuit opened after {} consecutive failures, cooling down until {:?}",
                self.source_id(),
                gate.breaker.consecutive_failures(),
                gate.breaker.cooldown_until()
            );
        }
    }

    /// The call was abandoned (quorum reached or request deadline); it says
    /// nothing about the provider's health.
    pub fn report_cancelled(&self, permit: Permit) {
        self.lock().breaker.record_cancelled(permit);
    }

    pub fn state(&self) -> ProviderState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> ProviderState {
        let mut gate = self.lock();
        let circuit_state = gate.breaker.state_at(now);
        ProviderState {
            source_id: self.source_id().to_string(),
            circuit_state,
            consecutive_failures: gate.breaker.consecutive_failures(),
            last_failure_at: gate.breaker.last_failure_at(),
            cooldown_until: gate.breaker.cooldown_until(),
            quota_window_start: gate.limiter.window_start(),
            requests_in_window: gate.limiter.requests_in_window(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("source_id", &self.source_id())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<ProviderHandle>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every HTTP provider; those without credentials stay disabled
    pub fn from_config(config: &PricingConfig) -> Result<Self, ConfigError> {
        let client = http_client(config.provider_timeout).map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        let creds = &config.credentials;
        let mut registry = ProviderRegistry::new();

        let goldapi: Arc<dyn PriceSource> =
            Arc::new(GoldApiSource::new(client.clone(), creds.goldapi.as_deref().unwrap_or_default()));
        let metals_api: Arc<dyn PriceSource> =
            Arc::new(MetalsApiSource::new(client.clone(), creds.metals_api.as_deref().unwrap_or_default()));
        let exchangerate_api: Arc<dyn PriceSource> = Arc::new(ExchangeRateApiSource::new(
            client.clone(),
            creds.exchangerate_api.as_deref().unwrap_or_default(),
        ));
        let banxico: Arc<dyn PriceSource> =
            Arc::new(BanxicoSource::new(client, creds.banxico.as_deref().unwrap_or_default()));

        let sources = [
            (creds.goldapi.is_some(), goldapi),
            (creds.metals_api.is_some(), metals_api),
            (creds.exchangerate_api.is_some(), exchangerate_api),
            (creds.banxico.is_some(), banxico),
        ];

        for (has_credential, source) in sources {
            if has_credential {
                info!("Provider {} enabled", source.source_id());
                registry.register(source, config.breaker);
            } else {
                warn!("Provider {} disabled: no credentials configured", source.source_id());
                registry.register_disabled(source, config.breaker);
            }
        }

        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn PriceSource>, breaker: BreakerConfig) -> Arc<ProviderHandle> {
        let handle = Arc::new(ProviderHandle::new(source, breaker));
        self.providers.push(Arc::clone(&handle));
        handle
    }

    pub fn register_disabled(&mut self, source: Arc<dyn PriceSource>, breaker: BreakerConfig) -> Arc<ProviderHandle> {
        let handle = Arc::new(ProviderHandle::disabled(source, breaker));
        self.providers.push(Arc::clone(&handle));
        handle
    }

    pub fn providers(&self) -> &[Arc<ProviderHandle>] {
        &self.providers
    }

    /// Providers able to price `key`, regardless of their gate state
    pub fn supporting(&self, key: &PriceKey) -> Vec<Arc<ProviderHandle>> {
        self.providers
            .iter()
            .filter(|p| p.supports(key))
            .cloned()
            .collect()
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.iter().find(|p| p.source_id() == source_id).cloned()
    }

    /// Claim a call slot on a provider by id
    pub fn try_acquire(&self, source_id: &str) -> Result<(Arc<ProviderHandle>, Permit), GateError> {
        let handle = self.get(source_id).ok_or(GateError::Disabled)?;
        let permit = handle.admit(Utc::now())?;
        Ok((handle, permit))
    }

    pub fn states(&self) -> Vec<ProviderState> {
        let now = Utc::now();
        self.providers.iter().map(|p| p.state_at(now)).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
