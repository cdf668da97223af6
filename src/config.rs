//! config.rs - Runtime configuration for the price service
//!
//! Everything is read once at startup. Tolerances, quorum and timeouts are
//! policy, so they live here with their defaults instead of inside the
//! components that use them.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::PriceKey;

/// Circuit breaker thresholds and timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Cooldown after the first trip; doubled on each consecutive trip
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

/// Request budget for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl QuotaConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self::per_minute(30)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationPolicy {
    /// Allowed deviation from the median, in percent, for metal quotes
    pub metal_tolerance_pct: Decimal,
    pub fx_tolerance_pct: Decimal,
    pub single_source_confidence: f64,
    /// Spot quotes observed longer ago than this are ignored
    pub max_spot_staleness: Duration,
    /// FX sources publish daily fixings, so their bound is much wider
    pub max_fx_staleness: Duration,
}

impl ValidationPolicy {
    pub fn tolerance_pct(&self, key: &PriceKey) -> Decimal {
        if key.is_fx() {
            self.fx_tolerance_pct
        } else {
            self.metal_tolerance_pct
        }
    }

    pub fn max_staleness(&self, key: &PriceKey) -> Duration {
        if key.is_fx() {
            self.max_fx_staleness
        } else {
            self.max_spot_staleness
        }
    }
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            metal_tolerance_pct: Decimal::from(3),
            fx_tolerance_pct: Decimal::from(1),
            single_source_confidence: 0.6,
            max_spot_staleness: Duration::from_secs(15 * 60),
            max_fx_staleness: Duration::from_secs(36 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackPolicy {
    /// Estimates are always strictly below this confidence
    pub confidence_ceiling: f64,
    pub trend_confidence: f64,
    /// Confidence of a single stale point returned verbatim
    pub stale_confidence: f64,
    /// How far past the newest point a regression may project
    pub max_extrapolation: Duration,
    /// Age of the newest point at which confidence has halved
    pub confidence_half_life: Duration,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            confidence_ceiling: 0.5,
            trend_confidence: 0.4,
            stale_confidence: 0.25,
            max_extrapolation: Duration::from_secs(15 * 60),
            confidence_half_life: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub spot_ttl: Duration,
    pub fx_ttl: Duration,
    pub history_capacity: usize,
    /// Serve a fresh cached value without calling any provider
    pub prefer_cache: bool,
    pub cache_hit_max_confidence: f64,
}

impl CacheConfig {
    pub fn ttl(&self, key: &PriceKey) -> Duration {
        if key.is_fx() {
            self.fx_ttl
        } else {
            self.spot_ttl
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            spot_ttl: Duration::from_secs(60),
            fx_ttl: Duration::from_secs(15 * 60),
            history_capacity: 32,
            prefer_cache: true,
            cache_hit_max_confidence: 0.95,
        }
    }
}

/// API keys; a missing key disables its provider
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub goldapi: Option<String>,
    pub metals_api: Option<String>,
    pub exchangerate_api: Option<String>,
    pub banxico: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingConfig {
    /// Agreeing quotes needed to stop waiting for slower providers
    pub quorum: usize,
    pub provider_timeout: Duration,
    pub request_timeout: Duration,
    pub breaker: BreakerConfig,
    pub validation: ValidationPolicy,
    pub fallback: FallbackPolicy,
    pub cache: CacheConfig,
    pub credentials: ProviderCredentials,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quorum: 2,
            provider_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
            validation: ValidationPolicy::default(),
            fallback: FallbackPolicy::default(),
            cache: CacheConfig::default(),
            credentials: ProviderCredentials::default(),
        }
    }
}

impl PricingConfig {
    /// Build from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PricingConfig::default();

        let credential = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        config.credentials = ProviderCredentials {
            goldapi: credential("GOLDAPI_API_KEY"),
            metals_api: credential("METALS_API_KEY"),
            exchangerate_api: credential("EXCHANGERATE_API_KEY"),
            banxico: credential("BANXICO_TOKEN"),
        };

        if let Some(quorum) = parse_var::<usize, _>(&lookup, "PRICING_QUORUM")? {
            config.quorum = quorum.max(1);
        }
        if let Some(pct) = parse_var(&lookup, "PRICING_METAL_TOLERANCE_PCT")? {
            config.validation.metal_tolerance_pct = pct;
        }
        if let Some(pct) = parse_var(&lookup, "PRICING_FX_TOLERANCE_PCT")? {
            config.validation.fx_tolerance_pct = pct;
        }
        if let Some(ms) = parse_var(&lookup, "PRICING_PROVIDER_TIMEOUT_MS")? {
            config.provider_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "PRICING_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "PRICING_SPOT_TTL_SECS")? {
            config.cache.spot_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "PRICING_FX_TTL_SECS")? {
            config.cache.fx_ttl = Duration::from_secs(secs);
        }
        if let Some(prefer) = parse_var(&lookup, "PRICING_PREFER_CACHE")? {
            config.cache.prefer_cache = prefer;
        }
        if let Some(threshold) = parse_var::<u32, _>(&lookup, "PRICING_BREAKER_THRESHOLD")? {
            config.breaker.failure_threshold = threshold.max(1);
        }
        if let Some(secs) = parse_var(&lookup, "PRICING_BREAKER_COOLDOWN_SECS")? {
            config.breaker.cooldown = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
    }
}

/// Convert a std duration for use with wall-clock timestamps
pub(crate) fn wall(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}
