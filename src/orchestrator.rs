//! orchestrator.rs - The price service used by the quotation calculator
//!
//! Per request: cache → gated concurrent fan-out → validation → cache write,
//! or fallback when nothing usable came back.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cache::PriceCache;
use crate::circuit_breaker::Permit;
use crate::config::PricingConfig;
use crate::error::{ConfigError, PriceError, ProviderError};
use crate::fallback::interpolate;
use crate::models::{ConsensusQuote, Currency, Metal, PriceKey, ProviderState, Quote, ResolutionMethod};
use crate::registry::{ProviderHandle, ProviderRegistry};
use crate::validator::{agreeing_count, validate};

/// Source id reported for a same-currency exchange rate
pub const IDENTITY_SOURCE: &str = "identity";

#[derive(Debug, Clone)]
pub struct PriceService {
    registry: ProviderRegistry,
    cache: PriceCache,
    config: Arc<PricingConfig>,
}

impl PriceService {
    pub fn new(registry: ProviderRegistry, config: PricingConfig) -> Self {
        let cache = PriceCache::new(config.cache.history_capacity);
        Self::with_cache(registry, cache, config)
    }

    pub fn with_cache(registry: ProviderRegistry, cache: PriceCache, config: PricingConfig) -> Self {
        PriceService {
            registry,
            cache,
            config: Arc::new(config),
        }
    }

    /// Service over the HTTP providers configured in `config`
    pub fn from_config(config: PricingConfig) -> Result<Self, ConfigError> {
        let registry = ProviderRegistry::from_config(&config)?;
        Ok(Self::new(registry, config))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    pub fn provider_states(&self) -> Vec<ProviderState> {
        self.registry.states()
    }

    /// Current spot price of `metal` per troy ounce in `currency`
    pub async fn get_price(&self, metal: Metal, currency: Currency) -> Result<ConsensusQuote, PriceError> {
        self.resolve(PriceKey::spot(metal, currency)).await
    }

    /// Units of `to` per one unit of `from`
    pub async fn get_exchange_rate(&self, from: Currency, to: Currency) -> Result<ConsensusQuote, PriceError> {
        if from == to {
            let key = PriceKey::fx(from, to);
            return Ok(ConsensusQuote {
                quote: Quote::new(key, rust_decimal::Decimal::ONE, Utc::now(), IDENTITY_SOURCE),
                confidence: 1.0,
                contributing_sources: 0,
                method: ResolutionMethod::LiveConsensus,
            });
        }
        self.resolve(PriceKey::fx(from, to)).await
    }

    pub async fn resolve(&self, key: PriceKey) -> Result<ConsensusQuote, PriceError> {
        let deadline = Instant::now() + self.config.request_timeout;

        if self.config.cache.prefer_cache {
            if let Some(entry) = self.cache.get(&key).await {
                if entry.is_fresh(Utc::now()) {
                    debug!("{}: served from cache", key);
                    return Ok(entry.value.as_cache_hit(self.config.cache.cache_hit_max_confidence));
                }
            }
        }

        let quotes = self.fetch_live(key, deadline).await;

        match validate(key, &quotes, &self.config.validation, Utc::now()) {
            Ok(consensus) => {
                let ttl = self.config.cache.ttl(&key);
                self.cache.put(key, consensus.quote.clone(), ttl).await;
                info!("Resolved {}", consensus.quote);
                return Ok(consensus.quote);
            }
            Err(e) => warn!("{}: live resolution failed ({}), using fallback", key, e),
        }

        self.fall_back(key).await
    }

    async fn fall_back(&self, key: PriceKey) -> Result<ConsensusQuote, PriceError> {
        let entry = self.cache.get(&key).await;
        let now = Utc::now();

        if let Some(entry) = &entry {
            if entry.is_fresh(now) {
                info!("{}: using fresh cached value after live failure", key);
                return Ok(entry.value.as_cache_hit(self.config.cache.cache_hit_max_confidence));
            }
        }

        let history = entry.map(|e| e.history()).unwrap_or_default();
        match interpolate(key, &history, &self.config.fallback, now) {
            Ok(estimate) => {
                warn!("Estimated {} from {} historical points", estimate, estimate.contributing_sources);
                Ok(estimate)
            }
            Err(e) => {
                error!("{}: {}; no price can be quoted", key, e);
                Err(PriceError::AllSourcesExhausted { key })
            }
        }
    }

    /// Query every admitted provider concurrently and collect what arrives
    /// before quorum, completion or the request deadline.
    async fn fetch_live(&self, key: PriceKey, deadline: Instant) -> Vec<Quote> {
        let now = Utc::now();
        let handles: Vec<(Arc<ProviderHandle>, Permit)> = self
            .registry
            .supporting(&key)
            .into_iter()
            .filter_map(|handle| match handle.admit(now) {
                Ok(permit) => Some((handle, permit)),
                Err(gate) => {
                    debug!("{}: skipping {} ({})", key, handle.source_id(), gate);
                    None
                }
            })
            .collect();

        if handles.is_empty() {
            warn!("{}: no eligible providers", key);
            return Vec::new();
        }

        let mut tasks = JoinSet::new();
        for (index, (handle, _)) in handles.iter().enumerate() {
            let source = handle.source();
            let timeout = self.config.provider_timeout;
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, source.fetch(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout),
                };
                (index, result)
            });
        }

        let mut in_flight: HashSet<usize> = (0..handles.len()).collect();
        let mut quotes = Vec::with_capacity(handles.len());
        let quorum = self.config.quorum.max(1);

        loop {
            let joined = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!("{}: request deadline reached with {} calls outstanding", key, in_flight.len());
                    break;
                }
            };
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("{}: provider task aborted: {}", key, e);
                    continue;
                }
            };
            in_flight.remove(&index);

            let (handle, permit) = &handles[index];
            match result {
                Ok(quote) => {
                    debug!("{}: {} returned {}", key, handle.source_id(), quote.value);
                    handle.report_success();
                    quotes.push(quote);
                }
                Err(e) => {
                    warn!("{}: {} failed: {}", key, handle.source_id(), e);
                    handle.report_failure(&e, *permit, Utc::now());
                }
            }

            if !in_flight.is_empty()
                && quotes.len() >= quorum
                && agreeing_count(key, &quotes, &self.config.validation, Utc::now()) >= quorum
            {
                debug!("{}: quorum of {} reached, cancelling {} calls", key, quorum, in_flight.len());
                break;
            }
        }

        tasks.abort_all();
        for index in in_flight {
            let (handle, permit) = &handles[index];
            handle.report_cancelled(*permit);
        }

        quotes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::price_feed::MockPriceSource;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn gold_usd() -> PriceKey {
        PriceKey::spot(Metal::Gold, Currency::Usd)
    }

    fn service_with(sources: Vec<Arc<MockPriceSource>>, config: PricingConfig) -> PriceService {
        let mut registry = ProviderRegistry::new();
        for source in sources {
            registry.register(source, config.breaker);
        }
        PriceService::new(registry, config)
    }

    #[tokio::test]
    async fn test_live_consensus_is_cached() {
        let a = Arc::new(MockPriceSource::new("a").with_price(gold_usd(), dec!(2400)));
        let b = Arc::new(MockPriceSource::new("b").with_price(gold_usd(), dec!(2402)));
        let service = service_with(vec![a, b], PricingConfig::default());

        let quote = service.get_price(Metal::Gold, Currency::Usd).await.unwrap();

        assert_eq!(quote.method, ResolutionMethod::LiveConsensus);
        assert_eq!(quote.value(), dec!(2401));
        assert_eq!(quote.confidence, 1.0);
        assert!(service.cache().get(&gold_usd()).await.is_some());
    }

    #[tokio::test]
    async fn test_identity_rate_skips_providers() {
        let a = Arc::new(MockPriceSource::new("a"));
        let service = service_with(vec![Arc::clone(&a)], PricingConfig::default());

        let rate = service.get_exchange_rate(Currency::Mxn, Currency::Mxn).await.unwrap();

        assert_eq!(rate.value(), dec!(1));
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_live_first_uses_fresh_cache_after_failure() {
        let a = Arc::new(MockPriceSource::new("a").with_price(gold_usd(), dec!(2400)));
        let mut config = PricingConfig::default();
        config.cache.prefer_cache = false;
        config.breaker = BreakerConfig {
            failure_threshold: 10,
            ..BreakerConfig::default()
        };
        let service = service_with(vec![Arc::clone(&a)], config);

        service.get_price(Metal::Gold, Currency::Usd).await.unwrap();
        a.set_failure(Some(ProviderError::HttpStatus(502)));
        let second = service.get_price(Metal::Gold, Currency::Usd).await.unwrap();

        assert_eq!(a.call_count(), 2);
        assert_eq!(second.method, ResolutionMethod::CacheHit);
        assert_eq!(second.value(), dec!(2400));
    }

    #[tokio::test]
    async fn test_per_call_timeout_counts_as_failure() {
        let slow = Arc::new(
            MockPriceSource::new("slow")
                .with_price(gold_usd(), dec!(2400))
                .with_delay(Duration::from_secs(5)),
        );
        let mut config = PricingConfig::default();
        config.provider_timeout = Duration::from_millis(50);
        let service = service_with(vec![slow], config);

        let result = service.get_price(Metal::Gold, Currency::Usd).await;

        assert_eq!(result, Err(PriceError::AllSourcesExhausted { key: gold_usd() }));
        assert_eq!(service.provider_states()[0].consecutive_failures, 1);
    }
}
