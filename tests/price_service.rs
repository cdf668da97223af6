//! End-to-end behaviour of the price service over mock providers

use chrono::{Duration as WallDuration, Utc};
use joyeria_precios::cache::PriceCache;
use joyeria_precios::config::QuotaConfig;
use joyeria_precios::{
    CircuitState, ConsensusQuote, Currency, Metal, MockPriceSource, PriceError, PriceKey, PriceService,
    PricingConfig, ProviderError, ProviderRegistry, Quote, ResolutionMethod,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn gold_mxn() -> PriceKey {
    PriceKey::spot(Metal::Gold, Currency::Mxn)
}

fn service_with(sources: &[Arc<MockPriceSource>], config: PricingConfig) -> PriceService {
    let mut registry = ProviderRegistry::new();
    for source in sources {
        registry.register(source.clone(), config.breaker);
    }
    PriceService::new(registry, config)
}

#[tokio::test]
async fn test_cache_hit_within_ttl_skips_providers() {
    let a = Arc::new(MockPriceSource::new("a").with_price(gold_mxn(), dec!(43800)));
    let b = Arc::new(MockPriceSource::new("b").with_price(gold_mxn(), dec!(43850)));
    let service = service_with(&[Arc::clone(&a), Arc::clone(&b)], PricingConfig::default());

    let first = service.get_price(Metal::Gold, Currency::Mxn).await.unwrap();
    let second = service.get_price(Metal::Gold, Currency::Mxn).await.unwrap();
    let third = service.get_price(Metal::Gold, Currency::Mxn).await.unwrap();

    assert_eq!(first.method, ResolutionMethod::LiveConsensus);
    assert_eq!(second.method, ResolutionMethod::CacheHit);
    assert_eq!(second.value(), first.value());
    assert_eq!(third, second);
    assert_eq!(a.call_count(), 1);
    assert_eq!(b.call_count(), 1);
}

#[tokio::test]
async fn test_quorum_cancels_straggler_without_penalising_it() {
    let fast_a = Arc::new(MockPriceSource::new("fast-a").with_price(gold_mxn(), dec!(43800)));
    let fast_b = Arc::new(MockPriceSource::new("fast-b").with_price(gold_mxn(), dec!(43810)));
    let slow = Arc::new(
        MockPriceSource::new("slow")
            .with_price(gold_mxn(), dec!(43805))
            .with_delay(Duration::from_secs(3)),
    );
    let mut config = PricingConfig::default();
    config.quorum = 2;
    let service = service_with(&[fast_a, fast_b, Arc::clone(&slow)], config);

    let started = Instant::now();
    let quote = service.get_price(Metal::Gold, Currency::Mxn).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(quote.contributing_sources, 2);
    assert_eq!(quote.value(), dec!(43805));

    let slow_state = service.registry().get("slow").unwrap().state();
    assert_eq!(slow_state.circuit_state, CircuitState::Closed);
    assert_eq!(slow_state.consecutive_failures, 0);
}

#[tokio::test]
async fn test_outlier_provider_is_outvoted() {
    let sources = [
        Arc::new(MockPriceSource::new("a").with_price(gold_mxn(), dec!(43800))),
        Arc::new(MockPriceSource::new("b").with_price(gold_mxn(), dec!(43820))),
        Arc::new(MockPriceSource::new("c").with_price(gold_mxn(), dec!(52000))),
    ];
    let mut config = PricingConfig::default();
    config.quorum = 3;
    let service = service_with(&sources, config);

    let quote = service.get_price(Metal::Gold, Currency::Mxn).await.unwrap();

    assert_eq!(quote.value(), dec!(43810));
    assert_eq!(quote.contributing_sources, 2);
    assert!(quote.confidence < 1.0);
    assert!(quote.confidence > 0.6);
}

#[tokio::test]
async fn test_total_exhaustion_fabricates_nothing() {
    let service = service_with(&[], PricingConfig::default());

    let result = service.get_price(Metal::Palladium, Currency::Usd).await;

    assert_eq!(
        result,
        Err(PriceError::AllSourcesExhausted {
            key: PriceKey::spot(Metal::Palladium, Currency::Usd)
        })
    );
}

#[tokio::test]
async fn test_failing_providers_fall_back_to_history_trend() {
    let down = Arc::new(MockPriceSource::new("down").failing(ProviderError::HttpStatus(503)));
    let key = PriceKey::spot(Metal::Gold, Currency::Usd);
    let now = Utc::now();
    let config = PricingConfig::default();

    let cache = PriceCache::new(config.cache.history_capacity);
    let history = [(2, dec!(1900)), (1, dec!(1920))]
        .into_iter()
        .map(|(minutes_ago, value)| ConsensusQuote {
            quote: Quote::new(key, value, now - WallDuration::minutes(minutes_ago), "live"),
            confidence: 1.0,
            contributing_sources: 2,
            method: ResolutionMethod::LiveConsensus,
        })
        .collect();
    cache.seed_history(key, history).await;

    let mut registry = ProviderRegistry::new();
    registry.register(down.clone(), config.breaker);
    let service = PriceService::with_cache(registry, cache, config);

    let estimate = service.get_price(Metal::Gold, Currency::Usd).await.unwrap();

    assert_eq!(down.call_count(), 1);
    assert_eq!(estimate.method, ResolutionMethod::FallbackInterpolated);
    assert!(estimate.value() >= dec!(1920));
    assert!(estimate.confidence < service.config().fallback.confidence_ceiling);
}

#[tokio::test]
async fn test_open_circuit_stops_calling_the_provider() {
    let flaky = Arc::new(MockPriceSource::new("flaky").failing(ProviderError::Timeout));
    let service = service_with(&[Arc::clone(&flaky)], PricingConfig::default());
    let threshold = service.config().breaker.failure_threshold as usize;

    for _ in 0..threshold {
        assert!(service.get_price(Metal::Silver, Currency::Usd).await.is_err());
    }
    assert_eq!(service.provider_states()[0].circuit_state, CircuitState::Open);

    flaky.set_failure(None);
    flaky.set_price(PriceKey::spot(Metal::Silver, Currency::Usd), dec!(28.5));
    assert!(service.get_price(Metal::Silver, Currency::Usd).await.is_err());

    assert_eq!(flaky.call_count(), threshold);
}

#[tokio::test]
async fn test_quota_limits_calls_and_fresh_cache_covers_the_gap() {
    let key = PriceKey::fx(Currency::Usd, Currency::Mxn);
    let limited = Arc::new(
        MockPriceSource::new("limited")
            .with_price(key, dec!(18.25))
            .with_quota(QuotaConfig::per_minute(2)),
    );
    let mut config = PricingConfig::default();
    config.cache.prefer_cache = false;
    let service = service_with(&[Arc::clone(&limited)], config);

    for _ in 0..3 {
        service.get_exchange_rate(Currency::Usd, Currency::Mxn).await.unwrap();
    }
    let fourth = service.get_exchange_rate(Currency::Usd, Currency::Mxn).await.unwrap();

    assert_eq!(limited.call_count(), 2);
    assert_eq!(fourth.method, ResolutionMethod::CacheHit);
    assert_eq!(fourth.value(), dec!(18.25));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_quota() {
    let key = PriceKey::spot(Metal::Platinum, Currency::Usd);
    let source = Arc::new(
        MockPriceSource::new("shared")
            .with_price(key, dec!(984.2))
            .with_delay(Duration::from_millis(50))
            .with_quota(QuotaConfig::per_minute(5)),
    );
    let mut config = PricingConfig::default();
    config.cache.prefer_cache = false;
    let service = service_with(&[Arc::clone(&source)], config);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.get_price(Metal::Platinum, Currency::Usd).await
        }));
    }
    for handle in handles {
        let _ = handle.await.unwrap();
    }

    assert_eq!(source.call_count(), 5);
    assert_eq!(service.provider_states()[0].requests_in_window, 5);
}

#[tokio::test]
async fn test_fallback_estimates_never_enter_history() {
    let key = PriceKey::spot(Metal::Gold, Currency::Usd);
    let source = Arc::new(MockPriceSource::new("a").with_price(key, dec!(2400)));
    let mut config = PricingConfig::default();
    config.cache.spot_ttl = Duration::ZERO;
    config.breaker.failure_threshold = 100;
    let service = service_with(&[Arc::clone(&source)], config);

    service.get_price(Metal::Gold, Currency::Usd).await.unwrap();
    source.set_failure(Some(ProviderError::MalformedResponse("bad".to_string())));
    let estimate = service.get_price(Metal::Gold, Currency::Usd).await.unwrap();

    assert_eq!(estimate.method, ResolutionMethod::FallbackInterpolated);
    assert_eq!(estimate.value(), dec!(2400));
    let entry = service.cache().get(&key).await.unwrap();
    assert_eq!(entry.history.len(), 1);
}

#[tokio::test]
async fn test_concurrent_failures_trip_the_circuit_once() {
    let down = Arc::new(
        MockPriceSource::new("down")
            .failing(ProviderError::HttpStatus(503))
            .with_delay(Duration::from_millis(50)),
    );
    let service = service_with(&[Arc::clone(&down)], PricingConfig::default());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service.get_price(Metal::Gold, Currency::Usd).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    let state = service.provider_states().remove(0);
    assert_eq!(down.call_count(), 5);
    assert_eq!(state.circuit_state, CircuitState::Open);
    assert_eq!(state.consecutive_failures, 5);

    let cooldown = state.cooldown_until.unwrap() - state.last_failure_at.unwrap();
    assert!(cooldown <= WallDuration::seconds(60));
}
