//! models.rs - Core data structures for price acquisition
//!
//! Defines metals, currencies, quotes and the consensus result handed to the
//! quotation calculator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grams in one troy ounce
pub const GRAMS_PER_TROY_OUNCE: Decimal = Decimal::from_parts(311034768, 0, 0, false, 7);

/// Precious metals priced by the shop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Metal {
    Gold,
    Silver,
    Platinum,
    Palladium,
}

impl Metal {
    pub const ALL: [Metal; 4] = [Metal::Gold, Metal::Silver, Metal::Platinum, Metal::Palladium];

    /// ISO 4217 commodity code used by most price APIs (XAU, XAG, ...)
    pub fn iso_code(&self) -> &'static str {
        match self {
            Metal::Gold => "XAU",
            Metal::Silver => "XAG",
            Metal::Platinum => "XPT",
            Metal::Palladium => "XPD",
        }
    }
}

impl fmt::Display for Metal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metal::Gold => "gold",
            Metal::Silver => "silver",
            Metal::Platinum => "platinum",
            Metal::Palladium => "palladium",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Currency {
    Usd,
    Mxn,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Mxn => "MXN",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.code())
    }
}

/// Weight unit a metal price refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Unit {
    TroyOunce,
    Gram,
}

/// What is being priced: a metal in a currency, or one currency in another
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PriceKey {
    Spot { metal: Metal, currency: Currency },
    Fx { from: Currency, to: Currency },
}

impl PriceKey {
    pub fn spot(metal: Metal, currency: Currency) -> Self {
        PriceKey::Spot { metal, currency }
    }

    pub fn fx(from: Currency, to: Currency) -> Self {
        PriceKey::Fx { from, to }
    }

    pub fn is_fx(&self) -> bool {
        matches!(self, PriceKey::Fx { .. })
    }

    pub fn metal(&self) -> Option<Metal> {
        match self {
            PriceKey::Spot { metal, .. } => Some(*metal),
            PriceKey::Fx { .. } => None,
        }
    }

    /// Currency the value is expressed in
    pub fn currency(&self) -> Currency {
        match self {
            PriceKey::Spot { currency, .. } => *currency,
            PriceKey::Fx { to, .. } => *to,
        }
    }

    /// Unit a quote for this key is normalized to
    pub fn unit(&self) -> Option<Unit> {
        match self {
            PriceKey::Spot { .. } => Some(Unit::TroyOunce),
            PriceKey::Fx { .. } => None,
        }
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceKey::Spot { metal, currency } => write!(f, "{}/{}", metal.iso_code(), currency),
            PriceKey::Fx { from, to } => write!(f, "{}/{}", from, to),
        }
    }
}

/// A single price observation from one provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub key: PriceKey,
    pub unit: Option<Unit>,
    pub value: Decimal,
    pub observed_at: DateTime<Utc>,
    pub source_id: String,
}

impl Quote {
    pub fn new(key: PriceKey, value: Decimal, observed_at: DateTime<Utc>, source_id: &str) -> Self {
        Quote {
            key,
            unit: key.unit(),
            value,
            observed_at,
            source_id: source_id.to_string(),
        }
    }

    pub fn metal(&self) -> Option<Metal> {
        self.key.metal()
    }

    pub fn currency(&self) -> Currency {
        self.key.currency()
    }

    /// Value per gram; `None` for FX quotes
    pub fn per_gram(&self) -> Option<Decimal> {
        per_gram(self.unit, self.value)
    }
}

fn per_gram(unit: Option<Unit>, value: Decimal) -> Option<Decimal> {
    match unit? {
        Unit::TroyOunce => Some((value / GRAMS_PER_TROY_OUNCE).round_dp(4)),
        Unit::Gram => Some(value),
    }
}

/// How a consensus value was obtained
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionMethod {
    LiveConsensus,
    CacheHit,
    FallbackInterpolated,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResolutionMethod::LiveConsensus => "live",
            ResolutionMethod::CacheHit => "cached",
            ResolutionMethod::FallbackInterpolated => "estimated",
        };
        f.pad(label)
    }
}

/// The price handed to callers, with a confidence indicator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusQuote {
    pub quote: Quote,
    /// Trust score in [0, 1]; 1.0 only for fully agreeing live sources
    pub confidence: f64,
    pub contributing_sources: usize,
    pub method: ResolutionMethod,
}

impl ConsensusQuote {
    pub fn value(&self) -> Decimal {
        self.quote.value
    }

    pub fn key(&self) -> PriceKey {
        self.quote.key
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.quote.observed_at
    }

    pub fn per_gram(&self) -> Option<Decimal> {
        self.quote.per_gram()
    }

    /// Copy of this quote re-tagged as served from cache
    pub fn as_cache_hit(&self, max_confidence: f64) -> ConsensusQuote {
        ConsensusQuote {
            quote: self.quote.clone(),
            confidence: self.confidence.min(max_confidence),
            contributing_sources: self.contributing_sources,
            method: ResolutionMethod::CacheHit,
        }
    }
}

impl fmt::Display for ConsensusQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} ({}, confidence {:.2}, {} sources)",
            self.quote.key, self.quote.value, self.method, self.confidence, self.contributing_sources
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one provider's circuit and quota state
#[derive(Debug, Clone, Serialize)]
pub struct ProviderState {
    pub source_id: String,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub quota_window_start: Option<DateTime<Utc>>,
    pub requests_in_window: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_key_display() {
        assert_eq!(PriceKey::spot(Metal::Gold, Currency::Mxn).to_string(), "XAU/MXN");
        assert_eq!(PriceKey::fx(Currency::Usd, Currency::Mxn).to_string(), "USD/MXN");
    }

    #[test]
    fn test_quote_unit_follows_key() {
        let now = Utc::now();
        let spot = Quote::new(PriceKey::spot(Metal::Silver, Currency::Usd), dec!(24.5), now, "a");
        let fx = Quote::new(PriceKey::fx(Currency::Usd, Currency::Mxn), dec!(18.2), now, "b");

        assert_eq!(spot.unit, Some(Unit::TroyOunce));
        assert_eq!(fx.unit, None);
        assert_eq!(fx.per_gram(), None);
    }

    #[test]
    fn test_per_gram_conversion() {
        let quote = Quote::new(
            PriceKey::spot(Metal::Gold, Currency::Usd),
            dec!(3110.34768),
            Utc::now(),
            "test",
        );

        assert_eq!(GRAMS_PER_TROY_OUNCE, dec!(31.1034768));
        assert_eq!(quote.per_gram(), Some(dec!(100)));
    }

    #[test]
    fn test_cache_hit_caps_confidence() {
        let consensus = ConsensusQuote {
            quote: Quote::new(PriceKey::spot(Metal::Gold, Currency::Usd), dec!(2400), Utc::now(), "x"),
            confidence: 1.0,
            contributing_sources: 3,
            method: ResolutionMethod::LiveConsensus,
        };

        let hit = consensus.as_cache_hit(0.95);
        assert_eq!(hit.method, ResolutionMethod::CacheHit);
        assert_eq!(hit.value(), dec!(2400));
        assert!(hit.confidence < 1.0);
    }
}
