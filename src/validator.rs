//! validator.rs - Cross-source validation
//!
//! Takes whatever quotes arrived for one request, drops stale ones and
//! outliers around the median, and produces a single consensus value with a
//! confidence score.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::Decimal;

use crate::config::{wall, ValidationPolicy};
use crate::error::ValidationError;
use crate::models::{ConsensusQuote, PriceKey, Quote, ResolutionMethod};

/// A quote excluded from the consensus
#[derive(Debug, Clone, PartialEq)]
pub struct Outlier {
    pub source_id: String,
    pub value: Decimal,
    /// Distance from the median in percent
    pub deviation_pct: Decimal,
}

#[derive(Debug, Clone)]
pub struct Consensus {
    pub quote: ConsensusQuote,
    pub outliers: Vec<Outlier>,
    pub stale_dropped: usize,
}

/// Median; even-length input averages the two middle values
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        let (low, high) = (sorted[mid - 1], sorted[mid]);
        Some(low + (high - low) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

/// Distance from `reference` in percent; unrepresentable distances count as
/// infinitely far
fn deviation_pct(value: Decimal, reference: Decimal) -> Decimal {
    value
        .checked_sub(reference)
        .and_then(|diff| diff.abs().checked_div(reference))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::MAX)
}

fn is_live(quote: &Quote, key: PriceKey, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
    quote.key == key && quote.value > Decimal::ZERO && now.signed_duration_since(quote.observed_at) <= max_age
}

/// How many usable quotes sit within tolerance of their common median
pub fn agreeing_count(key: PriceKey, quotes: &[Quote], policy: &ValidationPolicy, now: DateTime<Utc>) -> usize {
    let max_age = wall(policy.max_staleness(&key));
    let live: Vec<Decimal> = quotes
        .iter()
        .filter(|q| is_live(q, key, max_age, now))
        .map(|q| q.value)
        .collect();
    let Some(mid) = median(&live) else {
        return 0;
    };
    let tolerance = policy.tolerance_pct(&key);
    live.iter().filter(|v| deviation_pct(**v, mid) <= tolerance).count()
}

pub fn validate(
    key: PriceKey,
    quotes: &[Quote],
    policy: &ValidationPolicy,
    now: DateTime<Utc>,
) -> Result<Consensus, ValidationError> {
    let max_age = wall(policy.max_staleness(&key));
    let live: Vec<&Quote> = quotes.iter().filter(|q| is_live(q, key, max_age, now)).collect();
    let stale_dropped = quotes.len() - live.len();
    if stale_dropped > 0 {
        debug!("{}: ignored {} stale or mismatched quotes", key, stale_dropped);
    }

    match live.as_slice() {
        [] => Err(ValidationError::NoLiveData),
        [only] => Ok(Consensus {
            quote: ConsensusQuote {
                quote: Quote {
                    key,
                    unit: only.unit,
                    value: only.value,
                    observed_at: only.observed_at,
                    source_id: only.source_id.clone(),
                },
                confidence: policy.single_source_confidence,
                contributing_sources: 1,
                method: ResolutionMethod::LiveConsensus,
            },
            outliers: Vec::new(),
            stale_dropped,
        }),
        many => consensus_of(key, many, policy, stale_dropped),
    }
}

fn consensus_of(
    key: PriceKey,
    quotes: &[&Quote],
    policy: &ValidationPolicy,
    stale_dropped: usize,
) -> Result<Consensus, ValidationError> {
    let tolerance = policy.tolerance_pct(&key);
    let values: Vec<Decimal> = quotes.iter().map(|q| q.value).collect();
    let first_median = median(&values).ok_or(ValidationError::NoLiveData)?;

    let (survivors, rejected): (Vec<&Quote>, Vec<&Quote>) = quotes
        .iter()
        .copied()
        .partition(|q| deviation_pct(q.value, first_median) <= tolerance);

    let outliers: Vec<Outlier> = rejected
        .iter()
        .map(|q| Outlier {
            source_id: q.source_id.clone(),
            value: q.value,
            deviation_pct: deviation_pct(q.value, first_median).round_dp(2),
        })
        .collect();
    for outlier in &outliers {
        warn!(
            "{}: rejected {} from {} ({}% off median {})",
            key, outlier.value, outlier.source_id, outlier.deviation_pct, first_median
        );
    }

    if survivors.is_empty() {
        return Err(ValidationError::ValidationRejected {
            outliers: outliers.into_iter().map(|o| o.source_id).collect(),
        });
    }

    let surviving: Vec<Decimal> = survivors.iter().map(|q| q.value).collect();
    let value = median(&surviving).ok_or(ValidationError::NoLiveData)?;

    let mut confidence = survivors.len() as f64 / quotes.len() as f64;
    if survivors.len() < 2 {
        confidence = confidence.min(policy.single_source_confidence);
    }

    let observed_at = survivors
        .iter()
        .map(|q| q.observed_at)
        .max()
        .unwrap_or_else(Utc::now);
    let source_id = survivors
        .iter()
        .map(|q| q.source_id.as_str())
        .collect::<Vec<_>>()
        .join("+");

    Ok(Consensus {
        quote: ConsensusQuote {
            quote: Quote {
                key,
                unit: key.unit(),
                value,
                observed_at,
                source_id,
            },
            confidence,
            contributing_sources: survivors.len(),
            method: ResolutionMethod::LiveConsensus,
        },
        outliers,
        stale_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Currency, Metal};
    use rust_decimal_macros::dec;

    fn gold() -> PriceKey {
        PriceKey::spot(Metal::Gold, Currency::Usd)
    }

    fn quotes(key: PriceKey, values: &[Decimal], now: DateTime<Utc>) -> Vec<Quote> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Quote::new(key, *v, now, &format!("src{}", i)))
            .collect()
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[dec!(3), dec!(1), dec!(2)]), Some(dec!(2)));
        assert_eq!(median(&[dec!(100), dec!(101), dec!(102), dec!(150)]), Some(dec!(101.5)));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_outlier_is_excluded() {
        let now = Utc::now();
        let input = quotes(gold(), &[dec!(100), dec!(101), dec!(102), dec!(150)], now);

        let result = validate(gold(), &input, &ValidationPolicy::default(), now).unwrap();

        assert_eq!(result.quote.value(), dec!(101));
        assert_eq!(result.quote.contributing_sources, 3);
        assert_eq!(result.quote.confidence, 0.75);
        assert_eq!(result.outliers.len(), 1);
        assert_eq!(result.outliers[0].value, dec!(150));
        assert_eq!(result.quote.quote.source_id, "src0+src1+src2");
    }

    #[test]
    fn test_full_agreement_gives_full_confidence() {
        let now = Utc::now();
        let input = quotes(gold(), &[dec!(2400), dec!(2410), dec!(2405)], now);

        let result = validate(gold(), &input, &ValidationPolicy::default(), now).unwrap();

        assert_eq!(result.quote.confidence, 1.0);
        assert_eq!(result.quote.value(), dec!(2405));
        assert_eq!(result.quote.method, ResolutionMethod::LiveConsensus);
    }

    #[test]
    fn test_single_quote_is_unverified() {
        let now = Utc::now();
        let input = quotes(gold(), &[dec!(2400)], now);
        let policy = ValidationPolicy::default();

        let result = validate(gold(), &input, &policy, now).unwrap();

        assert_eq!(result.quote.value(), dec!(2400));
        assert_eq!(result.quote.confidence, policy.single_source_confidence);
        assert!(result.quote.confidence < 1.0);
    }

    #[test]
    fn test_no_quotes_is_no_live_data() {
        let result = validate(gold(), &[], &ValidationPolicy::default(), Utc::now());
        assert!(matches!(result, Err(ValidationError::NoLiveData)));
    }

    #[test]
    fn test_stale_quotes_excluded_before_counting() {
        let now = Utc::now();
        let mut input = quotes(gold(), &[dec!(2400)], now);
        input.push(Quote::new(gold(), dec!(2000), now - chrono::Duration::hours(2), "old"));

        let result = validate(gold(), &input, &ValidationPolicy::default(), now).unwrap();

        assert_eq!(result.stale_dropped, 1);
        assert_eq!(result.quote.contributing_sources, 1);
        assert_eq!(result.quote.value(), dec!(2400));

        let only_stale = &input[1..];
        let result = validate(gold(), only_stale, &ValidationPolicy::default(), now);
        assert!(matches!(result, Err(ValidationError::NoLiveData)));
    }

    #[test]
    fn test_fx_uses_tighter_tolerance() {
        let now = Utc::now();
        let key = PriceKey::fx(Currency::Usd, Currency::Mxn);
        let input = quotes(key, &[dec!(18.00), dec!(18.05), dec!(18.50)], now);

        let result = validate(key, &input, &ValidationPolicy::default(), now).unwrap();

        assert_eq!(result.quote.contributing_sources, 2);
        assert_eq!(result.quote.value(), dec!(18.025));
        assert!(result.quote.confidence < 1.0);
    }

    #[test]
    fn test_two_disagreeing_quotes_are_rejected() {
        let now = Utc::now();
        let input = quotes(gold(), &[dec!(100), dec!(200)], now);

        let result = validate(gold(), &input, &ValidationPolicy::default(), now);

        match result {
            Err(ValidationError::ValidationRejected { outliers }) => assert_eq!(outliers.len(), 2),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_lone_survivor_is_penalised() {
        let now = Utc::now();
        let input = quotes(gold(), &[dec!(100), dec!(102), dec!(160)], now);
        let policy = ValidationPolicy {
            metal_tolerance_pct: dec!(1),
            ..ValidationPolicy::default()
        };

        let result = validate(gold(), &input, &policy, now).unwrap();

        assert_eq!(result.quote.contributing_sources, 1);
        assert_eq!(result.quote.value(), dec!(102));
        assert!(result.quote.confidence <= policy.single_source_confidence);
    }

    #[test]
    fn test_agreeing_counts_quotes_near_median() {
        let now = Utc::now();
        let policy = ValidationPolicy::default();
        let mut input = quotes(gold(), &[dec!(2400), dec!(2401), dec!(2600)], now);

        assert_eq!(agreeing_count(gold(), &input, &policy, now), 2);

        input[1].observed_at = now - chrono::Duration::hours(1);
        assert_eq!(agreeing_count(gold(), &input, &policy, now), 0);
    }

    #[test]
    fn test_extreme_values_are_outliers_not_panics() {
        let now = Utc::now();
        let tiny = Decimal::new(1, 28);
        let input = quotes(gold(), &[tiny, tiny, dec!(2400)], now);
        let policy = ValidationPolicy::default();

        let result = validate(gold(), &input, &policy, now).unwrap();

        assert_eq!(result.outliers.len(), 1);
        assert_eq!(result.outliers[0].value, dec!(2400));
        assert_eq!(result.outliers[0].deviation_pct, Decimal::MAX);
        assert_eq!(agreeing_count(gold(), &input, &policy, now), 2);

        let huge = quotes(gold(), &[Decimal::MAX, Decimal::MAX, tiny], now);
        assert_eq!(median(&[Decimal::MAX, Decimal::MAX]), Some(Decimal::MAX));
        assert_eq!(agreeing_count(gold(), &huge, &policy, now), 2);
    }
}
