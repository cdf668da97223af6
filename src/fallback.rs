//! fallback.rs - Best-effort estimate from cached history when no live source is usable
//!
//! Pure: history in, estimate out. Results are always tagged
//! `FallbackInterpolated` and kept strictly under the configured ceiling.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::{wall, FallbackPolicy};
use crate::error::FallbackError;
use crate::models::{ConsensusQuote, PriceKey, Quote, ResolutionMethod};

pub const TREND_SOURCE: &str = "fallback:trend";
pub const LAST_KNOWN_SOURCE: &str = "fallback:last-known";

pub fn interpolate(
    key: PriceKey,
    history: &[ConsensusQuote],
    policy: &FallbackPolicy,
    now: DateTime<Utc>,
) -> Result<ConsensusQuote, FallbackError> {
    let mut points: Vec<(DateTime<Utc>, Decimal)> = history
        .iter()
        .filter(|q| q.key() == key && q.value() > Decimal::ZERO)
        .map(|q| (q.observed_at(), q.value()))
        .collect();
    points.sort_by_key(|(at, _)| *at);

    let Some(&(last_at, last_value)) = points.last() else {
        return Err(FallbackError::AllSourcesExhausted);
    };
    let decay = age_decay(last_at, now, policy);

    let (value, source, confidence) = match points.as_slice() {
        [_] => (last_value, LAST_KNOWN_SOURCE, policy.stale_confidence * decay),
        [(_, previous), _] => match last_value
            .checked_sub(*previous)
            .and_then(|delta| last_value.checked_add(delta))
        {
            Some(projected) => (projected, TREND_SOURCE, policy.trend_confidence * decay),
            None => (last_value, LAST_KNOWN_SOURCE, policy.stale_confidence * decay),
        },
        _ => {
            let horizon = last_at + wall(policy.max_extrapolation);
            let target = now.clamp(last_at, horizon);
            match regression_at(&points, target) {
                Some(projected) => (projected, TREND_SOURCE, policy.trend_confidence * decay),
                None => (last_value, LAST_KNOWN_SOURCE, policy.stale_confidence * decay),
            }
        }
    };

    // A trend steep enough to cross zero says nothing useful about the price
    let (value, source) = if value > Decimal::ZERO {
        (value, source)
    } else {
        (last_value, LAST_KNOWN_SOURCE)
    };

    let cap = (policy.confidence_ceiling - 0.01).max(0.0);
    Ok(ConsensusQuote {
        quote: Quote {
            key,
            unit: key.unit(),
            value: value.round_dp(6),
            observed_at: now,
            source_id: source.to_string(),
        },
        confidence: confidence.clamp(0.0, cap),
        contributing_sources: points.len(),
        method: ResolutionMethod::FallbackInterpolated,
    })
}

/// Least-squares line through the points, evaluated at `target`
fn regression_at(points: &[(DateTime<Utc>, Decimal)], target: DateTime<Utc>) -> Option<Decimal> {
    let origin = points.first()?.0;
    let xy: Vec<(f64, f64)> = points
        .iter()
        .map(|(at, value)| Some((seconds_between(origin, *at), value.to_f64()?)))
        .collect::<Option<_>>()?;

    let n = xy.len() as f64;
    let mean_x = xy.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = xy.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = xy.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = xy.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();

    // All points at the same instant: no trend, use their mean
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let estimate = mean_y + slope * (seconds_between(origin, target) - mean_x);

    if estimate.is_finite() {
        Decimal::from_f64(estimate)
    } else {
        None
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from).num_milliseconds() as f64 / 1000.0
}

/// Halves every `confidence_half_life` since the newest point
fn age_decay(last_at: DateTime<Utc>, now: DateTime<Utc>, policy: &FallbackPolicy) -> f64 {
    let half_life = policy.confidence_half_life.as_secs_f64();
    if half_life <= 0.0 {
        return 1.0;
    }
    let age = seconds_between(last_at, now).max(0.0);
    0.5f64.powf(age / half_life)
}
