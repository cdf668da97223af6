//! price_feed.rs - Provider adapters for metal spot prices and FX rates
//!
//! Each adapter wraps one third-party API and turns its response into a
//! [`Quote`] or a classified [`ProviderError`]. Parsing is kept in plain
//! functions so it can be tested without a network.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::config::QuotaConfig;
use crate::error::ProviderError;
use crate::models::{Currency, PriceKey, Quote};

/// Uniform interface over every price/FX provider
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Stable identifier used in logs and quotes
    fn source_id(&self) -> &str;

    /// Whether this provider can price the key at all
    fn supports(&self, key: &PriceKey) -> bool;

    /// Request budget the provider allows
    fn quota(&self) -> QuotaConfig {
        QuotaConfig::default()
    }

    /// Fetch one quote; one outbound call per invocation
    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError>;
}

/// Build the HTTP client shared by all adapters
pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Send a request and return the body of a 2xx response
async fn send(request: RequestBuilder) -> Result<String, ProviderError> {
    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ProviderError::AuthFailure);
    }
    if !status.is_success() {
        return Err(ProviderError::HttpStatus(status.as_u16()));
    }

    Ok(response.text().await?)
}

fn decimal_from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_str(&value.to_string()).ok()
}

fn positive(value: Option<Decimal>, raw: &str) -> Result<Decimal, ProviderError> {
    match value {
        Some(v) if v > Decimal::ZERO => Ok(v),
        _ => Err(ProviderError::MalformedResponse(format!("invalid price: {}", raw))),
    }
}

/// Unix seconds to a timestamp; missing or future values become `now`
fn as_of(unix: Option<i64>, now: DateTime<Utc>) -> DateTime<Utc> {
    unix.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .map(|ts| ts.min(now))
        .unwrap_or(now)
}

// ============================================================================
// GoldAPI (goldapi.io)
// ============================================================================

#[derive(Debug, Deserialize)]
struct GoldApiResponse {
    price: Option<f64>,
    timestamp: Option<i64>,
    error: Option<String>,
}

/// Metal spot prices from goldapi.io, quoted per troy ounce
#[derive(Debug, Clone)]
pub struct GoldApiSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GoldApiSource {
    pub const ID: &'static str = "goldapi";

    pub fn new(client: Client, api_key: &str) -> Self {
        Self::with_base_url(client, api_key, "https://www.goldapi.io/api")
    }

    pub fn with_base_url(client: Client, api_key: &str, base_url: &str) -> Self {
        GoldApiSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn parse_response(body: &str, key: PriceKey, now: DateTime<Utc>) -> Result<Quote, ProviderError> {
        let data: GoldApiResponse = serde_json::from_str(body)?;

        if let Some(error) = data.error {
            return Err(ProviderError::MalformedResponse(error));
        }

        let raw = data
            .price
            .ok_or_else(|| ProviderError::MalformedResponse("missing price".to_string()))?;
        let value = positive(decimal_from_f64(raw), &raw.to_string())?;

        Ok(Quote::new(key, value, as_of(data.timestamp, now), Self::ID))
    }
}

#[async_trait]
impl PriceSource for GoldApiSource {
    fn source_id(&self) -> &str {
        Self::ID
    }

    fn supports(&self, key: &PriceKey) -> bool {
        !key.is_fx()
    }

    fn quota(&self) -> QuotaConfig {
        QuotaConfig::per_minute(10)
    }

    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError> {
        let metal = key.metal().ok_or(ProviderError::Unsupported(key))?;
        let url = format!("{}/{}/{}", self.base_url, metal.iso_code(), key.currency());
        debug!("Fetching from: {}", url);

        let body = send(self.client.get(&url).header("x-access-token", &self.api_key)).await?;
        Self::parse_response(&body, key, Utc::now())
    }
}

// ============================================================================
// Metals-API (metals-api.com)
// ============================================================================

#[derive(Debug, Deserialize)]
struct MetalsApiResponse {
    success: bool,
    timestamp: Option<i64>,
    #[serde(default)]
    rates: HashMap<String, f64>,
    error: Option<MetalsApiError>,
}

#[derive(Debug, Deserialize)]
struct MetalsApiError {
    code: u16,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Metal spot prices from metals-api.com. Rates are quoted as ounces per
/// unit of the base currency, so the price is the reciprocal.
#[derive(Debug, Clone)]
pub struct MetalsApiSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl MetalsApiSource {
    pub const ID: &'static str = "metals-api";

    pub fn new(client: Client, api_key: &str) -> Self {
        Self::with_base_url(client, api_key, "https://metals-api.com/api")
    }

    pub fn with_base_url(client: Client, api_key: &str, base_url: &str) -> Self {
        MetalsApiSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn parse_response(body: &str, key: PriceKey, now: DateTime<Utc>) -> Result<Quote, ProviderError> {
        let metal = key.metal().ok_or(ProviderError::Unsupported(key))?;
        let data: MetalsApiResponse = serde_json::from_str(body)?;

        if !data.success {
            return Err(match data.error {
                Some(MetalsApiError { code: 101 | 102, .. }) => ProviderError::AuthFailure,
                Some(MetalsApiError { code: 104, .. }) => ProviderError::HttpStatus(429),
                Some(MetalsApiError { code, kind }) => {
                    ProviderError::MalformedResponse(format!("api error {}: {}", code, kind))
                }
                None => ProviderError::MalformedResponse("unsuccessful response".to_string()),
            });
        }

        let rate = data
            .rates
            .get(metal.iso_code())
            .copied()
            .ok_or_else(|| ProviderError::MalformedResponse(format!("missing rate for {}", metal.iso_code())))?;
        let rate = positive(decimal_from_f64(rate), &rate.to_string())?;
        let value = (Decimal::ONE / rate).round_dp(4);

        Ok(Quote::new(key, value, as_of(data.timestamp, now), Self::ID))
    }
}

#[async_trait]
impl PriceSource for MetalsApiSource {
    fn source_id(&self) -> &str {
        Self::ID
    }

    fn supports(&self, key: &PriceKey) -> bool {
        !key.is_fx()
    }

    fn quota(&self) -> QuotaConfig {
        QuotaConfig::per_minute(5)
    }

    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError> {
        let metal = key.metal().ok_or(ProviderError::Unsupported(key))?;
        let url = format!("{}/latest", self.base_url);
        debug!("Fetching from: {} ({})", url, key);

        let request = self.client.get(&url).query(&[
            ("access_key", self.api_key.as_str()),
            ("base", key.currency().code()),
            ("symbols", metal.iso_code()),
        ]);
        let body = send(request).await?;
        Self::parse_response(&body, key, Utc::now())
    }
}

// ============================================================================
// ExchangeRate-API (exchangerate-api.com)
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExchangeRateResponse {
    result: String,
    time_last_update_unix: Option<i64>,
    conversion_rate: Option<f64>,
    #[serde(rename = "error-type")]
    error_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeRateApiSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ExchangeRateApiSource {
    pub const ID: &'static str = "exchangerate-api";

    pub fn new(client: Client, api_key: &str) -> Self {
        Self::with_base_url(client, api_key, "https://v6.exchangerate-api.com/v6")
    }

    pub fn with_base_url(client: Client, api_key: &str, base_url: &str) -> Self {
        ExchangeRateApiSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn parse_response(body: &str, key: PriceKey, now: DateTime<Utc>) -> Result<Quote, ProviderError> {
        let data: ExchangeRateResponse = serde_json::from_str(body)?;

        if data.result != "success" {
            return Err(match data.error_type.as_deref() {
                Some("invalid-key") | Some("inactive-account") => ProviderError::AuthFailure,
                Some("quota-reached") => ProviderError::HttpStatus(429),
                other => ProviderError::MalformedResponse(format!("api error: {}", other.unwrap_or("unknown"))),
            });
        }

        let raw = data
            .conversion_rate
            .ok_or_else(|| ProviderError::MalformedResponse("missing conversion_rate".to_string()))?;
        let value = positive(decimal_from_f64(raw), &raw.to_string())?;

        Ok(Quote::new(key, value, as_of(data.time_last_update_unix, now), Self::ID))
    }
}

#[async_trait]
impl PriceSource for ExchangeRateApiSource {
    fn source_id(&self) -> &str {
        Self::ID
    }

    fn supports(&self, key: &PriceKey) -> bool {
        key.is_fx()
    }

    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError> {
        let (from, to) = match key {
            PriceKey::Fx { from, to } => (from, to),
            PriceKey::Spot { .. } => return Err(ProviderError::Unsupported(key)),
        };
        let url = format!("{}/{}/pair/{}/{}", self.base_url, self.api_key, from, to);
        debug!("Fetching from: {}/<key>/pair/{}/{}", self.base_url, from, to);

        let body = send(self.client.get(&url)).await?;
        Self::parse_response(&body, key, Utc::now())
    }
}

// ============================================================================
// Banxico SIE (Banco de México official FIX rate)
// ============================================================================

#[derive(Debug, Deserialize)]
struct BanxicoResponse {
    bmx: BanxicoBody,
}

#[derive(Debug, Deserialize)]
struct BanxicoBody {
    series: Vec<BanxicoSeries>,
}

#[derive(Debug, Deserialize)]
struct BanxicoSeries {
    #[serde(default)]
    datos: Vec<BanxicoDatum>,
}

#[derive(Debug, Deserialize)]
struct BanxicoDatum {
    fecha: String,
    dato: String,
}

/// USD/MXN FIX rate, published once per business day around noon in
/// Mexico City (18:00 UTC)
#[derive(Debug, Clone)]
pub struct BanxicoSource {
    client: Client,
    base_url: String,
    token: String,
}

impl BanxicoSource {
    pub const ID: &'static str = "banxico";
    const FIX_SERIES: &'static str = "SF43718";
    const FIX_HOUR_UTC: u32 = 18;

    pub fn new(client: Client, token: &str) -> Self {
        Self::with_base_url(client, token, "https://www.banxico.org.mx/SieAPIRest/service/v1")
    }

    pub fn with_base_url(client: Client, token: &str, base_url: &str) -> Self {
        BanxicoSource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn parse_response(body: &str, key: PriceKey, now: DateTime<Utc>) -> Result<Quote, ProviderError> {
        let data: BanxicoResponse = serde_json::from_str(body)?;

        let datum = data
            .bmx
            .series
            .into_iter()
            .next()
            .and_then(|s| s.datos.into_iter().last())
            .ok_or_else(|| ProviderError::MalformedResponse("empty series".to_string()))?;

        // "N/E" marks a day without a published value
        let usd_mxn = positive(Decimal::from_str(&datum.dato.replace(',', "")).ok(), &datum.dato)?;

        let observed_at = NaiveDate::parse_from_str(&datum.fecha, "%d/%m/%Y")
            .ok()
            .and_then(|date| date.and_hms_opt(Self::FIX_HOUR_UTC, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive).min(now))
            .ok_or_else(|| ProviderError::MalformedResponse(format!("invalid date: {}", datum.fecha)))?;

        let value = match key {
            PriceKey::Fx { from: Currency::Usd, to: Currency::Mxn } => usd_mxn,
            PriceKey::Fx { from: Currency::Mxn, to: Currency::Usd } => (Decimal::ONE / usd_mxn).round_dp(8),
            _ => return Err(ProviderError::Unsupported(key)),
        };

        Ok(Quote::new(key, value, observed_at, Self::ID))
    }
}

#[async_trait]
impl PriceSource for BanxicoSource {
    fn source_id(&self) -> &str {
        Self::ID
    }

    fn supports(&self, key: &PriceKey) -> bool {
        matches!(
            key,
            PriceKey::Fx { from: Currency::Usd, to: Currency::Mxn }
                | PriceKey::Fx { from: Currency::Mxn, to: Currency::Usd }
        )
    }

    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError> {
        if !self.supports(&key) {
            return Err(ProviderError::Unsupported(key));
        }
        let url = format!("{}/series/{}/datos/oportuno", self.base_url, Self::FIX_SERIES);
        debug!("Fetching from: {}", url);

        let request = self
            .client
            .get(&url)
            .header("Bmx-Token", &self.token)
            .header("Accept", "application/json");
        let body = send(request).await?;
        Self::parse_response(&body, key, Utc::now())
    }
}

// ============================================================================
// MockPriceSource - For testing and demo mode
// ============================================================================

/// Scriptable in-memory provider
#[derive(Debug)]
pub struct MockPriceSource {
    id: String,
    prices: Mutex<HashMap<PriceKey, Decimal>>,
    script: Mutex<VecDeque<Result<Decimal, ProviderError>>>,
    failure: Mutex<Option<ProviderError>>,
    delay: Mutex<Duration>,
    quota: QuotaConfig,
    calls: AtomicUsize,
}

impl MockPriceSource {
    pub fn new(id: &str) -> Self {
        MockPriceSource {
            id: id.to_string(),
            prices: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            quota: QuotaConfig::per_minute(1000),
            calls: AtomicUsize::new(0),
        }
    }

    /// Realistic board for demo mode
    pub fn demo(id: &str, skew: Decimal) -> Self {
        use crate::models::Metal;

        let usd = [
            (Metal::Gold, Decimal::new(241050, 2)),
            (Metal::Silver, Decimal::new(2875, 2)),
            (Metal::Platinum, Decimal::new(98420, 2)),
            (Metal::Palladium, Decimal::new(103560, 2)),
        ];
        let usd_mxn = Decimal::new(182450, 4);

        let mut source = Self::new(id).with_price(PriceKey::fx(Currency::Usd, Currency::Mxn), usd_mxn * skew);
        source = source.with_price(
            PriceKey::fx(Currency::Mxn, Currency::Usd),
            (Decimal::ONE / (usd_mxn * skew)).round_dp(8),
        );
        for (metal, price) in usd {
            source = source
                .with_price(PriceKey::spot(metal, Currency::Usd), (price * skew).round_dp(2))
                .with_price(PriceKey::spot(metal, Currency::Mxn), (price * usd_mxn * skew).round_dp(2));
        }
        source
    }

    pub fn with_price(self, key: PriceKey, value: Decimal) -> Self {
        self.set_price(key, value);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    /// Every call fails with `error` until cleared
    pub fn failing(self, error: ProviderError) -> Self {
        self.set_failure(Some(error));
        self
    }

    /// Queue results consumed one per call before the fixed behaviour applies
    pub fn with_script(self, script: Vec<Result<Decimal, ProviderError>>) -> Self {
        lock(&self.script).extend(script);
        self
    }

    pub fn set_price(&self, key: PriceKey, value: Decimal) {
        lock(&self.prices).insert(key, value);
    }

    pub fn set_failure(&self, failure: Option<ProviderError>) {
        *lock(&self.failure) = failure;
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_result(&self, key: PriceKey) -> Result<Decimal, ProviderError> {
        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        lock(&self.prices)
            .get(&key)
            .copied()
            .ok_or(ProviderError::Unsupported(key))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl PriceSource for MockPriceSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    fn supports(&self, _key: &PriceKey) -> bool {
        true
    }

    fn quota(&self) -> QuotaConfig {
        self.quota
    }

    async fn fetch(&self, key: PriceKey) -> Result<Quote, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let value = self.next_result(key)?;
        Ok(Quote::new(key, value, Utc::now(), &self.id))
    }
}
