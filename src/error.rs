//! error.rs - Error taxonomy for price acquisition
//!
//! Only [`PriceError`] ever reaches callers of the price service. Everything
//! else is absorbed inside the crate and turned into gate state or a fallback.

use thiserror::Error;

use crate::models::PriceKey;

/// Classified failure of a single provider call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("authentication rejected")]
    AuthFailure,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0} is not offered by this provider")]
    Unsupported(PriceKey),
}

impl ProviderError {
    /// Whether the provider told us we exceeded its request budget
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::HttpStatus(429))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::HttpStatus(status.as_u16())
        } else if err.is_decode() {
            ProviderError::MalformedResponse(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::MalformedResponse(err.to_string())
    }
}

/// Pre-call outcome that removes a provider from a request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("circuit open")]
    CircuitOpen,

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("provider disabled: missing credentials")]
    Disabled,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("no live data")]
    NoLiveData,

    #[error("all quotes rejected as outliers: {outliers:?}")]
    ValidationRejected { outliers: Vec<String> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FallbackError {
    #[error("no price history to estimate from")]
    AllSourcesExhausted,
}

/// The only failure surfaced to the quotation calculator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    #[error("all price sources exhausted for {key}; a manual price is required")]
    AllSourcesExhausted { key: PriceKey },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
