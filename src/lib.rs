//! Joyería Precios - price acquisition for jewelry quotations
//!
//! Obtains live precious-metal spot prices and USD/MXN exchange rates from
//! several unreliable providers and always answers the quotation calculator
//! with a usable price and a confidence score, or with an explicit
//! "all sources exhausted" so the shop can enter a manual price.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   PriceService                       │
//! │  - get_price(metal, currency)                        │
//! │  - get_exchange_rate(from, to)                       │
//! └──────┬──────────────────┬───────────────────┬───────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌─────────────┐   ┌───────────────┐   ┌───────────────┐
//! │ PriceCache  │   │   Registry    │   │   Validator   │
//! │ (TTL +      │   │ breaker+quota │   │ (median,      │
//! │  history)   │   │ per provider  │   │  outliers)    │
//! └──────┬──────┘   └───────┬───────┘   └───────────────┘
//!        │                  │
//!        ▼                  ▼
//! ┌─────────────┐   ┌───────────────────────────────────────┐
//! │  Fallback   │   │           PriceSource Trait           │
//! │ (trend from │   │ GoldApi · MetalsApi · ExchangeRateApi │
//! │  history)   │   │ Banxico · MockPriceSource             │
//! └─────────────┘   └───────────────────────────────────────┘
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod models;
pub mod orchestrator;
pub mod price_feed;
pub mod rate_limiter;
pub mod registry;
pub mod validator;

// Re-export commonly used types
pub use config::PricingConfig;
pub use error::{PriceError, ProviderError};
pub use models::{
    CircuitState,
    ConsensusQuote,
    Currency,
    Metal,
    PriceKey,
    ProviderState,
    Quote,
    ResolutionMethod,
    Unit,
};

pub use orchestrator::PriceService;
pub use price_feed::{MockPriceSource, PriceSource};
pub use registry::ProviderRegistry;

/// Version of the price service
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the package
pub const NAME: &str = env!("CARGO_PKG_NAME");
