//! main.rs - Entry point for the jewelry price board
//!
//! - Reads provider credentials and pricing policy from the environment
//! - Resolves spot prices for every metal plus the USD/MXN rate
//! - Prints a quotation board on a fixed refresh interval

use joyeria_precios::{
    ConsensusQuote, Currency, Metal, MockPriceSource, PriceError, PriceService, PricingConfig,
    ProviderRegistry, ResolutionMethod, NAME, VERSION,
};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Refresh interval in seconds unless PRICE_REFRESH_SECONDS is set
const DEFAULT_REFRESH_SECONDS: u64 = 30;

/// Currency the shop quotes in
const BOARD_CURRENCY: Currency = Currency::Mxn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Print startup banner
    println!();
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║     Joyería Precios v{:<36}║", VERSION);
    println!("║     Live metal prices for quotations                     ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    info!("Starting {} v{}", NAME, VERSION);

    let config = PricingConfig::from_env()?;
    let demo = std::env::var("PRICING_DEMO").map(|v| v == "1").unwrap_or(false);
    let refresh_seconds = match std::env::var("PRICE_REFRESH_SECONDS") {
        Ok(raw) => raw.trim().parse::<u64>()?,
        Err(_) => DEFAULT_REFRESH_SECONDS,
    };

    let service = if demo {
        warn!("Demo mode: using simulated providers");
        demo_service(config)
    } else {
        PriceService::from_config(config)?
    };

    for state in service.provider_states() {
        info!("  - {}: circuit {:?}", state.source_id, state.circuit_state);
    }
    info!(
        "Quorum {}, provider timeout {:?}, request timeout {:?}",
        service.config().quorum,
        service.config().provider_timeout,
        service.config().request_timeout
    );
    println!();

    info!("Starting refresh loop (interval: {}s)...", refresh_seconds);
    let mut interval = tokio::time::interval(Duration::from_secs(refresh_seconds.max(1)));
    let mut refresh_count: u64 = 0;

    loop {
        interval.tick().await;
        refresh_count += 1;

        debug!("─────────────────────────────────────────────────────────────");
        info!("Refresh #{}", refresh_count);
        display_board(&service).await;

        // Provider health every 10 refreshes
        if refresh_count % 10 == 0 {
            for state in service.provider_states() {
                info!(
                    "Provider {}: {:?}, {} consecutive failures, {} requests this window",
                    state.source_id, state.circuit_state, state.consecutive_failures, state.requests_in_window
                );
            }
        }
    }
}

/// Service over simulated providers that disagree slightly
fn demo_service(config: PricingConfig) -> PriceService {
    let mut registry = ProviderRegistry::new();
    let skews = [("demo-a", Decimal::new(1000, 3)), ("demo-b", Decimal::new(1004, 3)), ("demo-c", Decimal::new(997, 3))];
    for (id, skew) in skews {
        let source = MockPriceSource::demo(id, skew).with_delay(Duration::from_millis(150));
        registry.register(Arc::new(source), config.breaker);
    }
    PriceService::new(registry, config)
}

/// Resolve and print every metal plus the exchange rate
async fn display_board(service: &PriceService) {
    println!();
    println!("┌──────────────┬──────────────────┬────────────────┬───────────┬────────────┐");
    println!("│ Metal        │ {} / troy ounce  │ {} / gram      │ Method    │ Confidence │", BOARD_CURRENCY, BOARD_CURRENCY);
    println!("├──────────────┼──────────────────┼────────────────┼───────────┼────────────┤");

    let mut exhausted = 0;
    for metal in Metal::ALL {
        match service.get_price(metal, BOARD_CURRENCY).await {
            Ok(quote) => print_row(&metal.to_string(), &quote),
            Err(PriceError::AllSourcesExhausted { key }) => {
                exhausted += 1;
                println!("│ {:12} │ {:>16} │ {:>14} │ {:9} │ {:>10} │", metal, "manual price", "required", "-", "-");
                debug!("No price for {}", key);
            }
        }
    }

    println!("├──────────────┼──────────────────┼────────────────┼───────────┼────────────┤");
    match service.get_exchange_rate(Currency::Usd, BOARD_CURRENCY).await {
        Ok(rate) => println!(
            "│ {:12} │ {:>16.4} │ {:>14} │ {:9} │ {:>10.2} │",
            format!("USD/{}", BOARD_CURRENCY),
            rate.value(),
            "",
            rate.method.to_string(),
            rate.confidence
        ),
        Err(e) => {
            exhausted += 1;
            error!("{}", e);
        }
    }
    println!("└──────────────┴──────────────────┴────────────────┴───────────┴────────────┘");
    println!();

    if exhausted > 0 {
        warn!("{} prices need a manual override", exhausted);
    }
}

fn print_row(label: &str, quote: &ConsensusQuote) {
    let per_gram = quote.per_gram().unwrap_or_default();
    println!(
        "│ {:12} │ {:>16.2} │ {:>14.2} │ {:9} │ {:>10.2} │",
        label,
        quote.value(),
        per_gram,
        quote.method.to_string(),
        quote.confidence
    );
    if quote.method == ResolutionMethod::FallbackInterpolated {
        warn!("{} price is an estimate: {}", label, quote);
    }
}
