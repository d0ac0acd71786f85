//! Quote stream client - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Maker quote stream client
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via RFQ_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any WS connection is made.
    rfq_ws::init_crypto();

    let args = Args::parse();
    rfq_telemetry::init_logging()?;

    info!("Starting rfq-client v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > RFQ_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("RFQ_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = rfq_client::AppConfig::from_file(&config_path)?;
    info!(
        maker_url = %config.maker_url,
        pairs = config.quotes.requests.len(),
        "Configuration loaded"
    );

    let app = rfq_client::Application::new(config)?;
    let summary = app.run().await?;
    info!(
        quotes = summary.quotes_received,
        prices = summary.price_updates,
        "Stopped"
    );

    Ok(())
}
