//! # Confide Server
//!
//! WebRTC signaling relay with confidant presence and call tracking.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! confide
//!
//! # Run with a specific config file
//! CONFIDE_CONFIG=/path/to/confide.toml confide
//!
//! # Run with environment variables
//! CONFIDE_PORT=3000 CONFIDE_HOST=0.0.0.0 confide
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confide=debug,confide_core=debug,confide_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Confide server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
