//! # Huddle Server
//!
//! Room-scoped realtime relay for chat and voice signalling.
//!
//! ## Usage
//!
//! ```bash
//! # Single instance, local bridge (a JWT secret is always required)
//! HUDDLE_JWT_SECRET=... huddle
//!
//! # Share rooms across instances through Redis
//! HUDDLE_JWT_SECRET=... HUDDLE_REDIS_URL=redis://127.0.0.1:6379 huddle
//!
//! # Run with environment variables
//! HUDDLE_PORT=8080 HUDDLE_HOST=0.0.0.0 HUDDLE_JWT_SECRET=... huddle
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!(
        bridge = ?config.bridge.kind,
        "Starting Huddle server on {}:{}",
        config.host,
        config.port
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
