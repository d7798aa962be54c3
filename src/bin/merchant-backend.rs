//! Merchant Backend API Server
//!
//! - Orders, payments, refunds, tracking and tips over HTTP/JSON
//! - Exchange clients with cached signed key sets
//! - Long-poll registry with background deadline sweeper

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taler_merchant_backend::{create_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taler_merchant_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting merchant backend");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            // Bad configuration is exit code 2 by convention.
            std::process::exit(2);
        }
    };
    config.log_summary();

    let addr = format!("{}:{}", config.api_host, config.api_port);

    let state = AppState::new(config).await?;
    tracing::info!("Database connected");

    // Evict expired long-poll waiters in the background.
    state.longpoll.spawn_sweeper();

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server running on http://{}", addr);
    tracing::info!("");
    tracing::info!("API Endpoints:");
    tracing::info!("   POST /orders                  Create order");
    tracing::info!("   POST /orders/:id/claim        Claim order");
    tracing::info!("   POST /orders/:id/pay          Pay with coins");
    tracing::info!("   GET  /orders/:id              Status (long-poll)");
    tracing::info!("   POST /orders/:id/refund       Authorize refund");
    tracing::info!("   GET  /orders/:id/refund       Refund pickup");
    tracing::info!("   GET  /transfers               Settlement tracking");
    tracing::info!("   POST /tips/authorize          Authorize tip");

    axum::serve(listener, app).await?;
    Ok(())
}
