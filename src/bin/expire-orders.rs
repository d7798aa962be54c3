//! Unclaimed-order garbage collector
//!
//! Deletes unclaimed orders whose pay deadline has passed. Meant to run
//! periodically (cron or a supervisor loop); one-shot mode with
//! RUN_ONCE=1 for scripting.

use anyhow::Context;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taler_merchant_backend::{Config, Database};

/// How often the expiry pass runs in loop mode.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    let db = Database::new(&config.database_url)
        .await
        .context("connecting to database")?;
    db.migrate().await.context("running migrations")?;

    let run_once = std::env::var("RUN_ONCE").map(|v| v == "1").unwrap_or(false);

    loop {
        match db.purge_expired_orders().await {
            Ok(0) => tracing::debug!("no expired unclaimed orders"),
            Ok(n) => tracing::info!(purged = n, "purged expired unclaimed orders"),
            Err(e) => tracing::error!("expiry pass failed: {}", e),
        }

        if run_once {
            break;
        }
        tokio::time::sleep(SWEEP_INTERVAL).await;
    }

    Ok(())
}
