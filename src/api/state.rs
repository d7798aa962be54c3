use std::sync::Arc;

use crate::api::error::ApiError;
use crate::config::Config;
use crate::db::Database;
use crate::exchange::ExchangeRegistry;
use crate::instance::{InstanceHandle, InstanceRegistry};
use crate::longpoll::LongPollRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration
    pub config: Arc<Config>,

    /// Database connection for persistence and queries
    pub db: Arc<Database>,

    /// Configured exchange clients, keyed by base URL
    pub exchanges: Arc<ExchangeRegistry>,

    /// Instance handles with parsed signing keys
    pub instances: Arc<InstanceRegistry>,

    /// Suspended long-poll requests
    pub longpoll: Arc<LongPollRegistry>,
}

impl AppState {
    /// Create new app state: connect, migrate, bootstrap the default
    /// instance, and wire up the shared registries.
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let db = Arc::new(Database::new(&config.database_url).await?);
        db.migrate().await?;

        let instances = Arc::new(InstanceRegistry::new(db.clone()));
        instances.bootstrap_default(&config).await?;

        let exchanges = Arc::new(ExchangeRegistry::from_config(&config.exchanges));
        let longpoll = Arc::new(LongPollRegistry::new());

        tracing::info!(
            exchanges = exchanges.len(),
            "app state initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            exchanges,
            instances,
            longpoll,
        })
    }

    /// Resolve the instance named in a request (default: "default").
    pub async fn instance(
        &self,
        instance_id: Option<&str>,
    ) -> Result<Arc<InstanceHandle>, ApiError> {
        let id = instance_id.unwrap_or("default");
        Ok(self.instances.lookup(id).await?)
    }
}
