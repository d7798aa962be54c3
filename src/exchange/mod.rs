//! Exchange client subsystem
//!
//! - `client`: per-exchange JSON/HTTP client with signature checks
//! - `keys`: signed denomination key set cache
//! - `types`: wire protocol DTOs
//!
//! The registry maps configured base URLs to shared clients; coins
//! naming an unconfigured exchange are rejected before any network I/O.

pub mod client;
pub mod keys;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use client::{DepositFailure, ExchangeClient, ExchangeError, TrackResult};

use crate::config::ExchangeConfig;

/// All exchanges this merchant is willing to talk to.
pub struct ExchangeRegistry {
    clients: HashMap<String, Arc<ExchangeClient>>,
}

impl ExchangeRegistry {
    pub fn from_config(configs: &[ExchangeConfig]) -> Self {
        let mut clients = HashMap::new();
        for cfg in configs {
            let client = Arc::new(ExchangeClient::from_config(cfg));
            clients.insert(client.base_url().to_string(), client);
        }
        Self { clients }
    }

    /// Look up a client by base URL (trailing slashes ignored).
    pub fn get(&self, base_url: &str) -> Option<Arc<ExchangeClient>> {
        self.clients
            .get(base_url.trim_end_matches('/'))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ExchangeClient>> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_normalizes_urls() {
        let registry = ExchangeRegistry::from_config(&[ExchangeConfig {
            base_url: "https://exchange.test/".to_string(),
            master_pub: "00".repeat(32),
            currency: "EUR".to_string(),
        }]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("https://exchange.test").is_some());
        assert!(registry.get("https://exchange.test/").is_some());
        assert!(registry.get("https://other.test").is_none());
    }
}
