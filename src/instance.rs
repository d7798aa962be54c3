//! Merchant instance handles
//!
//! An instance is a logical merchant identity: signing keypair, bank
//! accounts, fee defaults. Handlers obtain a shared handle from the
//! registry; the `Arc` strong count doubles as the in-flight-use
//! counter, so an instance row can only be retired once no request
//! holds a handle anymore.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::crypto::hash::{account_hash, hash_to_hex};
use crate::crypto::keys::KeyPair;
use crate::db::models::{DbAccount, DbInstance};
use crate::db::{Database, DbError, DbResult};

/// Loaded instance with its parsed signing key and accounts.
pub struct InstanceHandle {
    pub row: DbInstance,
    pub keys: KeyPair,
    pub accounts: Vec<DbAccount>,
}

impl InstanceHandle {
    pub fn id(&self) -> &str {
        &self.row.instance_id
    }

    pub fn public_key(&self) -> String {
        self.keys.public_hex()
    }

    /// First active account, used as the default for new contracts.
    pub fn active_account(&self) -> Option<&DbAccount> {
        self.accounts.iter().find(|a| a.active)
    }

    /// Accounts stay resolvable by hash even when inactive; old
    /// contracts still reference them.
    pub fn account_by_hash(&self, h_wire: &str) -> Option<&DbAccount> {
        self.accounts.iter().find(|a| a.h_wire == h_wire)
    }

    /// Reserve keypair, present iff this instance tips.
    pub fn tip_reserve_keys(&self) -> DbResult<Option<KeyPair>> {
        match &self.row.tip_reserve_priv {
            None => Ok(None),
            Some(priv_hex) => KeyPair::from_hex(priv_hex)
                .map(Some)
                .map_err(|e| DbError::Corrupt(format!("tip reserve key: {}", e))),
        }
    }
}

/// Process-wide cache of instance handles.
pub struct InstanceRegistry {
    db: Arc<Database>,
    cache: RwLock<HashMap<String, Arc<InstanceHandle>>>,
}

impl InstanceRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an instance, loading and caching it on first use.
    pub async fn lookup(&self, instance_id: &str) -> DbResult<Arc<InstanceHandle>> {
        {
            let cache = self.cache.read().await;
            if let Some(handle) = cache.get(instance_id) {
                return Ok(handle.clone());
            }
        }

        let row = self.db.get_instance(instance_id).await?;
        let keys = KeyPair::from_hex(&row.priv_key)
            .map_err(|e| DbError::Corrupt(format!("instance signing key: {}", e)))?;
        let accounts = self.db.instance_accounts(instance_id).await?;

        let handle = Arc::new(InstanceHandle { row, keys, accounts });
        let mut cache = self.cache.write().await;
        Ok(cache
            .entry(instance_id.to_string())
            .or_insert(handle)
            .clone())
    }

    /// Drop a cached handle (after account changes).
    pub async fn invalidate(&self, instance_id: &str) {
        self.cache.write().await.remove(instance_id);
    }

    /// Create the `default` instance on first start so the service is
    /// usable without an admin step. Generates a fresh signing keypair
    /// and registers the configured bank account.
    pub async fn bootstrap_default(&self, config: &Config) -> DbResult<()> {
        if self.db.count_instances().await? > 0 {
            return Ok(());
        }

        let keys = KeyPair::generate();
        tracing::info!(
            merchant_pub = %keys.public_hex(),
            "no instances found, bootstrapping 'default'"
        );

        let instance = DbInstance {
            instance_id: "default".to_string(),
            name: "Default merchant".to_string(),
            pub_key: keys.public_hex(),
            priv_key: keys.private_hex(),
            address: serde_json::json!({}),
            jurisdiction: serde_json::json!({}),
            default_max_wire_fee: config.default_max_wire_fee.to_string(),
            default_max_deposit_fee: config.default_max_deposit_fee.to_string(),
            default_wire_fee_amortization: config.default_wire_fee_amortization as i32,
            default_wire_transfer_delay_secs: config.default_wire_transfer_delay_secs,
            default_pay_delay_secs: config.default_pay_delay_secs,
            tip_reserve_priv: None,
            active: true,
        };
        self.db.create_instance(&instance).await?;

        let salt = hex::encode(rand::random::<[u8; 16]>());
        let h_wire = hash_to_hex(&account_hash(&config.merchant_payto_uri, &salt));
        self.db
            .add_account(&DbAccount {
                instance_id: "default".to_string(),
                payto_uri: config.merchant_payto_uri.clone(),
                salt,
                h_wire,
                active: true,
            })
            .await?;

        Ok(())
    }
}
