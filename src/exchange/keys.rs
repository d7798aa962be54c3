//! Denomination key set handling: master-signature validation, TTL
//! caching, denomination lookup.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::types::{DenominationKey, ExchangeKeys};
use crate::crypto::hash::canonical_json;
use crate::crypto::keys::{purpose, verify_purpose, CryptoError};

/// How long a fetched key set is trusted before re-fetching.
pub const KEYS_CACHE_TTL: Duration = Duration::from_secs(3600);

struct CachedKeys {
    keys: Arc<ExchangeKeys>,
    fetched_at: Instant,
}

/// Shared cache of one exchange's signed key set.
pub struct KeySetCache {
    ttl: Duration,
    inner: RwLock<Option<CachedKeys>>,
}

impl KeySetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn get_if_fresh(&self) -> Option<Arc<ExchangeKeys>> {
        let cache = self.inner.read().await;
        cache.as_ref().and_then(|c| {
            if c.fetched_at.elapsed() < self.ttl {
                Some(c.keys.clone())
            } else {
                None
            }
        })
    }

    pub async fn store(&self, keys: Arc<ExchangeKeys>) {
        let mut cache = self.inner.write().await;
        *cache = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
    }
}

/// Verify the exchange master signature over the key set. The signed
/// payload is the canonical JSON of the denomination list together with
/// the issue date, so any tampering with values or fees invalidates it.
pub fn verify_master_sig(master_pub: &str, keys: &ExchangeKeys) -> Result<(), CryptoError> {
    let payload = serde_json::json!({
        "denoms": keys.denoms,
        "signkeys": keys.signkeys,
        "list_issue_date": keys.list_issue_date,
    });
    verify_purpose(
        master_pub,
        purpose::EXCHANGE_KEY_SET,
        canonical_json(&payload).as_bytes(),
        &keys.master_sig,
    )
}

/// Find a denomination by its public key.
pub fn find_denomination<'a>(
    keys: &'a ExchangeKeys,
    denom_pub: &str,
) -> Option<&'a DenominationKey> {
    keys.denoms.iter().find(|d| d.denom_pub == denom_pub)
}

/// A denomination may only back new deposits inside its validity window.
pub fn denomination_usable_for_deposit(denom: &DenominationKey) -> bool {
    let now = Utc::now();
    let started = match denom.stamp_start.millis() {
        None => true,
        Some(ms) => ms <= now.timestamp_millis(),
    };
    started && !denom.stamp_expire_deposit.is_expired(now)
}

/// Check that `exchange_pub` is a currently valid online signing key of
/// this exchange. Confirmations signed by unknown keys are protocol
/// violations, not trust anchors.
pub fn is_valid_signkey(keys: &ExchangeKeys, exchange_pub: &str) -> bool {
    let now = Utc::now();
    keys.signkeys.iter().any(|sk| {
        sk.key == exchange_pub
            && sk
                .stamp_start
                .millis()
                .map_or(true, |ms| ms <= now.timestamp_millis())
            && !sk.stamp_end.is_expired(now)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::crypto::keys::KeyPair;
    use crate::timestamp::Timestamp;

    fn denom(expire_ms: i64) -> DenominationKey {
        DenominationKey {
            denom_pub: "d1".to_string(),
            value: "EUR:5".parse::<Amount>().unwrap(),
            fee_deposit: "EUR:0.01".parse::<Amount>().unwrap(),
            fee_refund: "EUR:0.01".parse::<Amount>().unwrap(),
            stamp_start: Timestamp::from_millis(0),
            stamp_expire_deposit: Timestamp::from_millis(expire_ms),
        }
    }

    fn signed_keys(master: &KeyPair, denoms: Vec<DenominationKey>) -> ExchangeKeys {
        let signkeys = vec![super::super::types::SignKey {
            key: "sk1".to_string(),
            stamp_start: Timestamp::from_millis(0),
            stamp_end: Timestamp::from_millis(i64::MAX / 2),
        }];
        let list_issue_date = Timestamp::from_millis(1);
        let payload = serde_json::json!({
            "denoms": denoms,
            "signkeys": signkeys,
            "list_issue_date": list_issue_date,
        });
        let master_sig = master.sign(
            purpose::EXCHANGE_KEY_SET,
            canonical_json(&payload).as_bytes(),
        );
        ExchangeKeys {
            denoms,
            signkeys,
            wire_fees: vec![],
            reserve_closing_delay_secs: 28 * 24 * 3600,
            list_issue_date,
            master_sig,
        }
    }

    #[test]
    fn test_master_sig_round_trip() {
        let master = KeyPair::generate();
        let keys = signed_keys(&master, vec![denom(i64::MAX / 2)]);
        verify_master_sig(&master.public_hex(), &keys).expect("valid key set must verify");
    }

    #[test]
    fn test_master_sig_detects_tampering() {
        let master = KeyPair::generate();
        let mut keys = signed_keys(&master, vec![denom(i64::MAX / 2)]);
        // Inflate a fee after signing.
        keys.denoms[0].fee_deposit = "EUR:1".parse::<Amount>().unwrap();
        assert!(verify_master_sig(&master.public_hex(), &keys).is_err());
    }

    #[test]
    fn test_denomination_expiry_window() {
        let fresh = denom(i64::MAX / 2);
        assert!(denomination_usable_for_deposit(&fresh));

        let expired = denom(1);
        assert!(!denomination_usable_for_deposit(&expired));
    }

    #[test]
    fn test_find_denomination() {
        let master = KeyPair::generate();
        let keys = signed_keys(&master, vec![denom(i64::MAX / 2)]);
        assert!(find_denomination(&keys, "d1").is_some());
        assert!(find_denomination(&keys, "unknown").is_none());
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let master = KeyPair::generate();
        let keys = Arc::new(signed_keys(&master, vec![denom(i64::MAX / 2)]));

        let cache = KeySetCache::new(Duration::from_secs(60));
        assert!(cache.get_if_fresh().await.is_none());

        cache.store(keys.clone()).await;
        assert!(cache.get_if_fresh().await.is_some());

        let stale = KeySetCache::new(Duration::from_millis(0));
        stale.store(keys).await;
        assert!(stale.get_if_fresh().await.is_none());
    }
}
