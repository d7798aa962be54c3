//! Tip subsystem & reserve status probe
//!
//! A tip reserve is an exchange-hosted reserve whose private key the
//! instance holds. Authorization checks the requested amount against
//! the balance the exchange last reported; when that looks short, the
//! reserve is re-probed once before failing. Pickup signs withdrawal
//! requests with the reserve key and forwards the exchange's blind
//! signatures to the wallet, re-using the exchange client's withdrawal
//! protocol.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::amount::{Amount, AmountError};
use crate::config::Config;
use crate::crypto::keys::{purpose, KeyPair};
use crate::db::models::DbTip;
use crate::db::{Database, DbError};
use crate::exchange::types::{ReserveHistoryEntry, WithdrawRequest};
use crate::exchange::{ExchangeClient, ExchangeError, ExchangeRegistry};
use crate::instance::InstanceHandle;

/// How long an authorized tip stays redeemable.
const TIP_EXPIRATION: Duration = Duration::days(28);

#[derive(Debug, Error)]
pub enum TipError {
    #[error("Instance has no tipping reserve configured")]
    InstanceDoesNotTip,

    #[error("Reserve unknown at the exchange")]
    ReserveUnknown,

    #[error("Tip reserve has expired")]
    ReserveExpired,

    #[error("Insufficient funds in the tip reserve")]
    InsufficientFunds,

    #[error("Tip not found: {0}")]
    TipNotFound(Uuid),

    #[error("Pickup exceeds the tip's authorized amount")]
    PickupExceedsTip,

    #[error("Invalid planchet: {0}")]
    InvalidPlanchet(String),

    #[error(transparent)]
    Exchange(ExchangeError),

    #[error(transparent)]
    Db(DbError),
}

impl From<DbError> for TipError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ReserveNotFound(_) => TipError::ReserveUnknown,
            DbError::ReserveExpired => TipError::ReserveExpired,
            DbError::InsufficientTipFunds => TipError::InsufficientFunds,
            DbError::TipNotFound(id) => TipError::TipNotFound(id),
            DbError::TipExhausted => TipError::PickupExceedsTip,
            other => TipError::Db(other),
        }
    }
}

impl From<ExchangeError> for TipError {
    fn from(e: ExchangeError) -> Self {
        match &e {
            ExchangeError::Status { status: 404, .. } => TipError::ReserveUnknown,
            _ => TipError::Exchange(e),
        }
    }
}

impl From<AmountError> for TipError {
    fn from(e: AmountError) -> Self {
        TipError::Db(DbError::Corrupt(e.to_string()))
    }
}

/// Result of authorizing a tip.
#[derive(Debug, Serialize)]
pub struct TipAuthorization {
    pub tip_id: Uuid,
    pub taler_tip_uri: String,
    pub expiration: DateTime<Utc>,
}

/// Aggregated tip accounting for an instance.
#[derive(Debug, Serialize)]
pub struct TipStatus {
    pub authorized_total: Amount,
    pub picked_up_total: Amount,
    pub available_balance: Amount,
}

/// Blind coin candidate submitted by the wallet at pickup.
#[derive(Debug, Clone, Deserialize)]
pub struct Planchet {
    pub denom_pub: String,
    pub coin_ev: String,
}

/// Blind signature returned per planchet.
#[derive(Debug, Serialize)]
pub struct PlanchetSignature {
    pub coin_ev: String,
    pub ev_sig: String,
}

/// The exchange hosting the instance's tip reserve. By convention the
/// first configured exchange; reserves are not spread across exchanges.
fn tip_exchange(
    exchanges: &ExchangeRegistry,
    config: &Config,
) -> Result<std::sync::Arc<ExchangeClient>, TipError> {
    config
        .exchanges
        .first()
        .and_then(|c| exchanges.get(&c.base_url))
        .ok_or(TipError::ReserveUnknown)
}

fn reserve_keys(instance: &InstanceHandle) -> Result<KeyPair, TipError> {
    instance
        .tip_reserve_keys()
        .map_err(TipError::Db)?
        .ok_or(TipError::InstanceDoesNotTip)
}

/// Fold a reserve history into (available balance, expiration).
///
/// DEPOSIT credits and pushes the expiration out from the latest
/// deposit; WITHDRAW and CLOSED debit; PAYBACK is logged but not
/// credited.
pub fn fold_reserve_history(
    history: &[ReserveHistoryEntry],
    currency: &str,
    closing_delay_secs: i64,
) -> Result<(Amount, Option<DateTime<Utc>>), AmountError> {
    let mut available = Amount::zero(currency)?;
    let mut latest_deposit: Option<DateTime<Utc>> = None;

    for entry in history {
        match entry.entry_type.as_str() {
            "DEPOSIT" => {
                available = available.checked_add(&entry.amount)?;
                let at = entry.timestamp.to_datetime();
                if at > latest_deposit {
                    latest_deposit = at;
                }
            }
            "WITHDRAW" | "CLOSED" => {
                // The exchange may report more spent than deposited
                // transiently; clamp at zero instead of failing.
                available = match available.checked_sub(&entry.amount) {
                    Ok(rest) => rest,
                    Err(_) => Amount::zero(currency)?,
                };
            }
            "PAYBACK" => {
                tracing::info!(amount = %entry.amount, "ignoring PAYBACK reserve entry");
            }
            other => {
                tracing::warn!(entry_type = other, "unknown reserve history entry type");
            }
        }
    }

    let expiration =
        latest_deposit.map(|at| at + Duration::seconds(closing_delay_secs.max(0)));
    Ok((available, expiration))
}

/// Reserve status probe: query the exchange and fold the result into the
/// local balance counters.
pub async fn refresh_reserve_balance(
    db: &Database,
    exchanges: &ExchangeRegistry,
    instance: &InstanceHandle,
    config: &Config,
) -> Result<(), TipError> {
    let keys = reserve_keys(instance)?;
    let reserve_pub = keys.public_hex();
    let client = tip_exchange(exchanges, config)?;

    db.ensure_tip_reserve(instance.id(), &reserve_pub, &config.currency)
        .await?;

    let exchange_keys = client.keys().await?;
    let status = client.reserve_status(&reserve_pub).await?;

    let (available, expiration) = fold_reserve_history(
        &status.history,
        &config.currency,
        exchange_keys.reserve_closing_delay_secs,
    )?;

    tracing::info!(
        instance = %instance.id(),
        balance = %available,
        "tip reserve probed"
    );
    db.update_reserve_balance(instance.id(), &available, expiration)
        .await?;
    Ok(())
}

fn tip_uri(config: &Config, tip_id: Uuid) -> String {
    let host = config
        .merchant_base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!("taler://tip/{}/{}", host, tip_id)
}

/// Authorize a tip. When the locally known balance is short, the
/// reserve is re-probed once and the authorization retried.
pub async fn authorize_tip(
    db: &Database,
    exchanges: &ExchangeRegistry,
    instance: &InstanceHandle,
    config: &Config,
    amount: &Amount,
    justification: &str,
    extra: serde_json::Value,
) -> Result<TipAuthorization, TipError> {
    let keys = reserve_keys(instance)?;
    let reserve_pub = keys.public_hex();

    db.ensure_tip_reserve(instance.id(), &reserve_pub, &config.currency)
        .await?;

    let expiration = Utc::now() + TIP_EXPIRATION;
    let tip = DbTip {
        tip_id: Uuid::new_v4(),
        instance_id: instance.id().to_string(),
        reserve_pub,
        amount: amount.to_string(),
        picked_up: Amount::zero(amount.currency())?.to_string(),
        justification: justification.to_string(),
        extra,
        expiration,
        creation_time: Utc::now(),
    };

    match db.authorize_tip(&tip).await {
        Ok(()) => {}
        Err(DbError::InsufficientTipFunds) => {
            // The local balance may be stale; probe the exchange once.
            refresh_reserve_balance(db, exchanges, instance, config).await?;
            db.authorize_tip(&tip).await.map_err(TipError::from)?;
        }
        Err(e) => return Err(e.into()),
    }

    tracing::info!(
        instance = %instance.id(),
        tip_id = %tip.tip_id,
        amount = %amount,
        "tip authorized"
    );
    Ok(TipAuthorization {
        tip_id: tip.tip_id,
        taler_tip_uri: tip_uri(config, tip.tip_id),
        expiration,
    })
}

/// Authorized / picked-up / available totals for an instance.
pub async fn query_tips(
    db: &Database,
    instance: &InstanceHandle,
    config: &Config,
) -> Result<TipStatus, TipError> {
    let reserve = db
        .get_tip_reserve(instance.id())
        .await?
        .ok_or(TipError::InstanceDoesNotTip)?;

    let authorized: Amount = reserve.authorized_total.parse()?;
    let picked_up: Amount = reserve.picked_up_total.parse()?;
    let committed: Amount = reserve.committed_balance.parse()?;
    let available = match committed.checked_sub(&authorized) {
        Ok(rest) => rest,
        Err(_) => Amount::zero(&config.currency)?,
    };

    Ok(TipStatus {
        authorized_total: authorized,
        picked_up_total: picked_up,
        available_balance: available,
    })
}

/// Payload a reserve signature binds for one withdrawal.
pub fn withdraw_payload(reserve_pub: &str, denom_pub: &str, coin_ev: &str) -> String {
    format!("{}|{}|{}", reserve_pub, denom_pub, coin_ev)
}

/// Wallet pickup: sign a withdrawal per planchet against the reserve and
/// forward the exchange's blind signatures.
pub async fn pickup_tip(
    db: &Database,
    exchanges: &ExchangeRegistry,
    instance: &InstanceHandle,
    config: &Config,
    tip_id: Uuid,
    planchets: &[Planchet],
) -> Result<Vec<PlanchetSignature>, TipError> {
    if planchets.is_empty() {
        return Err(TipError::InvalidPlanchet("no planchets submitted".to_string()));
    }

    let tip = db
        .get_tip(tip_id)
        .await?
        .ok_or(TipError::TipNotFound(tip_id))?;
    if tip.instance_id != instance.id() {
        return Err(TipError::TipNotFound(tip_id));
    }

    let keys = reserve_keys(instance)?;
    let reserve_pub = keys.public_hex();
    if reserve_pub != tip.reserve_pub {
        return Err(TipError::ReserveUnknown);
    }

    let client = tip_exchange(exchanges, config)?;

    // Price the pickup: each planchet withdraws one coin of its
    // denomination's value.
    let mut total = Amount::zero(&config.currency)?;
    for planchet in planchets {
        let denom = client
            .deposit_denomination(&planchet.denom_pub)
            .await?
            .ok_or_else(|| {
                TipError::InvalidPlanchet(format!(
                    "denomination {} unknown or expired",
                    planchet.denom_pub
                ))
            })?;
        total = total.checked_add(&denom.value)?;
    }

    // Account first: the constraint picked_up + this ≤ authorized is
    // enforced in the database. Exchange-side withdrawal of the same
    // planchet is idempotent, so a retry after a crash is safe.
    db.record_tip_pickup(tip_id, &total, planchets.len() as i32)
        .await?;

    let mut signatures = Vec::with_capacity(planchets.len());
    for planchet in planchets {
        let payload = withdraw_payload(&reserve_pub, &planchet.denom_pub, &planchet.coin_ev);
        let reserve_sig = keys.sign(purpose::TIP_PICKUP, payload.as_bytes());
        let response = client
            .withdraw(&WithdrawRequest {
                reserve_pub: reserve_pub.clone(),
                reserve_sig,
                denom_pub: planchet.denom_pub.clone(),
                coin_ev: planchet.coin_ev.clone(),
            })
            .await?;
        signatures.push(PlanchetSignature {
            coin_ev: planchet.coin_ev.clone(),
            ev_sig: response.ev_sig,
        });
    }

    tracing::info!(tip_id = %tip_id, coins = signatures.len(), total = %total, "tip picked up");
    Ok(signatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Timestamp;

    fn eur(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn entry(entry_type: &str, amount: &str, at_ms: i64) -> ReserveHistoryEntry {
        ReserveHistoryEntry {
            entry_type: entry_type.to_string(),
            amount: eur(amount),
            timestamp: Timestamp::from_millis(at_ms),
        }
    }

    #[test]
    fn test_fold_deposits_credit() {
        let history = vec![entry("DEPOSIT", "EUR:10", 1000), entry("DEPOSIT", "EUR:0.02", 2000)];
        let (available, expiration) = fold_reserve_history(&history, "EUR", 3600).unwrap();
        assert_eq!(available, eur("EUR:10.02"));
        // Expiration keys off the latest deposit.
        let exp = expiration.unwrap();
        assert_eq!(exp.timestamp_millis(), 2000 + 3600 * 1000);
    }

    #[test]
    fn test_fold_withdrawals_and_close_debit() {
        let history = vec![
            entry("DEPOSIT", "EUR:10", 1000),
            entry("WITHDRAW", "EUR:4", 2000),
            entry("CLOSED", "EUR:1", 3000),
        ];
        let (available, _) = fold_reserve_history(&history, "EUR", 3600).unwrap();
        assert_eq!(available, eur("EUR:5"));
    }

    #[test]
    fn test_fold_ignores_payback() {
        let history = vec![
            entry("DEPOSIT", "EUR:10", 1000),
            entry("PAYBACK", "EUR:3", 2000),
        ];
        let (available, _) = fold_reserve_history(&history, "EUR", 3600).unwrap();
        assert_eq!(available, eur("EUR:10"));
    }

    #[test]
    fn test_fold_clamps_overdraft() {
        let history = vec![
            entry("DEPOSIT", "EUR:1", 1000),
            entry("WITHDRAW", "EUR:5", 2000),
        ];
        let (available, _) = fold_reserve_history(&history, "EUR", 3600).unwrap();
        assert!(available.is_zero());
    }

    #[test]
    fn test_fold_empty_history() {
        let (available, expiration) = fold_reserve_history(&[], "EUR", 3600).unwrap();
        assert!(available.is_zero());
        assert!(expiration.is_none());
    }

    #[test]
    fn test_withdraw_payload_is_stable() {
        assert_eq!(withdraw_payload("rp", "dp", "ev"), "rp|dp|ev");
    }
}
