//! Refund ledger
//!
//! Authorized refund totals only ever grow, and never past the contract
//! amount. Increases append delta rows with monotone rtransaction ids;
//! the per-coin breakdown wallets redeem is recomputed deterministically
//! from the ledger at pickup time, so pickup records are derived state.
//!
//! Merchant refund signatures are deterministic: the same
//! (contract, coin, rtransaction, amount, fee) inputs always produce the
//! same signature, which makes pickup idempotent.

use serde::Serialize;
use thiserror::Error;

use crate::amount::{Amount, AmountError};
use crate::crypto::keys::purpose;
use crate::db::models::{DbContract, DbDeposit};
use crate::db::{Database, DbError};
use crate::instance::InstanceHandle;
use crate::longpoll::LongPollRegistry;

#[derive(Debug, Error)]
pub enum RefundError {
    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Contract has not been paid")]
    ContractNotPaid,

    #[error("Requested refund exceeds the contract amount")]
    ExceedsContractAmount,

    #[error(transparent)]
    Db(DbError),

    #[error("Invariant violated: {0}")]
    Internal(String),
}

impl From<DbError> for RefundError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ContractNotFound(h) => RefundError::NotFound(h),
            DbError::ContractNotPaid(_) => RefundError::ContractNotPaid,
            DbError::RefundExceedsContract => RefundError::ExceedsContractAmount,
            other => RefundError::Db(other),
        }
    }
}

impl From<AmountError> for RefundError {
    fn from(e: AmountError) -> Self {
        RefundError::Internal(e.to_string())
    }
}

/// Merchant signature authorizing the wallet to reclaim part of one coin
/// at the exchange.
#[derive(Debug, Clone, Serialize)]
pub struct RefundPermission {
    pub h_contract: String,
    pub coin_pub: String,
    pub exchange_url: String,
    pub rtransaction_id: i64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub merchant_pub: String,
    pub merchant_sig: String,
}

/// Payload bound by a refund permission signature.
pub fn refund_permission_payload(
    h_contract: &str,
    coin_pub: &str,
    rtransaction_id: i64,
    refund_amount: &Amount,
    refund_fee: &Amount,
) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        h_contract, coin_pub, rtransaction_id, refund_amount, refund_fee
    )
}

/// One coin's slice of one authorization row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareAssignment {
    pub deposit_index: usize,
    pub rtransaction_id: i64,
    pub amount: Amount,
}

/// Deterministically split the authorization ledger across deposits.
///
/// Walks deposits in persisted order, consuming each authorization delta
/// greedily against the coins' deposited values. The same ledger always
/// yields the same assignment list. Should the ledger exceed the summed
/// coin capacity (rounding at fee granularity), the excess lands on the
/// last deposit.
pub fn compute_refund_shares(
    deposits: &[DbDeposit],
    authorizations: &[(i64, Amount)],
) -> Result<Vec<ShareAssignment>, AmountError> {
    let mut shares: Vec<ShareAssignment> = Vec::new();
    if deposits.is_empty() || authorizations.is_empty() {
        return Ok(shares);
    }

    let currency = authorizations[0].1.currency().to_string();
    let capacities: Vec<Amount> = deposits
        .iter()
        .map(|d| d.amount_with_fee.parse::<Amount>())
        .collect::<Result<_, _>>()?;

    let mut deposit_index = 0usize;
    let mut used = Amount::zero(&currency)?;

    for (rtid, delta) in authorizations {
        let mut remaining = delta.clone();
        while !remaining.is_zero() {
            if deposit_index >= deposits.len() {
                // Ledger overran the coin capacities: fold the rest into
                // the final assignment on the last deposit.
                match shares.last_mut() {
                    Some(last) => last.amount = last.amount.checked_add(&remaining)?,
                    None => shares.push(ShareAssignment {
                        deposit_index: deposits.len() - 1,
                        rtransaction_id: *rtid,
                        amount: remaining.clone(),
                    }),
                }
                break;
            }

            let available = capacities[deposit_index].checked_sub(&used)?;
            if available.is_zero() {
                deposit_index += 1;
                used = Amount::zero(&currency)?;
                continue;
            }

            let take = match remaining.cmp_checked(&available)? {
                std::cmp::Ordering::Greater => available.clone(),
                _ => remaining.clone(),
            };
            shares.push(ShareAssignment {
                deposit_index,
                rtransaction_id: *rtid,
                amount: take.clone(),
            });
            used = used.checked_add(&take)?;
            remaining = remaining.checked_sub(&take)?;
        }
    }

    Ok(shares)
}

/// Sign one permission for each computed share.
fn permissions_from_shares(
    deposits: &[DbDeposit],
    shares: &[ShareAssignment],
    h_contract: &str,
    instance: &InstanceHandle,
) -> Result<Vec<RefundPermission>, RefundError> {
    let merchant_pub = instance.public_key();
    let mut permissions = Vec::with_capacity(shares.len());
    for share in shares {
        let deposit = &deposits[share.deposit_index];
        let refund_fee: Amount = deposit.refund_fee.parse()?;
        let payload = refund_permission_payload(
            h_contract,
            &deposit.coin_pub,
            share.rtransaction_id,
            &share.amount,
            &refund_fee,
        );
        permissions.push(RefundPermission {
            h_contract: h_contract.to_string(),
            coin_pub: deposit.coin_pub.clone(),
            exchange_url: deposit.exchange_url.clone(),
            rtransaction_id: share.rtransaction_id,
            refund_amount: share.amount.clone(),
            refund_fee,
            merchant_pub: merchant_pub.clone(),
            merchant_sig: instance.keys.sign(purpose::REFUND, payload.as_bytes()),
        });
    }
    Ok(permissions)
}

/// Outcome of a refund increase.
#[derive(Debug)]
pub struct RefundIncreaseResult {
    pub effective_total: Amount,
    pub increased: bool,
}

/// Monotone refund increase for an order; wakes long-poll waiters when
/// the total grows. Returns the effective (possibly unchanged) total.
pub async fn increase_refund(
    db: &Database,
    longpoll: &LongPollRegistry,
    instance: &InstanceHandle,
    order_id: &str,
    requested_total: &Amount,
    reason: &str,
) -> Result<RefundIncreaseResult, RefundError> {
    let contract = db
        .get_contract(instance.id(), order_id)
        .await?
        .ok_or_else(|| RefundError::NotFound(order_id.to_string()))?;

    let outcome = db
        .increase_refund(&contract.h_contract, requested_total, reason)
        .await?;

    if outcome.increased {
        tracing::info!(
            instance = %instance.id(),
            order_id,
            total = %outcome.effective_total,
            "refund authorization increased"
        );
        longpoll
            .resume_refund(instance.id(), order_id, &outcome.effective_total)
            .await;
    }

    Ok(RefundIncreaseResult {
        effective_total: outcome.effective_total,
        increased: outcome.increased,
    })
}

/// Wallet-facing pickup: the current per-coin refund permissions of an
/// order, derived from the ledger. Empty when nothing was authorized.
pub async fn lookup_refund_permissions(
    db: &Database,
    instance: &InstanceHandle,
    order_id: &str,
) -> Result<Vec<RefundPermission>, RefundError> {
    let contract = db
        .get_contract(instance.id(), order_id)
        .await?
        .ok_or_else(|| RefundError::NotFound(order_id.to_string()))?;

    let rows = db.refunds_for_contract(&contract.h_contract).await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let deposits = db.deposits_for_contract(&contract.h_contract).await?;
    let authorizations = rows
        .iter()
        .map(|r| Ok((r.rtransaction_id, r.refund_amount.parse::<Amount>()?)))
        .collect::<Result<Vec<_>, AmountError>>()?;

    let shares = compute_refund_shares(&deposits, &authorizations)?;
    permissions_from_shares(&deposits, &shares, &contract.h_contract, instance)
}

/// Abort-mode shares: each deposited coin is refunded its contribution
/// net of the deposit fee, minus the per-coin refund fee. A coin whose
/// residual does not reach its refund fee yields nothing and is
/// skipped.
fn abort_shares(deposits: &[DbDeposit]) -> Result<Vec<ShareAssignment>, AmountError> {
    let mut shares = Vec::new();
    for (i, d) in deposits.iter().enumerate() {
        let with_fee: Amount = d.amount_with_fee.parse()?;
        let deposit_fee: Amount = d.deposit_fee.parse()?;
        let refund_fee: Amount = d.refund_fee.parse()?;
        let net = with_fee.checked_sub(&deposit_fee)?;
        let amount = match net.checked_sub(&refund_fee) {
            Ok(amount) => amount,
            Err(_) => Amount::zero(net.currency())?,
        };
        if amount.is_zero() {
            continue;
        }
        shares.push(ShareAssignment {
            deposit_index: i,
            rtransaction_id: 1,
            amount,
        });
    }
    Ok(shares)
}

/// Abort-mode refunds: the payment never completed, so the ledger's
/// paid-only rule does not apply. Every already-deposited coin gets a
/// refund permission over its contribution, using the same signing
/// scheme as regular pickups.
pub fn abort_refund_permissions(
    contract: &DbContract,
    deposits: &[DbDeposit],
    instance: &InstanceHandle,
) -> Result<Vec<RefundPermission>, RefundError> {
    let shares = abort_shares(deposits)?;
    permissions_from_shares(deposits, &shares, &contract.h_contract, instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn eur(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn deposit(coin: &str, amount_with_fee: &str) -> DbDeposit {
        DbDeposit {
            deposit_serial: 0,
            h_contract: "hc".to_string(),
            coin_pub: coin.to_string(),
            exchange_url: "https://exchange.test".to_string(),
            amount_with_fee: amount_with_fee.to_string(),
            deposit_fee: "EUR:0.01000000".to_string(),
            refund_fee: "EUR:0.01000000".to_string(),
            wire_fee: "EUR:0.01000000".to_string(),
            exchange_pub: "ep".to_string(),
            exchange_sig: "es".to_string(),
            proof: serde_json::json!({}),
            wire_transfer_deadline: Some(Utc::now()),
            refund_deadline: Some(Utc::now()),
        }
    }

    fn total_of(shares: &[ShareAssignment]) -> Amount {
        let mut total = eur("EUR:0");
        for s in shares {
            total = total.checked_add(&s.amount).unwrap();
        }
        total
    }

    #[test]
    fn test_single_coin_single_auth() {
        let deposits = vec![deposit("c1", "EUR:5.00000000")];
        let shares = compute_refund_shares(&deposits, &[(1, eur("EUR:0.10"))]).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].deposit_index, 0);
        assert_eq!(shares[0].rtransaction_id, 1);
        assert_eq!(shares[0].amount, eur("EUR:0.10"));
    }

    #[test]
    fn test_greedy_split_across_coins() {
        let deposits = vec![
            deposit("c1", "EUR:2.00000000"),
            deposit("c2", "EUR:3.00000000"),
        ];
        let shares = compute_refund_shares(&deposits, &[(1, eur("EUR:4"))]).unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0], ShareAssignment {
            deposit_index: 0,
            rtransaction_id: 1,
            amount: eur("EUR:2"),
        });
        assert_eq!(shares[1], ShareAssignment {
            deposit_index: 1,
            rtransaction_id: 1,
            amount: eur("EUR:2"),
        });
    }

    #[test]
    fn test_second_authorization_continues_where_first_ended() {
        let deposits = vec![
            deposit("c1", "EUR:3.00000000"),
            deposit("c2", "EUR:3.00000000"),
        ];
        let auths = vec![(1, eur("EUR:2")), (2, eur("EUR:2"))];
        let shares = compute_refund_shares(&deposits, &auths).unwrap();
        assert_eq!(
            shares,
            vec![
                ShareAssignment {
                    deposit_index: 0,
                    rtransaction_id: 1,
                    amount: eur("EUR:2"),
                },
                ShareAssignment {
                    deposit_index: 0,
                    rtransaction_id: 2,
                    amount: eur("EUR:1"),
                },
                ShareAssignment {
                    deposit_index: 1,
                    rtransaction_id: 2,
                    amount: eur("EUR:1"),
                },
            ]
        );
    }

    #[test]
    fn test_shares_are_deterministic() {
        let deposits = vec![
            deposit("c1", "EUR:2.50000000"),
            deposit("c2", "EUR:2.50000000"),
        ];
        let auths = vec![(1, eur("EUR:0.10")), (2, eur("EUR:3"))];
        let a = compute_refund_shares(&deposits, &auths).unwrap();
        let b = compute_refund_shares(&deposits, &auths).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_share_sum_equals_authorized_total() {
        let deposits = vec![
            deposit("c1", "EUR:1.25000000"),
            deposit("c2", "EUR:2.00000000"),
            deposit("c3", "EUR:1.75000000"),
        ];
        let auths = vec![(1, eur("EUR:0.50")), (2, eur("EUR:2.75")), (3, eur("EUR:1"))];
        let shares = compute_refund_shares(&deposits, &auths).unwrap();
        assert_eq!(total_of(&shares), eur("EUR:4.25"));
    }

    #[test]
    fn test_overrun_lands_on_last_deposit() {
        let deposits = vec![deposit("c1", "EUR:1.00000000")];
        let shares = compute_refund_shares(&deposits, &[(1, eur("EUR:1.50"))]).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].amount, eur("EUR:1.50"));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(compute_refund_shares(&[], &[(1, eur("EUR:1"))])
            .unwrap()
            .is_empty());
        let deposits = vec![deposit("c1", "EUR:1.00000000")];
        assert!(compute_refund_shares(&deposits, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_abort_shares_subtract_deposit_and_refund_fees() {
        // 5.00 with fee - 0.01 deposit fee - 0.01 refund fee = 4.98
        let deposits = vec![deposit("c1", "EUR:5.00000000")];
        let shares = abort_shares(&deposits).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].rtransaction_id, 1);
        assert_eq!(shares[0].amount, eur("EUR:4.98"));
    }

    #[test]
    fn test_abort_shares_skip_coins_below_refund_fee() {
        // Residual 0.005 cannot pay the 0.01 refund fee; nothing to
        // reclaim for that coin.
        let deposits = vec![
            deposit("c1", "EUR:0.01500000"),
            deposit("c2", "EUR:2.00000000"),
        ];
        let shares = abort_shares(&deposits).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].deposit_index, 1);
        assert_eq!(shares[0].amount, eur("EUR:1.98"));
    }

    #[test]
    fn test_permission_payload_is_stable() {
        let a = refund_permission_payload("hc", "c1", 1, &eur("EUR:0.10"), &eur("EUR:0.01"));
        let b = refund_permission_payload("hc", "c1", 1, &eur("EUR:0.10"), &eur("EUR:0.01"));
        assert_eq!(a, b);
        assert_eq!(a, "hc|c1|1|EUR:0.10000000|EUR:0.01000000");
    }
}
