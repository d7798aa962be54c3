//! Payment coordinator
//!
//! Drives a payment submission end to end: validate the coin set
//! against the claimed contract, fan the deposits out to the exchanges
//! with bounded concurrency, classify per-coin outcomes, and either
//! finalize the payment with a signed receipt or report the per-coin
//! failures. Abort mode turns the already-deposited subset into refund
//! permissions.
//!
//! Deposits are idempotent facts: once an exchange confirmed a coin,
//! the proof is persisted immediately and survives request
//! cancellation. Replaying a completed payment reconstructs the receipt
//! without touching any exchange.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::amount::{sum_amounts, Amount, AmountError};
use crate::crypto::keys::purpose;
use crate::db::deposits::NewDeposit;
use crate::db::models::{DbContract, DbDeposit};
use crate::db::{Database, DbError};
use crate::exchange::types::{DenominationKey, DepositRequest};
use crate::exchange::{DepositFailure, ExchangeClient, ExchangeRegistry};
use crate::instance::InstanceHandle;
use crate::longpoll::LongPollRegistry;
use crate::refund::{abort_refund_permissions, RefundError, RefundPermission};
use crate::timestamp::Timestamp;

/// Upper bound on concurrently in-flight deposits per exchange.
pub const MAX_INFLIGHT_PER_EXCHANGE: usize = 16;

/// Pause before the single retry of a retryable deposit failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One coin of a payment submission.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoinPayment {
    pub exchange_url: String,
    pub denom_pub: String,
    pub denom_sig: String,
    pub coin_pub: String,
    pub coin_sig: String,
    pub amount_with_fee: Amount,
    pub amount_without_fee: Amount,
}

/// Per-coin failure classification reported back to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinErrorKind {
    DoubleSpend,
    DenominationInvalid,
    ExchangeProtocol,
    ExchangeUnavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoinError {
    pub coin_pub: String,
    pub kind: CoinErrorKind,
    pub hint: String,
    /// Exchange-signed evidence (coin history) where applicable, so the
    /// wallet can verify independently.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum PayError {
    #[error("Order not found: {0}")]
    ContractNotFound(String),

    #[error("Coin set rejected: {0}")]
    CoinValidation(String),

    #[error("Coin names unconfigured exchange: {0}")]
    UnknownExchange(String),

    #[error("{} coin(s) failed", errors.len())]
    CoinErrors { errors: Vec<CoinError> },

    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    #[error("Abort requested but the payment already completed")]
    AbortAfterCompletion,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Refund(#[from] RefundError),
}

impl From<AmountError> for PayError {
    fn from(e: AmountError) -> Self {
        PayError::CoinValidation(e.to_string())
    }
}

/// Signed success receipt.
#[derive(Debug, Clone, Serialize)]
pub struct PayReceipt {
    pub h_contract: String,
    pub merchant_pub: String,
    pub merchant_sig: String,
}

/// Outcome of a pay call.
#[derive(Debug)]
pub enum PayOutcome {
    /// Payment complete; receipt signed.
    Paid(PayReceipt),
    /// Abort accepted: refund permissions for the deposited subset.
    Aborted(Vec<RefundPermission>),
}

fn receipt_for(contract: &DbContract, instance: &InstanceHandle) -> PayReceipt {
    PayReceipt {
        h_contract: contract.h_contract.clone(),
        merchant_pub: instance.public_key(),
        merchant_sig: instance
            .keys
            .sign(purpose::PAYMENT_OK, contract.h_contract.as_bytes()),
    }
}

/// Check the submitted coin set against the contract before any network
/// I/O. `denoms` carries the (already validity-checked) denomination of
/// each coin in submission order; `wire_fee` is the exchange's current
/// fee for the contract's wire method.
pub fn check_preconditions(
    contract_amount: &Amount,
    max_fee: &Amount,
    wire_fee_amortization: u32,
    coins: &[CoinPayment],
    denoms: &[DenominationKey],
    wire_fee: &Amount,
) -> Result<(), PayError> {
    if coins.is_empty() {
        return Err(PayError::CoinValidation("no coins submitted".to_string()));
    }

    let mut fee_total = Amount::zero(contract_amount.currency())?;
    for (coin, denom) in coins.iter().zip(denoms) {
        let expected_without = coin.amount_with_fee.checked_sub(&denom.fee_deposit)?;
        if expected_without != coin.amount_without_fee {
            return Err(PayError::CoinValidation(format!(
                "coin {}: amount_with_fee - deposit fee is {}, claimed {}",
                coin.coin_pub, expected_without, coin.amount_without_fee
            )));
        }
        fee_total = fee_total.checked_add(&denom.fee_deposit)?;
    }

    // Amortized wire-fee share counts against the contract's fee budget.
    let wire_share = wire_fee.divided_by(wire_fee_amortization.max(1))?;
    let burden = fee_total.checked_add(&wire_share)?;
    if burden.cmp_checked(max_fee)? == std::cmp::Ordering::Greater {
        return Err(PayError::CoinValidation(format!(
            "fees {} exceed the contract's maximum {}",
            burden, max_fee
        )));
    }

    // Coverage: the merchant absorbs deposit fees up to max_fee, the
    // wallet covers any excess. Within the fee budget this reduces to
    // requiring the gross coin values to reach the contract amount.
    let with_fees: Vec<Amount> = coins.iter().map(|c| c.amount_with_fee.clone()).collect();
    let gross = sum_amounts(contract_amount.currency(), &with_fees)?;
    let uncovered = match fee_total.checked_sub(max_fee) {
        Ok(excess) => excess,
        Err(_) => Amount::zero(contract_amount.currency())?,
    };
    let effective = gross.checked_sub(&uncovered)?;
    if effective.cmp_checked(contract_amount)? == std::cmp::Ordering::Less {
        return Err(PayError::CoinValidation(format!(
            "coins cover {} but the contract is over {}",
            effective, contract_amount
        )));
    }

    Ok(())
}

struct CoinOutcome {
    index: usize,
    result: Result<(), CoinError>,
}

/// Process a payment submission for a claimed contract.
pub async fn process_payment(
    db: &Database,
    exchanges: &ExchangeRegistry,
    longpoll: &LongPollRegistry,
    instance: &InstanceHandle,
    order_id: &str,
    coins: Vec<CoinPayment>,
    abort: bool,
) -> Result<PayOutcome, PayError> {
    let contract = db
        .get_contract(instance.id(), order_id)
        .await?
        .ok_or_else(|| PayError::ContractNotFound(order_id.to_string()))?;

    let existing = db.deposits_for_contract(&contract.h_contract).await?;

    if abort {
        return abort_payment(db, &contract, instance, &coins, &existing).await;
    }

    // Fast path: a replay of a completed payment reconstructs the
    // receipt without contacting any exchange.
    if contract.paid && all_coins_deposited(&coins, &existing) {
        tracing::debug!(order_id, "payment replay, returning stored receipt");
        return Ok(PayOutcome::Paid(receipt_for(&contract, instance)));
    }

    let contract_amount: Amount = contract.amount.parse().map_err(DbError::from)?;
    let max_fee: Amount = contract.max_fee.parse().map_err(DbError::from)?;

    // Resolve every coin's exchange and denomination up front.
    let mut clients: Vec<Arc<ExchangeClient>> = Vec::with_capacity(coins.len());
    let mut denoms: Vec<DenominationKey> = Vec::with_capacity(coins.len());
    for coin in &coins {
        let client = exchanges
            .get(&coin.exchange_url)
            .ok_or_else(|| PayError::UnknownExchange(coin.exchange_url.clone()))?;
        let denom = client
            .deposit_denomination(&coin.denom_pub)
            .await
            .map_err(|e| PayError::ExchangeUnavailable(e.to_string()))?
            .ok_or_else(|| PayError::CoinErrors {
                errors: vec![CoinError {
                    coin_pub: coin.coin_pub.clone(),
                    kind: CoinErrorKind::DenominationInvalid,
                    hint: format!("denomination {} unknown or expired", coin.denom_pub),
                    evidence: None,
                }],
            })?;
        clients.push(client);
        denoms.push(denom);
    }

    let wire_fee = current_wire_fee(db, &contract, instance, &clients).await?;
    check_preconditions(
        &contract_amount,
        &max_fee,
        contract.wire_fee_amortization as u32,
        &coins,
        &denoms,
        &wire_fee,
    )?;

    // Fan the deposits out, bounded per exchange.
    let outcomes = deposit_all(db, &contract, &coins, &clients, &denoms, &wire_fee, &existing).await;

    let mut errors: Vec<CoinError> = Vec::new();
    let mut ok_indices: Vec<usize> = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(()) => ok_indices.push(outcome.index),
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        // Rejected coins only fail the payment when the remainder of
        // successful deposits cannot cover the contract; only enough
        // coins need to end up in the paid set.
        if !remainder_covers(&contract_amount, &max_fee, &coins, &denoms, &ok_indices)? {
            // Only transient failures left: the wallet should simply
            // retry, so surface as unavailability rather than a
            // coin-level conflict.
            if errors
                .iter()
                .all(|e| e.kind == CoinErrorKind::ExchangeUnavailable)
            {
                return Err(PayError::ExchangeUnavailable(
                    errors
                        .first()
                        .map(|e| e.hint.clone())
                        .unwrap_or_else(|| "exchange unreachable".to_string()),
                ));
            }
            return Err(PayError::CoinErrors { errors });
        }
        tracing::warn!(
            instance = %instance.id(),
            order_id,
            rejected = errors.len(),
            "payment covered despite rejected coins"
        );
    }

    db.mark_contract_paid(&contract.h_contract).await?;
    longpoll.resume_paid(instance.id(), order_id).await;
    tracing::info!(
        instance = %instance.id(),
        order_id,
        coins = ok_indices.len(),
        "payment complete"
    );
    Ok(PayOutcome::Paid(receipt_for(&contract, instance)))
}

/// Whether the successfully deposited subset still covers the contract,
/// under the same fee-absorption rule as the precondition check.
fn remainder_covers(
    contract_amount: &Amount,
    max_fee: &Amount,
    coins: &[CoinPayment],
    denoms: &[DenominationKey],
    ok_indices: &[usize],
) -> Result<bool, PayError> {
    let mut gross = Amount::zero(contract_amount.currency())?;
    let mut fee_total = Amount::zero(contract_amount.currency())?;
    for &i in ok_indices {
        gross = gross.checked_add(&coins[i].amount_with_fee)?;
        fee_total = fee_total.checked_add(&denoms[i].fee_deposit)?;
    }
    let uncovered = match fee_total.checked_sub(max_fee) {
        Ok(excess) => excess,
        Err(_) => Amount::zero(contract_amount.currency())?,
    };
    let effective = gross.checked_sub(&uncovered)?;
    Ok(effective.cmp_checked(contract_amount)? != std::cmp::Ordering::Less)
}

/// True when every submitted coin already has a deposit row.
fn all_coins_deposited(coins: &[CoinPayment], existing: &[DbDeposit]) -> bool {
    !coins.is_empty()
        && coins
            .iter()
            .all(|c| existing.iter().any(|d| d.coin_pub == c.coin_pub))
}

/// The wire method of a payto URI: `payto://METHOD/...`.
fn wire_method_of(payto_uri: &str) -> &str {
    payto_uri
        .strip_prefix("payto://")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("x-taler-bank")
}

async fn current_wire_fee(
    db: &Database,
    contract: &DbContract,
    instance: &InstanceHandle,
    clients: &[Arc<ExchangeClient>],
) -> Result<Amount, PayError> {
    // All coins of one contract settle to the same merchant account; the
    // relevant fee is whatever the (first) exchange currently charges
    // for its wire method. Absent a published fee, assume zero.
    let currency = contract
        .amount
        .parse::<Amount>()
        .map_err(DbError::from)?
        .currency()
        .to_string();
    let Some(client) = clients.first() else {
        return Ok(Amount::zero(&currency)?);
    };

    let wire_method = instance
        .account_by_hash(&contract.h_wire)
        .map(|a| wire_method_of(&a.payto_uri).to_string())
        .unwrap_or_else(|| "x-taler-bank".to_string());

    if let Some(fee) = db
        .wire_fee_for(client.base_url(), &wire_method, Utc::now())
        .await?
    {
        return Ok(fee.wire_fee.parse().map_err(DbError::from)?);
    }

    // Fall back to the fee schedule in the exchange's key set, caching
    // it for the reconciler.
    if let Ok(keys) = client.keys().await {
        let now = Utc::now();
        for spec in &keys.wire_fees {
            if spec.wire_method != wire_method {
                continue;
            }
            let started = spec
                .start_date
                .millis()
                .map_or(true, |ms| ms <= now.timestamp_millis());
            if started && !spec.end_date.is_expired(now) {
                let fee = crate::db::models::DbWireFee {
                    exchange_url: client.base_url().to_string(),
                    wire_method: spec.wire_method.clone(),
                    wire_fee: spec.wire_fee.to_string(),
                    closing_fee: spec.closing_fee.to_string(),
                    start_date: spec.start_date.to_datetime().unwrap_or(now),
                    end_date: spec.end_date.to_datetime().unwrap_or(now),
                };
                db.store_wire_fee(&fee).await?;
                return Ok(spec.wire_fee.clone());
            }
        }
    }

    Ok(Amount::zero(&currency)?)
}

/// Submit all coins, grouped by exchange with a per-exchange in-flight
/// bound. Successful deposits are persisted before this returns.
async fn deposit_all(
    db: &Database,
    contract: &DbContract,
    coins: &[CoinPayment],
    clients: &[Arc<ExchangeClient>],
    denoms: &[DenominationKey],
    wire_fee: &Amount,
    existing: &[DbDeposit],
) -> Vec<CoinOutcome> {
    let mut limits: HashMap<String, Arc<Semaphore>> = HashMap::new();
    for client in clients {
        limits
            .entry(client.base_url().to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_INFLIGHT_PER_EXCHANGE)));
    }

    let tasks = coins.iter().enumerate().map(|(index, coin)| {
        let client = clients[index].clone();
        let denom = denoms[index].clone();
        let limit = limits[client.base_url()].clone();
        let already = existing.iter().any(|d| d.coin_pub == coin.coin_pub);

        async move {
            if already {
                // Deposited in an earlier (partial) attempt; idempotent.
                return CoinOutcome {
                    index,
                    result: Ok(()),
                };
            }

            let _permit = match limit.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return CoinOutcome {
                        index,
                        result: Err(CoinError {
                            coin_pub: coin.coin_pub.clone(),
                            kind: CoinErrorKind::ExchangeUnavailable,
                            hint: "deposit scheduler shut down".to_string(),
                            evidence: None,
                        }),
                    }
                }
            };
            let request = DepositRequest {
                h_contract: contract.h_contract.clone(),
                coin_pub: coin.coin_pub.clone(),
                denom_pub: coin.denom_pub.clone(),
                denom_sig: coin.denom_sig.clone(),
                coin_sig: coin.coin_sig.clone(),
                amount_with_fee: coin.amount_with_fee.clone(),
                merchant_pub: contract
                    .contract_terms
                    .get("merchant_pub")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                h_wire: contract.h_wire.clone(),
                timestamp: Timestamp::now(),
                refund_deadline: contract.refund_deadline.into(),
                wire_transfer_deadline: contract.wire_transfer_deadline.into(),
            };

            let mut attempt = client.deposit(&request).await;
            if let Err(failure) = &attempt {
                if failure.is_retryable() {
                    tracing::warn!(
                        coin = %coin.coin_pub,
                        exchange = %client.base_url(),
                        "deposit failed transiently, retrying once"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    attempt = client.deposit(&request).await;
                }
            }

            let result = match attempt {
                Ok(confirmation) => {
                    let proof = serde_json::to_value(&confirmation)
                        .unwrap_or(serde_json::Value::Null);
                    let stored = db
                        .insert_deposit(&NewDeposit {
                            h_contract: &contract.h_contract,
                            coin_pub: &coin.coin_pub,
                            exchange_url: client.base_url(),
                            amount_with_fee: &coin.amount_with_fee.to_string(),
                            deposit_fee: &denom.fee_deposit.to_string(),
                            refund_fee: &denom.fee_refund.to_string(),
                            wire_fee: &wire_fee.to_string(),
                            exchange_pub: &confirmation.exchange_pub,
                            exchange_sig: &confirmation.exchange_sig,
                            proof: &proof,
                            wire_transfer_deadline: contract.wire_transfer_deadline,
                            refund_deadline: contract.refund_deadline,
                        })
                        .await;
                    match stored {
                        Ok(()) => Ok(()),
                        Err(e) => Err(CoinError {
                            coin_pub: coin.coin_pub.clone(),
                            kind: CoinErrorKind::ExchangeUnavailable,
                            hint: format!("failed to persist deposit: {}", e),
                            evidence: None,
                        }),
                    }
                }
                Err(failure) => {
                    // Double-spend histories are evidence; keep them even
                    // though the payment is failing.
                    if let DepositFailure::DoubleSpend { history } = &failure {
                        if let Err(e) = db
                            .record_double_spend(
                                &contract.h_contract,
                                &coin.coin_pub,
                                client.base_url(),
                                history,
                            )
                            .await
                        {
                            tracing::warn!(
                                coin = %coin.coin_pub,
                                "failed to persist double-spend evidence: {}",
                                e
                            );
                        }
                    }
                    Err(classify_failure(&coin.coin_pub, failure))
                }
            };

            CoinOutcome { index, result }
        }
    });

    join_all(tasks).await
}

fn classify_failure(coin_pub: &str, failure: DepositFailure) -> CoinError {
    match failure {
        DepositFailure::DoubleSpend { history } => CoinError {
            coin_pub: coin_pub.to_string(),
            kind: CoinErrorKind::DoubleSpend,
            hint: "coin already spent according to the exchange".to_string(),
            evidence: Some(history),
        },
        DepositFailure::DenominationInvalid(hint) => CoinError {
            coin_pub: coin_pub.to_string(),
            kind: CoinErrorKind::DenominationInvalid,
            hint,
            evidence: None,
        },
        DepositFailure::Protocol(hint) => CoinError {
            coin_pub: coin_pub.to_string(),
            kind: CoinErrorKind::ExchangeProtocol,
            hint,
            evidence: None,
        },
        DepositFailure::Unavailable(hint) => CoinError {
            coin_pub: coin_pub.to_string(),
            kind: CoinErrorKind::ExchangeUnavailable,
            hint,
            evidence: None,
        },
    }
}

/// Abort handling: only valid while the payment is incomplete. Produces
/// refund permissions over whatever subset was already deposited.
async fn abort_payment(
    db: &Database,
    contract: &DbContract,
    instance: &InstanceHandle,
    coins: &[CoinPayment],
    existing: &[DbDeposit],
) -> Result<PayOutcome, PayError> {
    if contract.paid {
        return Err(PayError::AbortAfterCompletion);
    }
    // A strict subset at most: if every coin went through, the wallet
    // should complete instead of aborting.
    if all_coins_deposited(coins, existing) {
        return Err(PayError::AbortAfterCompletion);
    }

    let permissions = abort_refund_permissions(contract, existing, instance)?;
    tracing::info!(
        order_id = %contract.order_id,
        deposited = existing.len(),
        "payment aborted, issuing refund permissions"
    );
    Ok(PayOutcome::Aborted(permissions))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eur(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn coin(pub_key: &str, with_fee: &str, without_fee: &str) -> CoinPayment {
        CoinPayment {
            exchange_url: "https://exchange.test".to_string(),
            denom_pub: "d1".to_string(),
            denom_sig: "ds".to_string(),
            coin_pub: pub_key.to_string(),
            coin_sig: "cs".to_string(),
            amount_with_fee: eur(with_fee),
            amount_without_fee: eur(without_fee),
        }
    }

    fn denom(value: &str, fee: &str) -> DenominationKey {
        DenominationKey {
            denom_pub: "d1".to_string(),
            value: eur(value),
            fee_deposit: eur(fee),
            fee_refund: eur("EUR:0.01"),
            stamp_start: Timestamp::from_millis(0),
            stamp_expire_deposit: Timestamp::NEVER,
        }
    }

    #[test]
    fn test_preconditions_accept_exact_coverage() {
        let coins = vec![coin("c1", "EUR:5.01", "EUR:5")];
        let denoms = vec![denom("EUR:5.01", "EUR:0.01")];
        check_preconditions(&eur("EUR:5"), &eur("EUR:0.05"), 1, &coins, &denoms, &eur("EUR:0"))
            .expect("exact coverage must pass");
    }

    #[test]
    fn test_preconditions_merchant_absorbs_fee_within_budget() {
        // A 5.00 coin with a 0.01 deposit fee pays a 5.00 contract: the
        // fee fits the 0.05 budget, so the merchant absorbs it.
        let coins = vec![coin("c1", "EUR:5", "EUR:4.99")];
        let denoms = vec![denom("EUR:5", "EUR:0.01")];
        check_preconditions(
            &eur("EUR:5"),
            &eur("EUR:0.05"),
            1,
            &coins,
            &denoms,
            &eur("EUR:0.01"),
        )
        .expect("absorbed fee must not break coverage");
    }

    #[test]
    fn test_preconditions_reject_short_coverage() {
        let coins = vec![coin("c1", "EUR:3.01", "EUR:3")];
        let denoms = vec![denom("EUR:3.01", "EUR:0.01")];
        let err = check_preconditions(
            &eur("EUR:5"),
            &eur("EUR:0.05"),
            1,
            &coins,
            &denoms,
            &eur("EUR:0"),
        )
        .unwrap_err();
        assert!(matches!(err, PayError::CoinValidation(_)));
    }

    #[test]
    fn test_preconditions_reject_fee_mismatch() {
        // Wallet claims a contribution that ignores the deposit fee.
        let coins = vec![coin("c1", "EUR:5.01", "EUR:5.01")];
        let denoms = vec![denom("EUR:5.01", "EUR:0.01")];
        let err = check_preconditions(
            &eur("EUR:5"),
            &eur("EUR:0.05"),
            1,
            &coins,
            &denoms,
            &eur("EUR:0"),
        )
        .unwrap_err();
        assert!(matches!(err, PayError::CoinValidation(_)));
    }

    #[test]
    fn test_preconditions_enforce_fee_budget() {
        let coins = vec![coin("c1", "EUR:5.10", "EUR:5")];
        let denoms = vec![denom("EUR:5.10", "EUR:0.10")];
        // Deposit fee 0.10 + wire share 0.01 > max fee 0.05.
        let err = check_preconditions(
            &eur("EUR:5"),
            &eur("EUR:0.05"),
            1,
            &coins,
            &denoms,
            &eur("EUR:0.01"),
        )
        .unwrap_err();
        assert!(matches!(err, PayError::CoinValidation(_)));
    }

    #[test]
    fn test_preconditions_amortize_wire_fee() {
        let coins = vec![coin("c1", "EUR:5.01", "EUR:5")];
        let denoms = vec![denom("EUR:5.01", "EUR:0.01")];
        // Wire fee 0.08 would bust the 0.05 budget alone, but amortized
        // over 4 payments only 0.02 counts here.
        check_preconditions(
            &eur("EUR:5"),
            &eur("EUR:0.05"),
            4,
            &coins,
            &denoms,
            &eur("EUR:0.08"),
        )
        .expect("amortized wire fee must fit the budget");
    }

    #[test]
    fn test_preconditions_reject_empty_coin_set() {
        assert!(matches!(
            check_preconditions(&eur("EUR:5"), &eur("EUR:0.05"), 1, &[], &[], &eur("EUR:0")),
            Err(PayError::CoinValidation(_))
        ));
    }

    #[test]
    fn test_failure_classification() {
        let e = classify_failure(
            "c1",
            DepositFailure::DoubleSpend {
                history: serde_json::json!([]),
            },
        );
        assert_eq!(e.kind, CoinErrorKind::DoubleSpend);
        assert!(e.evidence.is_some());

        let e = classify_failure("c1", DepositFailure::Unavailable("503".to_string()));
        assert_eq!(e.kind, CoinErrorKind::ExchangeUnavailable);

        let e = classify_failure("c1", DepositFailure::Protocol("bad sig".to_string()));
        assert_eq!(e.kind, CoinErrorKind::ExchangeProtocol);
    }

    #[test]
    fn test_remainder_covers_with_rejected_coin() {
        // Two coins would overpay a 5.00 contract; losing one to a
        // double-spend still leaves enough.
        let coins = vec![
            coin("c1", "EUR:5.01", "EUR:5"),
            coin("c2", "EUR:2.01", "EUR:2"),
        ];
        let denoms = vec![denom("EUR:5.01", "EUR:0.01"), denom("EUR:2.01", "EUR:0.01")];
        assert!(remainder_covers(&eur("EUR:5"), &eur("EUR:0.05"), &coins, &denoms, &[0]).unwrap());
        // The small coin alone is short.
        assert!(
            !remainder_covers(&eur("EUR:5"), &eur("EUR:0.05"), &coins, &denoms, &[1]).unwrap()
        );
    }

    #[test]
    fn test_remainder_empty_subset_never_covers() {
        let coins = vec![coin("c1", "EUR:5.01", "EUR:5")];
        let denoms = vec![denom("EUR:5.01", "EUR:0.01")];
        assert!(!remainder_covers(&eur("EUR:5"), &eur("EUR:0.05"), &coins, &denoms, &[]).unwrap());
    }

    #[test]
    fn test_wire_method_extraction() {
        assert_eq!(wire_method_of("payto://iban/DE123"), "iban");
        assert_eq!(
            wire_method_of("payto://x-taler-bank/localhost/merchant"),
            "x-taler-bank"
        );
        assert_eq!(wire_method_of("garbage"), "x-taler-bank");
    }

    #[test]
    fn test_all_coins_deposited() {
        let coins = vec![coin("c1", "EUR:5.01", "EUR:5")];
        assert!(!all_coins_deposited(&coins, &[]));
        assert!(!all_coins_deposited(&[], &[]));
    }
}
