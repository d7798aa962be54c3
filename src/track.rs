//! Tracking & aggregation reconciler
//!
//! Joins the exchange's settlement evidence with local deposit records.
//! Track-by-order resolves each deposited coin to a wire transfer id
//! (lazily, via the exchange's track-transaction API); track-by-wtid
//! fetches the signed aggregate report, verifies it against the local
//! deposits, and caches it immutably.
//!
//! Verification failures here are fatal for the transfer in question:
//! an exchange that misreports amounts is misbehaving, and retrying
//! cannot fix that. The signed report is kept as evidence either way.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::amount::{Amount, AmountError};
use crate::db::models::DbTransfer;
use crate::db::{Database, DbError};
use crate::exchange::types::{TrackTransactionRequest, TransferDetails};
use crate::exchange::{ExchangeError, ExchangeRegistry, TrackResult};
use crate::instance::InstanceHandle;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("No deposits recorded for this order")]
    NoDeposits,

    #[error("Unconfigured exchange: {0}")]
    UnknownExchange(String),

    #[error("Exchange reported a deposit this merchant never made: {0}")]
    ExchangeReportedUnknownDeposit(String),

    #[error("Aggregate amounts do not add up: {0}")]
    AmountMismatch(String),

    #[error("Aggregate names a foreign merchant account: {0}")]
    MerchantAccountMismatch(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<AmountError> for TrackError {
    fn from(e: AmountError) -> Self {
        TrackError::AmountMismatch(e.to_string())
    }
}

/// One resolved wire transfer of an order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WtidRef {
    pub exchange_url: String,
    pub wtid: String,
}

/// Track-by-order result: known transfer ids plus whether some deposits
/// are still awaiting aggregation.
#[derive(Debug, serde::Serialize)]
pub struct TrackOrderResult {
    pub transfers: Vec<WtidRef>,
    pub pending: bool,
}

/// Resolve an order to its wire transfers, querying exchanges for any
/// deposit whose transfer is not yet known locally.
pub async fn track_order(
    db: &Database,
    exchanges: &ExchangeRegistry,
    instance: &InstanceHandle,
    order_id: &str,
) -> Result<TrackOrderResult, TrackError> {
    let contract = db
        .get_contract(instance.id(), order_id)
        .await?
        .ok_or_else(|| TrackError::NotFound(order_id.to_string()))?;

    let deposits = db.deposits_for_contract(&contract.h_contract).await?;
    if deposits.is_empty() {
        return Err(TrackError::NoDeposits);
    }

    let known = db.transfers_for_contract(&contract.h_contract).await?;
    let known_coins: HashSet<&str> = known.iter().map(|t| t.coin_pub.as_str()).collect();

    let mut pending = false;
    let merchant_pub = instance.public_key();

    for deposit in &deposits {
        if known_coins.contains(deposit.coin_pub.as_str()) {
            continue;
        }
        let client = exchanges
            .get(&deposit.exchange_url)
            .ok_or_else(|| TrackError::UnknownExchange(deposit.exchange_url.clone()))?;

        let request = TrackTransactionRequest {
            h_contract: contract.h_contract.clone(),
            h_wire: contract.h_wire.clone(),
            coin_pub: deposit.coin_pub.clone(),
            merchant_pub: merchant_pub.clone(),
        };
        match client.track_transaction(&request).await? {
            TrackResult::Pending => {
                pending = true;
            }
            TrackResult::Settled(resolution) => {
                db.upsert_coin_transfer(&DbTransfer {
                    exchange_url: deposit.exchange_url.clone(),
                    wtid: resolution.wtid.clone(),
                    h_contract: contract.h_contract.clone(),
                    coin_pub: deposit.coin_pub.clone(),
                })
                .await?;
            }
        }
    }

    let all = db.transfers_for_contract(&contract.h_contract).await?;
    let mut transfers: Vec<WtidRef> = Vec::new();
    for t in all {
        let r = WtidRef {
            exchange_url: t.exchange_url,
            wtid: t.wtid,
        };
        if !transfers.contains(&r) {
            transfers.push(r);
        }
    }

    Ok(TrackOrderResult { transfers, pending })
}

/// Local view of one deposit, for aggregate verification.
pub struct LocalDeposit {
    pub amount_with_fee: Amount,
    pub deposit_fee: Amount,
}

/// Verify an aggregate transfer report against local state:
/// the sum rule, the merchant account, and every referenced deposit.
pub fn verify_transfer_details(
    details: &TransferDetails,
    local: &HashMap<(String, String), LocalDeposit>,
    own_account_hashes: &HashSet<String>,
) -> Result<(), TrackError> {
    if !own_account_hashes.contains(&details.h_wire) {
        return Err(TrackError::MerchantAccountMismatch(details.h_wire.clone()));
    }

    let currency = details.total.currency();
    let mut net = Amount::zero(currency)?;
    for line in &details.deposits {
        let key = (line.h_contract.clone(), line.coin_pub.clone());
        let ours = local.get(&key).ok_or_else(|| {
            TrackError::ExchangeReportedUnknownDeposit(format!(
                "contract {} coin {}",
                line.h_contract, line.coin_pub
            ))
        })?;
        if ours.amount_with_fee != line.deposit_value || ours.deposit_fee != line.deposit_fee {
            return Err(TrackError::AmountMismatch(format!(
                "coin {}: exchange reports {} - {}, local records {} - {}",
                line.coin_pub,
                line.deposit_value,
                line.deposit_fee,
                ours.amount_with_fee,
                ours.deposit_fee
            )));
        }
        net = net.checked_add(&line.deposit_value.checked_sub(&line.deposit_fee)?)?;
    }

    let expected_total = net.checked_sub(&details.wire_fee)?;
    if expected_total != details.total {
        return Err(TrackError::AmountMismatch(format!(
            "sum over deposits gives {}, report claims {}",
            expected_total, details.total
        )));
    }

    Ok(())
}

/// Fetch (or serve from cache) the verified aggregate report for a wire
/// transfer id.
pub async fn track_transfer(
    db: &Database,
    exchanges: &ExchangeRegistry,
    instance: &InstanceHandle,
    exchange_url: &str,
    wtid: &str,
) -> Result<TransferDetails, TrackError> {
    let client = exchanges
        .get(exchange_url)
        .ok_or_else(|| TrackError::UnknownExchange(exchange_url.to_string()))?;

    if let Some(cached) = db.get_transfer_proof(client.base_url(), wtid).await? {
        let details: TransferDetails = serde_json::from_value(cached.proof)
            .map_err(|e| DbError::Corrupt(format!("cached transfer proof: {}", e)))?;
        return Ok(details);
    }

    let details = client.track_transfer(wtid).await?;

    // Load the local deposit records the report references.
    let mut local: HashMap<(String, String), LocalDeposit> = HashMap::new();
    let referenced_contracts: HashSet<&str> = details
        .deposits
        .iter()
        .map(|d| d.h_contract.as_str())
        .collect();
    for h_contract in referenced_contracts {
        for d in db.deposits_for_contract(h_contract).await? {
            local.insert(
                (d.h_contract.clone(), d.coin_pub.clone()),
                LocalDeposit {
                    amount_with_fee: d.amount_with_fee.parse()?,
                    deposit_fee: d.deposit_fee.parse()?,
                },
            );
        }
    }

    let own_hashes: HashSet<String> =
        instance.accounts.iter().map(|a| a.h_wire.clone()).collect();

    verify_transfer_details(&details, &local, &own_hashes)?;

    // Persist the proof and the coin→wtid mappings it taught us.
    let proof = serde_json::to_value(&details)
        .map_err(|e| DbError::Corrupt(format!("transfer proof serialization: {}", e)))?;
    db.insert_transfer_proof(client.base_url(), wtid, &proof).await?;
    for line in &details.deposits {
        db.upsert_coin_transfer(&DbTransfer {
            exchange_url: client.base_url().to_string(),
            wtid: wtid.to_string(),
            h_contract: line.h_contract.clone(),
            coin_pub: line.coin_pub.clone(),
        })
        .await?;
    }

    tracing::info!(exchange = exchange_url, wtid, "transfer proof verified and cached");
    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::TransferDeposit;
    use crate::timestamp::Timestamp;

    fn eur(s: &str) -> Amount {
        s.parse().unwrap()
    }

    fn line(h_contract: &str, coin: &str, value: &str, fee: &str) -> TransferDeposit {
        TransferDeposit {
            h_contract: h_contract.to_string(),
            coin_pub: coin.to_string(),
            deposit_value: eur(value),
            deposit_fee: eur(fee),
        }
    }

    fn local_map(entries: &[(&str, &str, &str, &str)]) -> HashMap<(String, String), LocalDeposit> {
        entries
            .iter()
            .map(|(hc, cp, value, fee)| {
                (
                    (hc.to_string(), cp.to_string()),
                    LocalDeposit {
                        amount_with_fee: eur(value),
                        deposit_fee: eur(fee),
                    },
                )
            })
            .collect()
    }

    fn own_accounts() -> HashSet<String> {
        ["hw1".to_string()].into_iter().collect()
    }

    fn details(total: &str, wire_fee: &str, deposits: Vec<TransferDeposit>) -> TransferDetails {
        TransferDetails {
            total: eur(total),
            wire_fee: eur(wire_fee),
            h_wire: "hw1".to_string(),
            execution_time: Timestamp::from_millis(0),
            exchange_pub: "ep".to_string(),
            exchange_sig: "es".to_string(),
            deposits,
        }
    }

    #[test]
    fn test_consistent_report_passes() {
        // 5.01 - 0.01 deposit fee - 0.02 wire fee = 4.98
        let d = details(
            "EUR:4.98",
            "EUR:0.02",
            vec![line("hc1", "c1", "EUR:5.01", "EUR:0.01")],
        );
        let local = local_map(&[("hc1", "c1", "EUR:5.01", "EUR:0.01")]);
        verify_transfer_details(&d, &local, &own_accounts()).expect("consistent report");
    }

    #[test]
    fn test_sum_rule_violation_detected() {
        let d = details(
            "EUR:5.00",
            "EUR:0.02",
            vec![line("hc1", "c1", "EUR:5.01", "EUR:0.01")],
        );
        let local = local_map(&[("hc1", "c1", "EUR:5.01", "EUR:0.01")]);
        assert!(matches!(
            verify_transfer_details(&d, &local, &own_accounts()),
            Err(TrackError::AmountMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_deposit_detected() {
        let d = details(
            "EUR:4.98",
            "EUR:0.02",
            vec![line("hc1", "c-unknown", "EUR:5.01", "EUR:0.01")],
        );
        let local = local_map(&[("hc1", "c1", "EUR:5.01", "EUR:0.01")]);
        assert!(matches!(
            verify_transfer_details(&d, &local, &own_accounts()),
            Err(TrackError::ExchangeReportedUnknownDeposit(_))
        ));
    }

    #[test]
    fn test_amount_divergence_detected() {
        let d = details(
            "EUR:4.98",
            "EUR:0.02",
            vec![line("hc1", "c1", "EUR:5.01", "EUR:0.01")],
        );
        // Locally we recorded a different contribution for this coin.
        let local = local_map(&[("hc1", "c1", "EUR:4.01", "EUR:0.01")]);
        assert!(matches!(
            verify_transfer_details(&d, &local, &own_accounts()),
            Err(TrackError::AmountMismatch(_))
        ));
    }

    #[test]
    fn test_foreign_account_detected() {
        let mut d = details(
            "EUR:4.98",
            "EUR:0.02",
            vec![line("hc1", "c1", "EUR:5.01", "EUR:0.01")],
        );
        d.h_wire = "someone-elses-account".to_string();
        let local = local_map(&[("hc1", "c1", "EUR:5.01", "EUR:0.01")]);
        assert!(matches!(
            verify_transfer_details(&d, &local, &own_accounts()),
            Err(TrackError::MerchantAccountMismatch(_))
        ));
    }

    #[test]
    fn test_multi_coin_aggregate() {
        // (2.00-0.01) + (3.01-0.01) - 0.01 = 4.98
        let d = details(
            "EUR:4.98",
            "EUR:0.01",
            vec![
                line("hc1", "c1", "EUR:2.00", "EUR:0.01"),
                line("hc2", "c2", "EUR:3.01", "EUR:0.01"),
            ],
        );
        let local = local_map(&[
            ("hc1", "c1", "EUR:2.00", "EUR:0.01"),
            ("hc2", "c2", "EUR:3.01", "EUR:0.01"),
        ]);
        verify_transfer_details(&d, &local, &own_accounts()).expect("multi-coin aggregate");
    }
}
