//! Order & contract manager
//!
//! Turns frontend order templates into persisted unclaimed orders
//! (default-filling from instance and config), and claims orders on
//! behalf of wallets: canonicalize, hash, sign, and atomically move the
//! order into the contract table.
//!
//! Order lifecycle: draft (template) → unclaimed → claimed (contract)
//! → paid → possibly refunded. Unclaimed orders whose pay deadline
//! passes are purged by the GC binary.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

use crate::amount::{Amount, AmountError};
use crate::config::Config;
use crate::crypto::hash::{contract_hash, hash_to_hex};
use crate::crypto::keys::purpose;
use crate::db::models::{DbContract, DbOrder};
use crate::db::orders::ClaimOutcome;
use crate::db::{Database, DbError};
use crate::instance::InstanceHandle;
use crate::timestamp::Timestamp;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order id already exists: {0}")]
    OrderIdExists(String),

    #[error("Instance has no active bank account")]
    NoActiveAccount,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Deadline lies in the past")]
    DeadlineInPast,

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Order already claimed with a different nonce: {0}")]
    AlreadyClaimed(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<AmountError> for OrderError {
    fn from(e: AmountError) -> Self {
        OrderError::InvalidAmount(e.to_string())
    }
}

/// Partially specified order as submitted by the frontend.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTemplate {
    pub order_id: Option<String>,
    pub amount: Amount,
    pub summary: String,
    pub fulfillment_url: Option<String>,
    pub pay_deadline: Option<Timestamp>,
    pub refund_deadline: Option<Timestamp>,
    pub wire_transfer_deadline: Option<Timestamp>,
    pub max_fee: Option<Amount>,
    pub max_wire_fee: Option<Amount>,
    pub wire_fee_amortization: Option<u32>,
}

/// The claimed contract as returned to wallets: stored terms and the
/// merchant signature over their hash.
#[derive(Debug, Clone)]
pub struct ClaimedContract {
    pub contract_terms: Value,
    pub sig: String,
    pub h_contract: String,
}

/// Last generated order id; forced strictly monotone so ids generated
/// within the same microsecond stay unique.
static LAST_GENERATED_ID: AtomicI64 = AtomicI64::new(0);

fn next_order_id(now: DateTime<Utc>) -> String {
    let mut candidate = now.timestamp_micros();
    loop {
        let last = LAST_GENERATED_ID.load(Ordering::Relaxed);
        if candidate <= last {
            candidate = last + 1;
        }
        if LAST_GENERATED_ID
            .compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return candidate.to_string();
        }
    }
}

/// Default-fill an order template into complete contract terms (without
/// a nonce). Pure: all clock reads go through `now`.
pub fn fill_order_defaults(
    template: &OrderTemplate,
    instance: &InstanceHandle,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<(String, Value), OrderError> {
    if template.amount.currency() != config.currency {
        return Err(OrderError::InvalidAmount(format!(
            "expected currency {}, got {}",
            config.currency,
            template.amount.currency()
        )));
    }
    if template.amount.is_zero() {
        return Err(OrderError::InvalidAmount("amount must be positive".to_string()));
    }

    let account = instance.active_account().ok_or(OrderError::NoActiveAccount)?;

    let order_id = match &template.order_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => next_order_id(now),
    };

    let pay_deadline = template
        .pay_deadline
        .unwrap_or_else(|| deadline_from_delay(now, instance.row.default_pay_delay_secs));
    let refund_deadline = template
        .refund_deadline
        .unwrap_or_else(|| deadline_from_delay(now, instance.row.default_pay_delay_secs));
    let wire_transfer_deadline = template.wire_transfer_deadline.unwrap_or_else(|| {
        deadline_from_delay(now, instance.row.default_wire_transfer_delay_secs)
    });

    for deadline in [&pay_deadline, &refund_deadline, &wire_transfer_deadline] {
        if deadline.is_expired(now) {
            return Err(OrderError::DeadlineInPast);
        }
    }

    let max_fee = match &template.max_fee {
        Some(fee) => fee.clone(),
        None => instance.row.default_max_deposit_fee.parse()?,
    };
    let max_wire_fee = match &template.max_wire_fee {
        Some(fee) => fee.clone(),
        None => instance.row.default_max_wire_fee.parse()?,
    };
    let wire_fee_amortization = template
        .wire_fee_amortization
        .unwrap_or(instance.row.default_wire_fee_amortization as u32)
        .max(1);

    let mut terms = serde_json::json!({
        "order_id": order_id,
        "summary": template.summary,
        "amount": template.amount,
        "max_fee": max_fee,
        "max_wire_fee": max_wire_fee,
        "wire_fee_amortization": wire_fee_amortization,
        "merchant_pub": instance.public_key(),
        "merchant_base_url": config.merchant_base_url,
        "h_wire": account.h_wire,
        "timestamp": Timestamp::from_datetime(now),
        "pay_deadline": pay_deadline,
        "refund_deadline": refund_deadline,
        "wire_transfer_deadline": wire_transfer_deadline,
    });
    if let Some(url) = &template.fulfillment_url {
        terms["fulfillment_url"] = Value::String(url.clone());
    }

    Ok((order_id, terms))
}

fn deadline_from_delay(now: DateTime<Utc>, delay_secs: i64) -> Timestamp {
    Timestamp::from_datetime(now + Duration::seconds(delay_secs.max(0)))
}

/// Create an unclaimed order from a template. Returns the order id.
pub async fn create_order(
    db: &Database,
    instance: &InstanceHandle,
    config: &Config,
    template: OrderTemplate,
) -> Result<String, OrderError> {
    let now = Utc::now();
    let (order_id, terms) = fill_order_defaults(&template, instance, config, now)?;

    let pay_deadline = terms
        .get("pay_deadline")
        .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok())
        .and_then(|ts| ts.to_datetime());

    let order = DbOrder {
        instance_id: instance.id().to_string(),
        order_id: order_id.clone(),
        contract_terms: terms,
        creation_time: now,
        pay_deadline,
    };

    match db.create_order(&order).await {
        Ok(()) => {
            tracing::info!(instance = %instance.id(), order_id = %order_id, "order created");
            Ok(order_id)
        }
        Err(DbError::OrderIdExists(id)) => Err(OrderError::OrderIdExists(id)),
        Err(e) => Err(e.into()),
    }
}

/// Build the claim candidate for an unclaimed order: fold in the nonce,
/// canonicalize, hash, sign. Pure.
pub fn build_claim_candidate(
    order: &DbOrder,
    nonce: &str,
    instance: &InstanceHandle,
    now: DateTime<Utc>,
) -> Result<DbContract, OrderError> {
    let mut terms = order.contract_terms.clone();
    terms["nonce"] = Value::String(nonce.to_string());

    let h_contract = hash_to_hex(&contract_hash(&terms));
    let merchant_sig = instance.keys.sign(purpose::CONTRACT, h_contract.as_bytes());

    let amount = term_amount(&terms, "amount")?;
    let max_fee = term_amount(&terms, "max_fee")?;
    let max_wire_fee = term_amount(&terms, "max_wire_fee")?;
    let wire_fee_amortization = terms
        .get("wire_fee_amortization")
        .and_then(Value::as_i64)
        .unwrap_or(1) as i32;
    let h_wire = terms
        .get("h_wire")
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::Corrupt("order terms missing h_wire".to_string()))?
        .to_string();

    Ok(DbContract {
        instance_id: order.instance_id.clone(),
        order_id: order.order_id.clone(),
        h_contract,
        nonce: nonce.to_string(),
        merchant_sig,
        amount: amount.to_string(),
        max_fee: max_fee.to_string(),
        max_wire_fee: max_wire_fee.to_string(),
        wire_fee_amortization,
        h_wire,
        pay_deadline: term_deadline(&terms, "pay_deadline"),
        refund_deadline: term_deadline(&terms, "refund_deadline"),
        wire_transfer_deadline: term_deadline(&terms, "wire_transfer_deadline"),
        paid: false,
        creation_time: now,
        contract_terms: terms,
    })
}

fn term_amount(terms: &Value, field: &str) -> Result<Amount, OrderError> {
    terms
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::Corrupt(format!("order terms missing {}", field)))?
        .parse()
        .map_err(|e: AmountError| DbError::Corrupt(format!("{}: {}", field, e)).into())
}

fn term_deadline(terms: &Value, field: &str) -> Option<DateTime<Utc>> {
    terms
        .get(field)
        .and_then(|v| serde_json::from_value::<Timestamp>(v.clone()).ok())
        .and_then(|ts| ts.to_datetime())
}

/// Claim an order for a wallet nonce. Idempotent: re-claiming with the
/// same nonce returns the stored terms and signature byte-identically.
pub async fn claim_order(
    db: &Database,
    instance: &InstanceHandle,
    order_id: &str,
    nonce: &str,
) -> Result<ClaimedContract, OrderError> {
    // Fast path: contract already exists.
    if let Some(contract) = db.get_contract(instance.id(), order_id).await? {
        return claimed_from_existing(contract, nonce);
    }

    let order = db
        .get_order(instance.id(), order_id)
        .await?
        .ok_or_else(|| OrderError::NotFound(order_id.to_string()))?;

    let candidate = build_claim_candidate(&order, nonce, instance, Utc::now())?;

    match db.claim_order(&candidate).await? {
        ClaimOutcome::Claimed(contract) => {
            tracing::info!(
                instance = %instance.id(),
                order_id,
                h_contract = %contract.h_contract,
                "order claimed"
            );
            Ok(ClaimedContract {
                contract_terms: contract.contract_terms,
                sig: contract.merchant_sig,
                h_contract: contract.h_contract,
            })
        }
        ClaimOutcome::Existing(contract) => claimed_from_existing(contract, nonce),
        ClaimOutcome::NoSuchOrder => Err(OrderError::NotFound(order_id.to_string())),
    }
}

fn claimed_from_existing(
    contract: DbContract,
    nonce: &str,
) -> Result<ClaimedContract, OrderError> {
    if contract.nonce != nonce {
        return Err(OrderError::AlreadyClaimed(contract.order_id));
    }
    Ok(ClaimedContract {
        contract_terms: contract.contract_terms,
        sig: contract.merchant_sig,
        h_contract: contract.h_contract,
    })
}

/// Re-derive and check the stored hash/signature of a contract. Used by
/// tests and diagnostics; the persisted values are authoritative.
pub fn verify_contract_consistency(contract: &DbContract, merchant_pub: &str) -> bool {
    let recomputed = hash_to_hex(&contract_hash(&contract.contract_terms));
    if recomputed != contract.h_contract {
        return false;
    }
    crate::crypto::keys::verify_purpose(
        merchant_pub,
        purpose::CONTRACT,
        contract.h_contract.as_bytes(),
        &contract.merchant_sig,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::crypto::hash::canonical_json;
    use crate::crypto::keys::KeyPair;
    use crate::db::models::{DbAccount, DbInstance};

    fn test_config() -> Config {
        Config {
            database_url: String::new(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8888,
            currency: "EUR".to_string(),
            default_wire_transfer_delay_secs: 7 * 24 * 3600,
            default_pay_delay_secs: 3600,
            default_max_wire_fee: "EUR:0.01".parse().unwrap(),
            default_wire_fee_amortization: 1,
            default_max_deposit_fee: "EUR:0.05".parse().unwrap(),
            merchant_base_url: "http://localhost:8888/".to_string(),
            merchant_payto_uri: "payto://x-taler-bank/localhost/merchant".to_string(),
            exchanges: vec![ExchangeConfig {
                base_url: "https://exchange.test".to_string(),
                master_pub: "00".repeat(32),
                currency: "EUR".to_string(),
            }],
            force_audit: false,
        }
    }

    fn test_instance() -> InstanceHandle {
        let keys = KeyPair::generate();
        InstanceHandle {
            row: DbInstance {
                instance_id: "default".to_string(),
                name: "Test".to_string(),
                pub_key: keys.public_hex(),
                priv_key: keys.private_hex(),
                address: serde_json::json!({}),
                jurisdiction: serde_json::json!({}),
                default_max_wire_fee: "EUR:0.01000000".to_string(),
                default_max_deposit_fee: "EUR:0.05000000".to_string(),
                default_wire_fee_amortization: 1,
                default_wire_transfer_delay_secs: 7 * 24 * 3600,
                default_pay_delay_secs: 3600,
                tip_reserve_priv: None,
                active: true,
            },
            keys,
            accounts: vec![DbAccount {
                instance_id: "default".to_string(),
                payto_uri: "payto://x-taler-bank/localhost/merchant".to_string(),
                salt: "ab".repeat(16),
                h_wire: "cd".repeat(64),
                active: true,
            }],
        }
    }

    fn template(amount: &str) -> OrderTemplate {
        OrderTemplate {
            order_id: Some("1".to_string()),
            amount: amount.parse().unwrap(),
            summary: "a book".to_string(),
            fulfillment_url: None,
            pay_deadline: None,
            refund_deadline: None,
            wire_transfer_deadline: None,
            max_fee: None,
            max_wire_fee: None,
            wire_fee_amortization: None,
        }
    }

    #[test]
    fn test_default_filling() {
        let config = test_config();
        let instance = test_instance();
        let now = Utc::now();

        let (order_id, terms) =
            fill_order_defaults(&template("EUR:5"), &instance, &config, now).unwrap();
        assert_eq!(order_id, "1");
        assert_eq!(terms["merchant_pub"], Value::String(instance.public_key()));
        assert_eq!(
            terms["h_wire"],
            Value::String(instance.accounts[0].h_wire.clone())
        );
        assert_eq!(terms["amount"], Value::String("EUR:5.00000000".to_string()));
        // Deadlines were filled from instance defaults.
        assert!(terms.get("pay_deadline").is_some());
        assert!(terms.get("wire_transfer_deadline").is_some());
    }

    #[test]
    fn test_wrong_currency_rejected() {
        let config = test_config();
        let instance = test_instance();
        assert!(matches!(
            fill_order_defaults(&template("USD:5"), &instance, &config, Utc::now()),
            Err(OrderError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let config = test_config();
        let instance = test_instance();
        assert!(matches!(
            fill_order_defaults(&template("EUR:0"), &instance, &config, Utc::now()),
            Err(OrderError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_past_deadline_rejected() {
        let config = test_config();
        let instance = test_instance();
        let mut t = template("EUR:5");
        t.pay_deadline = Some(Timestamp::from_millis(1000));
        assert!(matches!(
            fill_order_defaults(&t, &instance, &config, Utc::now()),
            Err(OrderError::DeadlineInPast)
        ));
    }

    #[test]
    fn test_no_active_account() {
        let config = test_config();
        let mut instance = test_instance();
        instance.accounts[0].active = false;
        assert!(matches!(
            fill_order_defaults(&template("EUR:5"), &instance, &config, Utc::now()),
            Err(OrderError::NoActiveAccount)
        ));
    }

    #[test]
    fn test_generated_ids_are_monotone() {
        let now = Utc::now();
        let a: i64 = next_order_id(now).parse().unwrap();
        let b: i64 = next_order_id(now).parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_claim_candidate_is_deterministic_and_verifiable() {
        let config = test_config();
        let instance = test_instance();
        let now = Utc::now();
        let (order_id, terms) =
            fill_order_defaults(&template("EUR:5"), &instance, &config, now).unwrap();

        let order = DbOrder {
            instance_id: "default".to_string(),
            order_id,
            contract_terms: terms,
            creation_time: now,
            pay_deadline: None,
        };

        let a = build_claim_candidate(&order, "nonce-1", &instance, now).unwrap();
        let b = build_claim_candidate(&order, "nonce-1", &instance, now).unwrap();
        // Same nonce: byte-identical terms, hash and signature.
        assert_eq!(a.h_contract, b.h_contract);
        assert_eq!(a.merchant_sig, b.merchant_sig);
        assert_eq!(
            canonical_json(&a.contract_terms),
            canonical_json(&b.contract_terms)
        );

        // Different nonce: different contract hash.
        let c = build_claim_candidate(&order, "nonce-2", &instance, now).unwrap();
        assert_ne!(a.h_contract, c.h_contract);

        assert!(verify_contract_consistency(&a, &instance.public_key()));
    }

    #[test]
    fn test_contract_consistency_detects_tampering() {
        let config = test_config();
        let instance = test_instance();
        let now = Utc::now();
        let (order_id, terms) =
            fill_order_defaults(&template("EUR:5"), &instance, &config, now).unwrap();
        let order = DbOrder {
            instance_id: "default".to_string(),
            order_id,
            contract_terms: terms,
            creation_time: now,
            pay_deadline: None,
        };

        let mut contract = build_claim_candidate(&order, "n", &instance, now).unwrap();
        contract.contract_terms["amount"] = Value::String("EUR:1.00000000".to_string());
        assert!(!verify_contract_consistency(&contract, &instance.public_key()));
    }
}
