use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Database model for a merchant instance. The private key never leaves
/// this process and the `merchant_instances` table.
#[derive(Debug, Clone, FromRow)]
pub struct DbInstance {
    pub instance_id: String,                 // Stable string id ("default", ...)
    pub name: String,                        // Human-readable legal name
    pub pub_key: String,                     // ed25519 public key, hex
    pub priv_key: String,                    // ed25519 private key, hex
    pub address: Value,                      // Opaque structured postal address
    pub jurisdiction: Value,                 // Opaque structured jurisdiction
    pub default_max_wire_fee: String,        // Amount string
    pub default_max_deposit_fee: String,     // Amount string
    pub default_wire_fee_amortization: i32,
    pub default_wire_transfer_delay_secs: i64,
    pub default_pay_delay_secs: i64,
    pub tip_reserve_priv: Option<String>,    // Set iff the instance tips
    pub active: bool,                        // Soft-delete flag
}

/// Bank account descriptor owned by an instance. Inactive accounts stay
/// valid for contracts that already reference their hash.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DbAccount {
    pub instance_id: String,
    pub payto_uri: String,                   // payto:// target URI
    pub salt: String,                        // Hash salt, hex
    pub h_wire: String,                      // account_hash(payto_uri, salt), hex
    pub active: bool,
}

/// An unclaimed order: the default-filled contract proposal, waiting for
/// the first wallet to claim it.
#[derive(Debug, Clone, FromRow)]
pub struct DbOrder {
    pub instance_id: String,
    pub order_id: String,
    pub contract_terms: Value,               // Canonical order JSON (no nonce yet)
    pub creation_time: DateTime<Utc>,
    pub pay_deadline: Option<DateTime<Utc>>, // NULL = never expires
}

/// A claimed, signed contract. Immutable once written.
#[derive(Debug, Clone, FromRow)]
pub struct DbContract {
    pub instance_id: String,
    pub order_id: String,
    pub h_contract: String,                  // SHA-512 of canonical terms, hex
    pub nonce: String,                       // Wallet-supplied claim nonce
    pub contract_terms: Value,               // Terms including the nonce
    pub merchant_sig: String,                // Instance signature over h_contract
    pub amount: String,                      // Amount string
    pub max_fee: String,
    pub max_wire_fee: String,
    pub wire_fee_amortization: i32,
    pub h_wire: String,                      // Selected account hash
    pub pay_deadline: Option<DateTime<Utc>>,
    pub refund_deadline: Option<DateTime<Utc>>,
    pub wire_transfer_deadline: Option<DateTime<Utc>>,
    pub paid: bool,
    pub creation_time: DateTime<Utc>,
}

/// Per-coin record of a successful exchange deposit. `(coin_pub,
/// h_contract)` is unique; `deposit_serial` fixes the order refund
/// shares are computed in.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbDeposit {
    pub deposit_serial: i64,
    pub h_contract: String,
    pub coin_pub: String,
    pub exchange_url: String,
    pub amount_with_fee: String,
    pub deposit_fee: String,
    pub refund_fee: String,                  // From the coin's denomination
    pub wire_fee: String,                    // Exchange wire fee schedule at deposit time
    pub exchange_pub: String,                // Exchange signing key that confirmed
    pub exchange_sig: String,
    pub proof: Value,                        // Full signed confirmation JSON
    pub wire_transfer_deadline: Option<DateTime<Utc>>,
    pub refund_deadline: Option<DateTime<Utc>>,
}

/// Lazily learned association of a deposited coin with the wire transfer
/// that settled it.
#[derive(Debug, Clone, FromRow)]
pub struct DbTransfer {
    pub exchange_url: String,
    pub wtid: String,
    pub h_contract: String,
    pub coin_pub: String,
}

/// Cached exchange-signed aggregate transfer proof. Content-addressed by
/// (exchange_url, wtid) and immutable.
#[derive(Debug, Clone, FromRow)]
pub struct DbTransferProof {
    pub exchange_url: String,
    pub wtid: String,
    pub proof: Value,
    pub verified_at: DateTime<Utc>,
}

/// One refund authorization step. The cumulative sum over
/// rtransaction_id order is the authorized refund total.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DbRefund {
    pub h_contract: String,
    pub rtransaction_id: i64,                // Monotone per contract
    pub refund_amount: String,               // Delta, not cumulative
    pub reason: String,
    pub creation_time: DateTime<Utc>,
}

/// Tip reserve state for an instance. `committed_balance` mirrors what
/// the exchange reported at the last status probe.
#[derive(Debug, Clone, FromRow)]
pub struct DbTipReserve {
    pub instance_id: String,
    pub reserve_pub: String,
    pub authorized_total: String,            // Sum of all tip authorizations
    pub picked_up_total: String,             // Sum of completed pickups
    pub committed_balance: String,           // Deposits observed at the exchange
    pub expiration: Option<DateTime<Utc>>,
    pub last_probe: Option<DateTime<Utc>>,
}

/// A single authorized tip, redeemable until exhausted or expired.
#[derive(Debug, Clone, FromRow)]
pub struct DbTip {
    pub tip_id: Uuid,
    pub instance_id: String,
    pub reserve_pub: String,
    pub amount: String,                      // Authorized amount
    pub picked_up: String,                   // Withdrawn so far
    pub justification: String,
    pub extra: Value,                        // Opaque frontend metadata
    pub expiration: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
}

/// Wire fee schedule entry learned from an exchange's /keys response.
#[derive(Debug, Clone, FromRow)]
pub struct DbWireFee {
    pub exchange_url: String,
    pub wire_method: String,
    pub wire_fee: String,
    pub closing_fee: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}
