//! Wire types for the exchange JSON protocol
//!
//! Everything the merchant sends to or receives from an exchange.
//! Amounts are `"CUR:VALUE.FRACTION"` strings, timestamps are
//! `{"t_ms": ...}` objects, keys and signatures are hex.

use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::timestamp::Timestamp;

/// One denomination published by the exchange: a coin value with its own
/// signing key, fee schedule and validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenominationKey {
    pub denom_pub: String,
    pub value: Amount,
    pub fee_deposit: Amount,
    pub fee_refund: Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_deposit: Timestamp,
}

/// Online signing key the exchange uses for deposit confirmations and
/// transfer reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignKey {
    pub key: String,
    pub stamp_start: Timestamp,
    pub stamp_end: Timestamp,
}

/// Wire fee schedule entry for one wire method and date range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFeeSpec {
    pub wire_method: String,
    pub wire_fee: Amount,
    pub closing_fee: Amount,
    pub start_date: Timestamp,
    pub end_date: Timestamp,
}

fn default_reserve_closing_delay() -> i64 {
    // Four weeks, matching common exchange policy.
    28 * 24 * 3600
}

/// The `/keys` response: the exchange's signed denomination key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeKeys {
    pub denoms: Vec<DenominationKey>,
    pub signkeys: Vec<SignKey>,
    #[serde(default)]
    pub wire_fees: Vec<WireFeeSpec>,
    /// How long the exchange keeps an idle reserve before closing it.
    #[serde(default = "default_reserve_closing_delay")]
    pub reserve_closing_delay_secs: i64,
    pub list_issue_date: Timestamp,
    pub master_sig: String,
}

/// A coin deposit permission, as submitted to `POST /deposit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub h_contract: String,
    pub coin_pub: String,
    pub denom_pub: String,
    pub denom_sig: String,
    pub coin_sig: String,
    pub amount_with_fee: Amount,
    pub merchant_pub: String,
    pub h_wire: String,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub wire_transfer_deadline: Timestamp,
}

/// Successful deposit: the exchange's signed confirmation. This is the
/// proof persisted with the deposit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositConfirmation {
    pub exchange_pub: String,
    pub exchange_sig: String,
}

/// One entry of a coin's spend history, returned on double-spend
/// conflicts as evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinHistoryEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub amount: Amount,
    pub coin_sig: String,
}

/// 409 body of a failed deposit: the exchange's account of how the coin
/// was already spent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositConflict {
    pub code: u32,
    pub hint: String,
    #[serde(default)]
    pub history: Vec<CoinHistoryEntry>,
}

/// Request to resolve a deposit to its wire transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackTransactionRequest {
    pub h_contract: String,
    pub h_wire: String,
    pub coin_pub: String,
    pub merchant_pub: String,
}

/// Deposit→transfer resolution, once the exchange has aggregated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackTransactionResponse {
    pub wtid: String,
    pub execution_time: Timestamp,
    pub coin_contribution: Amount,
}

/// Per-coin line of an aggregate transfer report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDeposit {
    pub h_contract: String,
    pub coin_pub: String,
    pub deposit_value: Amount,
    pub deposit_fee: Amount,
}

/// Exchange-signed aggregate transfer report for one wire transfer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDetails {
    pub total: Amount,
    pub wire_fee: Amount,
    pub h_wire: String,
    pub execution_time: Timestamp,
    pub exchange_pub: String,
    pub exchange_sig: String,
    pub deposits: Vec<TransferDeposit>,
}

/// One entry of a reserve's transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveHistoryEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub amount: Amount,
    #[serde(default = "Timestamp::now")]
    pub timestamp: Timestamp,
}

/// `GET /reserves/{pub}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStatus {
    pub balance: Amount,
    pub history: Vec<ReserveHistoryEntry>,
}

/// Withdrawal of one blinded coin against a reserve (tip pickup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub reserve_pub: String,
    pub reserve_sig: String,
    pub denom_pub: String,
    pub coin_ev: String,
}

/// The exchange's blind signature over the coin envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub ev_sig: String,
}

/// Refund redemption request, authorized by a merchant signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub h_contract: String,
    pub coin_pub: String,
    pub rtransaction_id: i64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub merchant_pub: String,
    pub merchant_sig: String,
}

/// The exchange's confirmation of a processed refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundResponse {
    pub exchange_pub: String,
    pub exchange_sig: String,
}
