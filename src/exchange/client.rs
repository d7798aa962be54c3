//! JSON/HTTP client for one exchange
//!
//! Handles the merchant-side half of the exchange protocol:
//! - fetch and validate the signed denomination key set (cached)
//! - submit coin deposits and classify failures
//! - resolve deposits to wire transfers and fetch aggregate reports
//! - query reserve status, redeem refunds, withdraw tip coins
//!
//! Exchange responses carrying signatures are verified here before the
//! caller sees them; a bad signature is a protocol violation, never a
//! retryable transport problem.

use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

use super::keys::{
    denomination_usable_for_deposit, find_denomination, is_valid_signkey, verify_master_sig,
    KeySetCache, KEYS_CACHE_TTL,
};
use super::types::*;
use crate::amount::Amount;
use crate::config::ExchangeConfig;
use crate::crypto::keys::{purpose, verify_purpose};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Exchange unreachable: {0}")]
    Transport(String),

    #[error("Exchange returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Exchange protocol violation: {0}")]
    Protocol(String),
}

impl ExchangeError {
    /// Transport problems and exchange-side 5xx are worth one retry;
    /// protocol violations are evidence and must not be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Status { status, .. } => *status >= 500,
            ExchangeError::Protocol(_) => false,
        }
    }
}

/// Classified outcome of a failed deposit.
#[derive(Debug)]
pub enum DepositFailure {
    /// Exchange reported the coin as already spent and the history
    /// checks out. Carries the signed history as evidence.
    DoubleSpend { history: serde_json::Value },
    /// The denomination is unknown, expired or revoked.
    DenominationInvalid(String),
    /// The exchange sent inconsistent or unverifiable data.
    Protocol(String),
    /// Transport failure or exchange-side 5xx; retryable.
    Unavailable(String),
}

impl DepositFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DepositFailure::Unavailable(_))
    }
}

/// Result of a track-transaction query.
#[derive(Debug)]
pub enum TrackResult {
    /// The deposit was aggregated into this wire transfer.
    Settled(TrackTransactionResponse),
    /// The exchange has not aggregated the deposit yet.
    Pending,
}

pub struct ExchangeClient {
    base_url: String,
    master_pub: String,
    currency: String,
    http: reqwest::Client,
    keys_cache: KeySetCache,
}

impl ExchangeClient {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            master_pub: config.master_pub.clone(),
            currency: config.currency.clone(),
            http: reqwest::Client::new(),
            keys_cache: KeySetCache::new(KEYS_CACHE_TTL),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ============ /keys ============

    /// Fetch the signed key set, serving from cache while fresh. The
    /// master signature is verified on every fetch.
    pub async fn keys(&self) -> Result<Arc<ExchangeKeys>, ExchangeError> {
        if let Some(keys) = self.keys_cache.get_if_fresh().await {
            return Ok(keys);
        }

        tracing::debug!(exchange = %self.base_url, "fetching exchange key set");
        let resp = self
            .http
            .get(self.url("/keys"))
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let keys: ExchangeKeys = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("malformed /keys response: {}", e)))?;

        verify_master_sig(&self.master_pub, &keys)
            .map_err(|e| ExchangeError::Protocol(format!("key set master signature: {}", e)))?;

        let keys = Arc::new(keys);
        self.keys_cache.store(keys.clone()).await;
        Ok(keys)
    }

    /// Look up a denomination and check it may back a new deposit.
    pub async fn deposit_denomination(
        &self,
        denom_pub: &str,
    ) -> Result<Option<DenominationKey>, ExchangeError> {
        let keys = self.keys().await?;
        Ok(find_denomination(&keys, denom_pub)
            .filter(|d| denomination_usable_for_deposit(d))
            .cloned())
    }

    // ============ Deposit ============

    /// Submit one coin deposit. On success the returned confirmation has
    /// a verified signature from a currently valid exchange signing key.
    pub async fn deposit(
        &self,
        req: &DepositRequest,
    ) -> Result<DepositConfirmation, DepositFailure> {
        let resp = self
            .http
            .post(self.url("/deposit"))
            .json(req)
            .send()
            .await
            .map_err(|e| DepositFailure::Unavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let conf: DepositConfirmation = resp
                    .json()
                    .await
                    .map_err(|e| DepositFailure::Protocol(format!("malformed confirmation: {}", e)))?;
                self.verify_deposit_confirmation(req, &conf).await?;
                Ok(conf)
            }
            StatusCode::CONFLICT => {
                let conflict: DepositConflict = resp.json().await.map_err(|e| {
                    DepositFailure::Protocol(format!("malformed conflict body: {}", e))
                })?;
                self.classify_conflict(req, conflict).await
            }
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                let body = resp.text().await.unwrap_or_default();
                Err(DepositFailure::DenominationInvalid(body))
            }
            status if status.is_server_error() => {
                let body = resp.text().await.unwrap_or_default();
                Err(DepositFailure::Unavailable(format!("{}: {}", status, body)))
            }
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(DepositFailure::Protocol(format!(
                    "unexpected deposit status {}: {}",
                    status, body
                )))
            }
        }
    }

    /// The confirmation signature covers (contract, coin, amount), so a
    /// confirmation can never be replayed for a different deposit.
    async fn verify_deposit_confirmation(
        &self,
        req: &DepositRequest,
        conf: &DepositConfirmation,
    ) -> Result<(), DepositFailure> {
        let keys = self
            .keys()
            .await
            .map_err(|e| DepositFailure::Unavailable(e.to_string()))?;
        if !is_valid_signkey(&keys, &conf.exchange_pub) {
            return Err(DepositFailure::Protocol(format!(
                "confirmation signed by unknown exchange key {}",
                conf.exchange_pub
            )));
        }
        let payload = deposit_confirmation_payload(
            &req.h_contract,
            &req.coin_pub,
            &req.amount_with_fee,
        );
        verify_purpose(
            &conf.exchange_pub,
            purpose::EXCHANGE_DEPOSIT_CONFIRM,
            payload.as_bytes(),
            &conf.exchange_sig,
        )
        .map_err(|_| DepositFailure::Protocol("bad deposit confirmation signature".to_string()))
    }

    /// A 409 is only a genuine double-spend if the coin history is
    /// internally valid and its residual value cannot cover this coin's
    /// contribution. Anything else is the exchange misbehaving.
    async fn classify_conflict(
        &self,
        req: &DepositRequest,
        conflict: DepositConflict,
    ) -> Result<DepositConfirmation, DepositFailure> {
        let denom = self
            .deposit_denomination(&req.denom_pub)
            .await
            .map_err(|e| DepositFailure::Unavailable(e.to_string()))?
            .ok_or_else(|| {
                DepositFailure::DenominationInvalid(format!(
                    "denomination {} vanished from key set",
                    req.denom_pub
                ))
            })?;

        let mut spent = match Amount::zero(denom.value.currency()) {
            Ok(a) => a,
            Err(e) => return Err(DepositFailure::Protocol(e.to_string())),
        };
        for entry in &conflict.history {
            let payload = format!("{}|{}", entry.entry_type, entry.amount);
            if verify_purpose(
                &req.coin_pub,
                purpose::COIN_DEPOSIT,
                payload.as_bytes(),
                &entry.coin_sig,
            )
            .is_err()
            {
                return Err(DepositFailure::Protocol(
                    "coin history entry carries an invalid coin signature".to_string(),
                ));
            }
            spent = spent
                .checked_add(&entry.amount)
                .map_err(|e| DepositFailure::Protocol(format!("coin history amounts: {}", e)))?;
        }

        // Residual = denomination value - already spent. If it would
        // still cover this coin's amount, the 409 is unjustified.
        match denom.value.checked_sub(&spent) {
            Err(_) => {
                // Spent more than the denomination is worth: the history
                // itself is inconsistent.
                Err(DepositFailure::Protocol(
                    "coin history exceeds denomination value".to_string(),
                ))
            }
            Ok(residual) => {
                let covers = residual
                    .cmp_checked(&req.amount_with_fee)
                    .map(|o| o != std::cmp::Ordering::Less)
                    .map_err(|e| DepositFailure::Protocol(e.to_string()))?;
                if covers {
                    Err(DepositFailure::Protocol(
                        "exchange reported double-spend but residual covers the deposit"
                            .to_string(),
                    ))
                } else {
                    let history = serde_json::to_value(&conflict.history)
                        .unwrap_or(serde_json::Value::Null);
                    Err(DepositFailure::DoubleSpend { history })
                }
            }
        }
    }

    // ============ Tracking ============

    /// Resolve a deposit to its wire transfer id. `Pending` mirrors the
    /// exchange's 202 "not yet aggregated" answer.
    pub async fn track_transaction(
        &self,
        req: &TrackTransactionRequest,
    ) -> Result<TrackResult, ExchangeError> {
        let resp = self
            .http
            .post(self.url("/track/transaction"))
            .json(req)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let body: TrackTransactionResponse = resp.json().await.map_err(|e| {
                    ExchangeError::Protocol(format!("malformed track response: {}", e))
                })?;
                Ok(TrackResult::Settled(body))
            }
            StatusCode::ACCEPTED => Ok(TrackResult::Pending),
            _ => Err(status_error(resp).await),
        }
    }

    /// Fetch the aggregate report for a wire transfer. The exchange
    /// signature over (wtid, account, totals) is verified here; amount
    /// consistency against local deposits is the reconciler's job.
    pub async fn track_transfer(&self, wtid: &str) -> Result<TransferDetails, ExchangeError> {
        let resp = self
            .http
            .get(self.url(&format!("/track/transfer/{}", wtid)))
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let details: TransferDetails = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("malformed transfer report: {}", e)))?;

        let keys = self.keys().await?;
        if !is_valid_signkey(&keys, &details.exchange_pub) {
            return Err(ExchangeError::Protocol(format!(
                "transfer report signed by unknown exchange key {}",
                details.exchange_pub
            )));
        }
        let payload =
            transfer_details_payload(wtid, &details.h_wire, &details.total, &details.wire_fee);
        verify_purpose(
            &details.exchange_pub,
            purpose::EXCHANGE_TRANSFER_DETAILS,
            payload.as_bytes(),
            &details.exchange_sig,
        )
        .map_err(|_| ExchangeError::Protocol("bad transfer report signature".to_string()))?;

        Ok(details)
    }

    // ============ Reserves & tips ============

    pub async fn reserve_status(&self, reserve_pub: &str) -> Result<ReserveStatus, ExchangeError> {
        let resp = self
            .http
            .get(self.url(&format!("/reserves/{}", reserve_pub)))
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("malformed reserve status: {}", e)))
    }

    pub async fn withdraw(&self, req: &WithdrawRequest) -> Result<WithdrawResponse, ExchangeError> {
        let resp = self
            .http
            .post(self.url(&format!("/reserves/{}/withdraw", req.reserve_pub)))
            .json(req)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("malformed withdraw response: {}", e)))
    }

    // ============ Refunds ============

    pub async fn refund(&self, req: &RefundRequest) -> Result<RefundResponse, ExchangeError> {
        let resp = self
            .http
            .post(self.url("/refund"))
            .json(req)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        resp.json()
            .await
            .map_err(|e| ExchangeError::Protocol(format!("malformed refund response: {}", e)))
    }
}

async fn status_error(resp: reqwest::Response) -> ExchangeError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    ExchangeError::Status { status, body }
}

/// Payload the exchange signs when confirming a deposit.
pub fn deposit_confirmation_payload(h_contract: &str, coin_pub: &str, amount: &Amount) -> String {
    format!("{}|{}|{}", h_contract, coin_pub, amount)
}

/// Payload the exchange signs over an aggregate transfer report.
pub fn transfer_details_payload(
    wtid: &str,
    h_wire: &str,
    total: &Amount,
    wire_fee: &Amount,
) -> String {
    format!("{}|{}|{}|{}", wtid, h_wire, total, wire_fee)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_retry_classes() {
        assert!(ExchangeError::Transport("timeout".to_string()).is_retryable());
        assert!(ExchangeError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ExchangeError::Status {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!ExchangeError::Protocol("bad sig".to_string()).is_retryable());
    }

    #[test]
    fn test_deposit_failure_retry_classes() {
        assert!(DepositFailure::Unavailable("refused".to_string()).is_retryable());
        assert!(!DepositFailure::DoubleSpend {
            history: serde_json::Value::Null
        }
        .is_retryable());
        assert!(!DepositFailure::DenominationInvalid(String::new()).is_retryable());
        assert!(!DepositFailure::Protocol(String::new()).is_retryable());
    }

    #[test]
    fn test_signed_payload_shapes() {
        let amount: Amount = "EUR:5".parse().unwrap();
        assert_eq!(
            deposit_confirmation_payload("hc", "cp", &amount),
            "hc|cp|EUR:5.00000000"
        );
        let fee: Amount = "EUR:0.01".parse().unwrap();
        assert_eq!(
            transfer_details_payload("wt1", "hw", &amount, &fee),
            "wt1|hw|EUR:5.00000000|EUR:0.01000000"
        );
    }
}
