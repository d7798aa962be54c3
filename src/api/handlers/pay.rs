//! Payment handler - coin submission and abort

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use crate::pay::{process_payment, CoinPayment, PayOutcome, PayReceipt};
use crate::refund::RefundPermission;

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub coins: Vec<CoinPayment>,
    /// "pay" (default) or "abort-refund".
    pub mode: Option<String>,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PayResponse {
    Paid {
        paid: bool,
        #[serde(flatten)]
        receipt: PayReceipt,
    },
    Aborted {
        paid: bool,
        refund_permissions: Vec<RefundPermission>,
    },
}

/// POST /orders/:order_id/pay
/// Pay a claimed order with a set of coins, or abort a partial payment.
pub async fn pay_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<PayRequest>,
) -> ApiResult<Json<PayResponse>> {
    let abort = match req.mode.as_deref() {
        None | Some("pay") => false,
        Some("abort-refund") => true,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unknown pay mode '{}'",
                other
            )))
        }
    };

    let instance = state.instance(req.instance.as_deref()).await?;

    let outcome = process_payment(
        &state.db,
        &state.exchanges,
        &state.longpoll,
        &instance,
        &order_id,
        req.coins,
        abort,
    )
    .await?;

    Ok(Json(match outcome {
        PayOutcome::Paid(receipt) => PayResponse::Paid {
            paid: true,
            receipt,
        },
        PayOutcome::Aborted(refund_permissions) => PayResponse::Aborted {
            paid: false,
            refund_permissions,
        },
    }))
}
