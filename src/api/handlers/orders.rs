//! Order handlers - creation, claiming, long-polled status
//!
//! Frontends create orders; wallets claim them and poll payment/refund
//! state. The GET endpoint suspends in the long-poll registry when a
//! timeout is given and the awaited state has not been reached yet.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::amount::Amount;
use crate::api::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use crate::longpoll::WakeEvent;
use crate::order::{claim_order, create_order, OrderTemplate};

/// Longest long-poll we are willing to hold a request open for.
const MAX_LONGPOLL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub order: OrderTemplate,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
}

/// POST /orders
/// Create an unclaimed order from a template.
pub async fn create_order_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<Json<CreateOrderResponse>> {
    let instance = state.instance(req.instance.as_deref()).await?;
    let order_id = create_order(&state.db, &instance, &state.config, req.order).await?;
    Ok(Json(CreateOrderResponse { order_id }))
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub nonce: String,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub contract_terms: Value,
    pub sig: String,
    pub h_contract: String,
}

/// POST /orders/:order_id/claim
/// Claim an order for a wallet nonce. Idempotent per nonce.
pub async fn claim_order_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<ClaimResponse>> {
    if req.nonce.is_empty() {
        return Err(ApiError::BadRequest("nonce must not be empty".to_string()));
    }
    let instance = state.instance(req.instance.as_deref()).await?;
    let claimed = claim_order(&state.db, &instance, &order_id, &req.nonce).await?;
    Ok(Json(ClaimResponse {
        contract_terms: claimed.contract_terms,
        sig: claimed.sig,
        h_contract: claimed.h_contract,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OrderStatusParams {
    pub instance: Option<String>,
    /// Suspend up to this long waiting for payment (or refund).
    pub timeout_ms: Option<u64>,
    /// Wait until the authorized refund total reaches this amount.
    pub min_refund: Option<Amount>,
}

#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub claimed: bool,
    pub paid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h_contract: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_total: Option<Amount>,
}

/// GET /orders/:order_id
/// Payment/refund status, long-polled when `timeout_ms` is given.
pub async fn order_status_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Query(params): Query<OrderStatusParams>,
) -> ApiResult<Json<OrderStatusResponse>> {
    let instance = state.instance(params.instance.as_deref()).await?;

    let status = load_status(&state, instance.id(), &order_id).await?;

    let satisfied = match (&params.min_refund, &status) {
        // Plain status poll: done once paid.
        (None, s) => s.paid,
        // Refund poll: done once the refund total reached the minimum.
        (Some(min), s) => match &s.refund_total {
            None => false,
            Some(total) => !matches!(
                total.cmp_checked(min),
                Ok(std::cmp::Ordering::Less) | Err(_)
            ),
        },
    };

    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(0)).min(MAX_LONGPOLL);
    if satisfied || timeout.is_zero() {
        return Ok(Json(status));
    }

    // Suspend until a state change or the deadline.
    let event = state
        .longpoll
        .wait(instance.id(), &order_id, timeout, params.min_refund.clone())
        .await;

    match event {
        WakeEvent::Paid | WakeEvent::RefundIncreased(_) | WakeEvent::Timeout => {
            // Always answer from persistent state, not the wake payload.
            let status = load_status(&state, instance.id(), &order_id).await?;
            Ok(Json(status))
        }
    }
}

async fn load_status(
    state: &AppState,
    instance_id: &str,
    order_id: &str,
) -> ApiResult<OrderStatusResponse> {
    if let Some(contract) = state.db.get_contract(instance_id, order_id).await? {
        let refunds = state.db.refunds_for_contract(&contract.h_contract).await?;
        let refund_total = if refunds.is_empty() {
            None
        } else {
            let amount: Amount = contract
                .amount
                .parse()
                .map_err(|e| ApiError::Internal(format!("stored contract amount: {}", e)))?;
            let mut total = Amount::zero(amount.currency())
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            for r in &refunds {
                let delta: Amount = r
                    .refund_amount
                    .parse()
                    .map_err(|e| ApiError::Internal(format!("stored refund amount: {}", e)))?;
                total = total
                    .checked_add(&delta)
                    .map_err(|e| ApiError::Internal(e.to_string()))?;
            }
            Some(total)
        };
        return Ok(OrderStatusResponse {
            claimed: true,
            paid: contract.paid,
            h_contract: Some(contract.h_contract),
            refund_total,
        });
    }

    if state.db.get_order(instance_id, order_id).await?.is_some() {
        return Ok(OrderStatusResponse {
            claimed: false,
            paid: false,
            h_contract: None,
            refund_total: None,
        });
    }

    Err(ApiError::NotFound(format!("order {}", order_id)))
}
