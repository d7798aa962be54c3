//! Refund handlers - merchant-side increase and wallet-side pickup

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::api::{error::ApiResult, state::AppState};
use crate::refund::{increase_refund, lookup_refund_permissions, RefundPermission};

#[derive(Debug, Deserialize)]
pub struct RefundIncreaseRequest {
    pub refund: Amount,
    pub reason: String,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefundIncreaseResponse {
    pub taler_refund_uri: String,
    pub refund_total: Amount,
}

/// POST /orders/:order_id/refund
/// Raise the authorized refund total (monotone; shrinking is a no-op).
pub async fn refund_increase_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<RefundIncreaseRequest>,
) -> ApiResult<Json<RefundIncreaseResponse>> {
    let instance = state.instance(req.instance.as_deref()).await?;

    let result = increase_refund(
        &state.db,
        &state.longpoll,
        &instance,
        &order_id,
        &req.refund,
        &req.reason,
    )
    .await?;

    let host = state
        .config
        .merchant_base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');

    Ok(Json(RefundIncreaseResponse {
        taler_refund_uri: format!("taler://refund/{}/{}", host, order_id),
        refund_total: result.effective_total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefundPickupParams {
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefundPickupResponse {
    pub refund_permissions: Vec<RefundPermission>,
}

/// GET /orders/:order_id/refund
/// Wallet-facing pickup: signed per-coin refund permissions, empty when
/// nothing was authorized.
pub async fn refund_pickup_handler(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Query(params): Query<RefundPickupParams>,
) -> ApiResult<Json<RefundPickupResponse>> {
    let instance = state.instance(params.instance.as_deref()).await?;
    let refund_permissions =
        lookup_refund_permissions(&state.db, &instance, &order_id).await?;
    Ok(Json(RefundPickupResponse { refund_permissions }))
}
