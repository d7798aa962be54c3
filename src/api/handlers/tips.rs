//! Tip handlers - authorize, query, pickup

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::api::{error::ApiResult, state::AppState};
use crate::tip::{
    authorize_tip, pickup_tip, query_tips, Planchet, PlanchetSignature, TipAuthorization,
    TipStatus,
};

#[derive(Debug, Deserialize)]
pub struct TipAuthorizeRequest {
    pub amount: Amount,
    pub justification: String,
    pub instance: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// POST /tips/authorize
/// Authorize a tip against the instance's reserve.
pub async fn tip_authorize_handler(
    State(state): State<AppState>,
    Json(req): Json<TipAuthorizeRequest>,
) -> ApiResult<Json<TipAuthorization>> {
    let instance = state.instance(req.instance.as_deref()).await?;
    let authorization = authorize_tip(
        &state.db,
        &state.exchanges,
        &instance,
        &state.config,
        &req.amount,
        &req.justification,
        req.extra,
    )
    .await?;
    Ok(Json(authorization))
}

#[derive(Debug, Deserialize)]
pub struct TipQueryParams {
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TipQueryResponse {
    #[serde(flatten)]
    pub status: TipStatus,
}

/// GET /tips
/// Authorized / picked-up / available totals for the instance.
pub async fn tip_query_handler(
    State(state): State<AppState>,
    Query(params): Query<TipQueryParams>,
) -> ApiResult<Json<TipQueryResponse>> {
    let instance = state.instance(params.instance.as_deref()).await?;
    let status = query_tips(&state.db, &instance, &state.config).await?;
    Ok(Json(TipQueryResponse { status }))
}

#[derive(Debug, Deserialize)]
pub struct TipPickupRequest {
    pub planchets: Vec<Planchet>,
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TipPickupResponse {
    pub blind_sigs: Vec<PlanchetSignature>,
}

/// POST /tips/:tip_id/pickup
/// Withdraw blind coins against an authorized tip.
pub async fn tip_pickup_handler(
    State(state): State<AppState>,
    Path(tip_id): Path<Uuid>,
    Json(req): Json<TipPickupRequest>,
) -> ApiResult<Json<TipPickupResponse>> {
    let instance = state.instance(req.instance.as_deref()).await?;
    let blind_sigs = pickup_tip(
        &state.db,
        &state.exchanges,
        &instance,
        &state.config,
        tip_id,
        &req.planchets,
    )
    .await?;
    Ok(Json(TipPickupResponse { blind_sigs }))
}
