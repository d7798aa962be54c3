//! Tracking handlers - order→transfers and transfer→breakdown

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use crate::exchange::types::TransferDetails;
use crate::track::{track_order, track_transfer, TrackOrderResult};

#[derive(Debug, Deserialize)]
pub struct TrackParams {
    pub instance: Option<String>,
    /// Track-by-wtid: both of these must be present.
    pub wtid: Option<String>,
    pub exchange: Option<String>,
    /// Track-by-order.
    pub order_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TrackResponse {
    /// Wire transfers settling an order (possibly still incomplete).
    ByOrder(TrackOrderResult),
    /// Verified aggregate breakdown of one wire transfer.
    ByTransfer(TransferDetails),
}

/// GET /transfers?wtid=&exchange=   or   GET /transfers?order_id=
pub async fn track_handler(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> ApiResult<Json<TrackResponse>> {
    let instance = state.instance(params.instance.as_deref()).await?;

    match (&params.wtid, &params.exchange, &params.order_id) {
        (Some(wtid), Some(exchange), _) => {
            let details = track_transfer(
                &state.db,
                &state.exchanges,
                &instance,
                exchange,
                wtid,
            )
            .await?;
            Ok(Json(TrackResponse::ByTransfer(details)))
        }
        (None, None, Some(order_id)) => {
            let result =
                track_order(&state.db, &state.exchanges, &instance, order_id).await?;
            Ok(Json(TrackResponse::ByOrder(result)))
        }
        _ => Err(ApiError::BadRequest(
            "pass either wtid+exchange or order_id".to_string(),
        )),
    }
}
