//! API Handlers
//!
//! - orders.rs: order creation, claiming, long-polled status
//! - pay.rs: coin payment submission and abort
//! - refunds.rs: refund increase and wallet pickup
//! - transfers.rs: wire-transfer tracking
//! - tips.rs: tip authorization, query and pickup

pub mod orders;
pub mod pay;
pub mod refunds;
pub mod tips;
pub mod transfers;

use axum::{extract::State, Json};
use chrono::Utc;

use crate::api::{error::ApiResult, state::AppState, types::HealthResponse};

// Re-export handlers
pub use orders::{claim_order_handler, create_order_handler, order_status_handler};
pub use pay::pay_handler;
pub use refunds::{refund_increase_handler, refund_pickup_handler};
pub use tips::{tip_authorize_handler, tip_pickup_handler, tip_query_handler};
pub use transfers::track_handler;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let db_status = match state.db.health_check().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        database: db_status.to_string(),
        exchanges: state.exchanges.len(),
        timestamp: Utc::now().to_rfc3339(),
    }))
}
