use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::{handlers, state::AppState};

/// Create the API router
///
/// Endpoints:
/// - GET  /health                   - Health check
/// - POST /orders                   - Create order
/// - POST /orders/:id/claim         - Claim order for a wallet nonce
/// - POST /orders/:id/pay           - Pay with coins (or abort)
/// - GET  /orders/:id               - Long-polled payment/refund status
/// - POST /orders/:id/refund        - Raise authorized refund total
/// - GET  /orders/:id/refund        - Wallet refund pickup
/// - GET  /transfers                - Track by order or by wire transfer
/// - POST /tips/authorize           - Authorize a tip
/// - POST /tips/:tip_id/pickup      - Withdraw tip coins
/// - GET  /tips                     - Tip totals
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        // Orders
        .route("/orders", post(handlers::create_order_handler))
        .route("/orders/:order_id", get(handlers::order_status_handler))
        .route("/orders/:order_id/claim", post(handlers::claim_order_handler))
        .route("/orders/:order_id/pay", post(handlers::pay_handler))
        // Refunds
        .route(
            "/orders/:order_id/refund",
            post(handlers::refund_increase_handler).get(handlers::refund_pickup_handler),
        )
        // Tracking
        .route("/transfers", get(handlers::track_handler))
        // Tips
        .route("/tips", get(handlers::tip_query_handler))
        .route("/tips/authorize", post(handlers::tip_authorize_handler))
        .route("/tips/:tip_id/pickup", post(handlers::tip_pickup_handler))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(cors)
        .with_state(state)
}
