use serde::Serialize;

/// `GET /health` response body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub exchanges: usize,
    pub timestamp: String,
}
