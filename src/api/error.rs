use axum::{http::StatusCode, Json};
use serde::Serialize;
use tracing::warn;
use utoipa::ToSchema;

use crate::sync::SyncError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// The engine stopped consuming events
pub fn engine_unavailable(err: SyncError) -> (StatusCode, Json<ErrorResponse>) {
    warn!(error = %err, "Rejecting request, sync engine unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
