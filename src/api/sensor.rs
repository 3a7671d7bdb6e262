use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::api::{AppState, ErrorResponse, engine_unavailable};
use crate::models::SyncEvent;
use crate::sync::SyncError;

#[derive(Debug, Serialize, ToSchema)]
pub struct SensorResponse {
    pub queued: bool,
}

/// Simulate the model's arrival sensor.
///
/// The event goes through the same queue as the real sensor, so it is
/// ignored in states where an arrival makes no sense.
#[utoipa::path(
    post,
    path = "/api/sensor",
    responses(
        (status = 202, description = "Arrival event queued", body = SensorResponse),
        (status = 503, description = "Sync engine is not running", body = ErrorResponse)
    ),
    tag = "control"
)]
pub async fn trigger_sensor(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SensorResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!("Manual arrival sensor trigger");

    state
        .events
        .send(SyncEvent::ArrivalSensor)
        .await
        .map_err(|_| engine_unavailable(SyncError::QueueClosed))?;

    Ok((StatusCode::ACCEPTED, Json(SensorResponse { queued: true })))
}
