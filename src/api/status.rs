use axum::{Json, extract::State};
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::AppState;
use crate::device::link::LinkStatus;
use crate::services::feed::FeedStatus;
use crate::sync::SyncSnapshot;

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    /// One-line summary, e.g. `DRIVING | Giesing → Fasangarten | API: DRIVING | Speed: 0.50`
    pub summary: String,
    pub sync: SyncSnapshot,
    pub feed: FeedStatus,
    pub devices: Vec<LinkStatus>,
}

#[utoipa::path(
    get,
    path = "/api/status",
    responses(
        (status = 200, description = "Current sync state, feed session and device links", body = StatusResponse)
    ),
    tag = "status"
)]
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let sync = state.sync.read().await.clone();
    let feed = state.feed.read().await.clone();

    let mut devices = Vec::with_capacity(state.devices.len());
    for device in &state.devices {
        devices.push(device.status().await);
    }

    Json(StatusResponse {
        summary: sync.summary(),
        sync,
        feed,
        devices,
    })
}
