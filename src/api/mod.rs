pub mod error;
pub mod sensor;
pub mod status;

pub use error::{ErrorResponse, engine_unavailable};

use axum::Router;
use axum::http::{Method, header};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::device::link::LinkHandle;
use crate::models::SyncEvent;
use crate::services::feed::FeedStatusStore;
use crate::sync::SyncStatusStore;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "model-sync",
        description = "Status and control of the model train synchronization server"
    ),
    tags(
        (name = "status", description = "Sync, feed and device link status"),
        (name = "control", description = "Manual inputs to the sync engine")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncStatusStore,
    pub feed: FeedStatusStore,
    pub devices: Vec<LinkHandle>,
    pub events: mpsc::Sender<SyncEvent>,
}

pub fn router(state: AppState, cors_permissive: bool) -> Router {
    let (app, _api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(status::get_status))
        .routes(routes!(sensor::trigger_sensor))
        .with_state(state)
        .split_for_parts();

    let cors = if cors_permissive {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE])
    };

    app.layer(TraceLayer::new_for_http()).layer(cors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{LinkConfig, SpeedProfile};
    use crate::device::link::DeviceLink;
    use crate::device::protocol::PeerRole;
    use crate::outputs::{LinkDisplayOutput, LinkModelOutput};
    use crate::services::stations::{tests::station, StationCatalog};
    use crate::sync::{event_queue, SyncEngine, SyncStateMachine};
    use std::sync::Arc;
    use std::time::Duration;

    /// App state wired to a real engine that is not running yet
    pub(crate) fn test_state() -> (
        AppState,
        SyncEngine<LinkModelOutput, LinkDisplayOutput>,
    ) {
        let (events, rx) = event_queue();
        let (_model_link, model) = DeviceLink::new(PeerRole::Model, LinkConfig::default(), events.clone());
        let (_station_link, display) =
            DeviceLink::new(PeerRole::Station, LinkConfig::default(), events.clone());

        let catalog = Arc::new(
            StationCatalog::new(vec![
                station("Giesing", 11.5967, 48.1107, Some(10.0)),
                station("Fasangarten", 11.5960, 48.0994, None),
            ])
            .unwrap(),
        );
        let machine = SyncStateMachine::new(
            catalog,
            SpeedProfile::default(),
            LinkModelOutput::new(model.clone()),
            LinkDisplayOutput::new(display.clone()),
        );
        let engine = SyncEngine::new(machine, rx, Duration::from_secs(300));

        let state = AppState {
            sync: engine.status_store(),
            feed: FeedStatusStore::default(),
            devices: vec![model, display],
            events,
        };
        (state, engine)
    }
}
