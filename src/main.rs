use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use model_sync::api::{self, AppState};
use model_sync::config::{Config, FeedConfig, TimetableConfig};
use model_sync::device::link::DeviceLink;
use model_sync::device::protocol::PeerRole;
use model_sync::models::SyncEvent;
use model_sync::outputs::{LinkDisplayOutput, LinkModelOutput};
use model_sync::services::feed::{FeedSession, FeedStatusStore};
use model_sync::services::stations::StationCatalog;
use model_sync::services::timetable;
use model_sync::sync::{self, SyncEngine, SyncStateMachine};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
/// Between failed attempts to pick a train from the timetable
const LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_sync=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("MODEL_SYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    info!(path = %config_path, "Starting model sync server");

    let config = Config::load(&config_path)
        .inspect_err(|e| error!(path = %config_path, error = %e, "Failed to load config"))?;

    let catalog = StationCatalog::load(&config.stations_path).inspect_err(|e| {
        error!(path = ?config.stations_path, error = %e, "Failed to load station catalogue")
    })?;
    info!(station_count = catalog.len(), "Loaded station catalogue");
    for (index, station) in catalog.stations().iter().enumerate() {
        debug!(
            index,
            name = %station.name,
            travel_time_to_next = ?station.travel_time_to_next,
            "Station"
        );
    }

    // All inputs of the state machine go through this queue
    let (events, events_rx) = sync::event_queue();

    // Device links, bound up front so a bad address fails startup
    let (model_link, model_handle) =
        DeviceLink::new(PeerRole::Model, config.devices.model.clone(), events.clone());
    let (station_link, station_handle) =
        DeviceLink::new(PeerRole::Station, config.devices.station.clone(), events.clone());

    let model_listener = model_link
        .bind()
        .await
        .inspect_err(|e| error!(addr = %config.devices.model.bind, error = %e, "Failed to bind model link"))?;
    let station_listener = station_link
        .bind()
        .await
        .inspect_err(|e| error!(addr = %config.devices.station.bind, error = %e, "Failed to bind station link"))?;

    tokio::spawn(model_link.run(model_listener));
    tokio::spawn(station_link.run(station_listener));

    // Sync engine
    let machine = SyncStateMachine::new(
        Arc::new(catalog),
        config.speed,
        LinkModelOutput::new(model_handle.clone()),
        LinkDisplayOutput::new(station_handle.clone()),
    );
    let engine = SyncEngine::new(machine, events_rx, config.feed.silence_warning());
    let sync_status = engine.status_store();
    tokio::spawn(engine.run());

    // Feed session, once we know which train to follow
    let feed_status = FeedStatusStore::default();
    tokio::spawn(track_train(
        config.feed.clone(),
        config.timetable.clone(),
        events.clone(),
        feed_status.clone(),
    ));

    let state = AppState {
        sync: sync_status,
        feed: feed_status,
        devices: vec![model_handle, station_handle],
        events,
    };
    let app = api::router(state, config.http.cors_permissive);

    // Start server
    let listener = TcpListener::bind(config.http.bind)
        .await
        .inspect_err(|e| error!(addr = %config.http.bind, error = %e, "Failed to bind status API"))?;
    info!(addr = %config.http.bind, "Status API listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Pick the train from the timetable (retrying until one is found), then follow it
async fn track_train(
    feed: FeedConfig,
    timetable: TimetableConfig,
    events: mpsc::Sender<SyncEvent>,
    status: FeedStatusStore,
) {
    let train_number = loop {
        match timetable::resolve_train_number(&feed, &timetable).await {
            Ok(train_number) => break train_number,
            Err(e) => {
                warn!(
                    error = %e,
                    retry_secs = LOOKUP_RETRY_DELAY.as_secs(),
                    "Could not pick a train to track"
                );
                status.write().await.last_error = Some(e.to_string());
                tokio::time::sleep(LOOKUP_RETRY_DELAY).await;
            }
        }
    };

    FeedSession::new(feed, train_number, events, status).run().await;
}
