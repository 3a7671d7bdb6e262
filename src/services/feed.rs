use crate::config::FeedConfig;
use crate::models::{ApiState, SyncEvent, TrainUpdate};
use crate::providers::geops::{FeedCommand, FeedError, RealtimeClient, TrajectoryProperties};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between BUFFER and BBOX
const SUBSCRIBE_PAUSE: Duration = Duration::from_millis(100);

/// Connection state of the feed session, for the status API
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct FeedStatus {
    pub connected: bool,
    /// Unset until the tracked train has been resolved
    pub train_number: Option<i64>,
    pub last_state: Option<ApiState>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

pub type FeedStatusStore = Arc<RwLock<FeedStatus>>;

/// Turns raw trajectories into state changes of one vehicle.
///
/// Only the first frame of each run of identical states produces an update.
#[derive(Debug, Clone)]
pub struct VehicleDebounce {
    train_number: i64,
    last_state: Option<ApiState>,
}

impl VehicleDebounce {
    pub fn new(train_number: i64) -> Self {
        Self {
            train_number,
            last_state: None,
        }
    }

    pub fn last_state(&self) -> Option<ApiState> {
        self.last_state
    }

    pub fn observe(&mut self, properties: &TrajectoryProperties) -> Option<TrainUpdate> {
        if properties.train_number != Some(self.train_number) {
            return None;
        }

        let api_state = properties.api_state()?;
        if self.last_state == Some(api_state) {
            return None;
        }
        self.last_state = Some(api_state);

        Some(TrainUpdate {
            train_number: self.train_number,
            api_state,
            coordinates: properties.coordinates(),
            delay_ms: properties.delay_ms(),
        })
    }
}

/// Keeps one subscription to the realtime feed alive for the process lifetime
pub struct FeedSession {
    config: FeedConfig,
    debounce: VehicleDebounce,
    events: mpsc::Sender<SyncEvent>,
    status: FeedStatusStore,
}

impl FeedSession {
    pub fn new(
        config: FeedConfig,
        train_number: i64,
        events: mpsc::Sender<SyncEvent>,
        status: FeedStatusStore,
    ) -> Self {
        Self {
            config,
            debounce: VehicleDebounce::new(train_number),
            events,
            status,
        }
    }

    /// Connect, subscribe and forward updates; reconnect after any failure.
    ///
    /// Only returns once the sync engine is gone.
    pub async fn run(mut self) {
        let train_number = self.debounce.train_number;
        info!(train_number, url = %self.config.url, "Starting feed session");
        self.status.write().await.train_number = Some(train_number);

        loop {
            let result = self.run_session().await;

            {
                let mut status = self.status.write().await;
                status.connected = false;
                status.connected_since = None;
                if let Err(e) = &result {
                    status.last_error = Some(e.to_string());
                }
            }

            match result {
                Ok(()) => {
                    info!(train_number, "Sync engine stopped, ending feed session");
                    return;
                }
                Err(e) => {
                    warn!(
                        train_number,
                        error = %e,
                        delay_secs = self.config.reconnect_delay_secs,
                        "Feed session lost, reconnecting"
                    );
                }
            }

            tokio::time::sleep(self.config.reconnect_delay()).await;
            self.status.write().await.reconnects += 1;
        }
    }

    async fn run_session(&mut self) -> Result<(), FeedError> {
        let mut client = RealtimeClient::connect(&self.config.endpoint(), CONNECT_TIMEOUT).await?;
        info!(url = %self.config.url, "Connected to realtime feed");

        let [buffer, bbox] = FeedCommand::subscription(&self.config);
        client.send(&buffer).await?;
        tokio::time::sleep(SUBSCRIBE_PAUSE).await;
        client.send(&bbox).await?;
        info!(
            train_number = self.debounce.train_number,
            subscription = %bbox,
            "Subscribed to live vehicle data"
        );

        {
            let mut status = self.status.write().await;
            status.connected = true;
            status.connected_since = Some(Utc::now());
            status.last_error = None;
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval());
        // Skip the first tick which fires immediately
        keepalive.tick().await;

        loop {
            tokio::select! {
                frame = client.next_frame() => {
                    let frame = frame?;
                    for properties in frame.trajectories() {
                        if !self.forward(&properties).await {
                            client.close().await;
                            return Ok(());
                        }
                    }
                }
                _ = keepalive.tick() => {
                    debug!("Sending feed keepalive");
                    client.send(&FeedCommand::Ping).await?;
                }
            }
        }
    }

    /// Returns `false` once the engine no longer accepts events
    async fn forward(&mut self, properties: &TrajectoryProperties) -> bool {
        let Some(update) = self.debounce.observe(properties) else {
            return true;
        };

        info!(
            train_number = update.train_number,
            train_id = ?properties.train_id,
            state = update.api_state.as_str(),
            delay_ms = ?update.delay_ms,
            lon = ?update.coordinates.map(|c| c.lon),
            lat = ?update.coordinates.map(|c| c.lat),
            "Real train changed state"
        );

        {
            let mut status = self.status.write().await;
            status.last_state = Some(update.api_state);
            status.last_update_at = Some(Utc::now());
        }

        self.events
            .send(SyncEvent::RemoteStateChange(update))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinates;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn props(train_number: i64, state: &str) -> TrajectoryProperties {
        TrajectoryProperties {
            train_number: Some(train_number),
            state: Some(state.to_string()),
            raw_coordinates: Some(vec![11.6, 48.1]),
            ..Default::default()
        }
    }

    #[test]
    fn debounce_emits_on_change_only() {
        let mut debounce = VehicleDebounce::new(6543);

        let update = debounce.observe(&props(6543, "BOARDING")).unwrap();
        assert_eq!(update.api_state, ApiState::Boarding);
        assert_eq!(update.coordinates, Some(Coordinates::new(11.6, 48.1)));

        assert!(debounce.observe(&props(6543, "BOARDING")).is_none());
        assert!(debounce.observe(&props(6543, "BOARDING")).is_none());

        let update = debounce.observe(&props(6543, "DRIVING")).unwrap();
        assert_eq!(update.api_state, ApiState::Driving);
        assert_eq!(debounce.last_state(), Some(ApiState::Driving));
    }

    #[test]
    fn debounce_ignores_other_vehicles_and_unknown_states() {
        let mut debounce = VehicleDebounce::new(6543);

        assert!(debounce.observe(&props(1234, "BOARDING")).is_none());
        assert!(debounce.observe(&props(6543, "JOURNEY_CANCELLED")).is_none());
        assert!(debounce
            .observe(&TrajectoryProperties {
                train_number: Some(6543),
                ..Default::default()
            })
            .is_none());
        assert_eq!(debounce.last_state(), None);

        // Another vehicle's frames don't reset the run
        debounce.observe(&props(6543, "DRIVING")).unwrap();
        debounce.observe(&props(1234, "BOARDING"));
        assert!(debounce.observe(&props(6543, "DRIVING")).is_none());
    }

    fn trajectory_frame(train_number: i64, state: &str) -> Value {
        json!({
            "source": "trajectory",
            "content": {"properties": {
                "train_number": train_number,
                "state": state,
                "raw_coordinates": [11.6, 48.1],
            }}
        })
    }

    /// Accepts `sessions` connections in turn; each one reports received
    /// commands and replays its frames after the BBOX subscription. Sessions
    /// with frames hang up after replaying them, an empty one stays open.
    async fn fake_feed(
        sessions: Vec<Vec<Value>>,
    ) -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (session, frames) in sessions.into_iter().enumerate() {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                loop {
                    let Some(Ok(Message::Text(text))) = ws.next().await else {
                        break;
                    };
                    let _ = tx.send((session, text.to_string()));
                    if text.starts_with("BBOX") {
                        for frame in &frames {
                            ws.send(Message::Text(frame.to_string())).await.unwrap();
                        }
                        if !frames.is_empty() {
                            // Drop the connection to force a reconnect
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                }
            }
        });

        (format!("ws://{}", addr), rx)
    }

    fn test_session(
        url: String,
        events: mpsc::Sender<SyncEvent>,
        status: FeedStatusStore,
    ) -> FeedSession {
        let config = FeedConfig {
            url,
            reconnect_delay_secs: 0,
            keepalive_interval_secs: 1,
            ..Default::default()
        };
        FeedSession::new(config, 6543, events, status)
    }

    async fn next_update(rx: &mut mpsc::Receiver<SyncEvent>) -> TrainUpdate {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SyncEvent::RemoteStateChange(update) => update,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_state_changes_across_reconnects() {
        let (url, mut commands) = fake_feed(vec![
            vec![
                trajectory_frame(6543, "BOARDING"),
                trajectory_frame(6543, "BOARDING"),
                trajectory_frame(999, "DRIVING"),
            ],
            vec![
                // Repeated after reconnect: still debounced
                trajectory_frame(6543, "BOARDING"),
                json!({
                    "source": "buffer",
                    "content": [
                        {"source": "trajectory", "content": {"properties": {"train_number": 6543, "state": "DRIVING"}}},
                    ]
                }),
            ],
            vec![],
        ])
        .await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let status = FeedStatusStore::default();
        let session = test_session(url, events_tx, status.clone());
        let task = tokio::spawn(session.run());

        let first = next_update(&mut events_rx).await;
        assert_eq!(first.api_state, ApiState::Boarding);
        assert_eq!(first.coordinates, Some(Coordinates::new(11.6, 48.1)));

        let second = next_update(&mut events_rx).await;
        assert_eq!(second.api_state, ApiState::Driving);
        assert_eq!(second.coordinates, None);

        // Every session subscribes from scratch
        let mut received: Vec<(usize, String)> = Vec::new();
        while received.iter().filter(|(_, c)| c.starts_with("BBOX")).count() < 2 {
            received.push(
                tokio::time::timeout(Duration::from_secs(5), commands.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(received[0], (0, "BUFFER 100 100".to_string()));
        assert_eq!(
            received[1],
            (0, "BBOX 1269000 6087000 1350000 6200000 5 tenant=sbm".to_string())
        );
        assert!(received.contains(&(1, "BUFFER 100 100".to_string())));

        let snapshot = status.read().await.clone();
        assert_eq!(snapshot.train_number, Some(6543));
        assert_eq!(snapshot.last_state, Some(ApiState::Driving));
        assert!(snapshot.reconnects >= 1);

        // Nothing else was forwarded
        assert!(events_rx.try_recv().is_err());

        drop(events_rx);
        task.abort();
    }

    #[tokio::test]
    async fn sends_keepalive_while_idle() {
        let (url, mut commands) = fake_feed(vec![vec![]]).await;

        let (events_tx, _events_rx) = mpsc::channel(16);
        let task = tokio::spawn(test_session(url, events_tx, FeedStatusStore::default()).run());

        let ping = async {
            loop {
                let (_, command) = commands.recv().await.unwrap();
                if command == "PING" {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), ping).await.unwrap();

        task.abort();
    }

    #[tokio::test]
    async fn stops_when_engine_is_gone() {
        let (url, _commands) = fake_feed(vec![vec![trajectory_frame(6543, "BOARDING")], vec![]]).await;

        let (events_tx, events_rx) = mpsc::channel(16);
        drop(events_rx);
        let task = tokio::spawn(test_session(url, events_tx, FeedStatusStore::default()).run());

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
