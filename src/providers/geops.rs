use crate::config::FeedConfig;
use crate::models::{ApiState, Coordinates};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Plain-text commands understood by the realtime feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedCommand {
    Buffer(u32, u32),
    Bbox {
        bbox: String,
        zoom: u32,
        tenant: String,
    },
    Ping,
    GetStation,
    GetTimetable(String),
}

impl FeedCommand {
    /// The two commands that start the vehicle subscription, in order
    pub fn subscription(config: &FeedConfig) -> [FeedCommand; 2] {
        [
            FeedCommand::Buffer(config.buffer[0], config.buffer[1]),
            FeedCommand::Bbox {
                bbox: config.bbox.to_command_string(),
                zoom: config.zoom,
                tenant: config.tenant.clone(),
            },
        ]
    }
}

impl fmt::Display for FeedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedCommand::Buffer(a, b) => write!(f, "BUFFER {} {}", a, b),
            FeedCommand::Bbox { bbox, zoom, tenant } => {
                write!(f, "BBOX {} {} tenant={}", bbox, zoom, tenant)
            }
            FeedCommand::Ping => write!(f, "PING"),
            FeedCommand::GetStation => write!(f, "GET station"),
            FeedCommand::GetTimetable(uic) => write!(f, "GET timetable_{}", uic),
        }
    }
}

/// One JSON frame: `source` says what `content` is
#[derive(Debug, Clone, Deserialize)]
pub struct FeedFrame {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub content: Value,
}

impl FeedFrame {
    pub fn parse(text: &str) -> Result<Self, FeedError> {
        serde_json::from_str(text).map_err(|e| FeedError::Json(e.to_string()))
    }

    /// Vehicle properties carried by this frame.
    ///
    /// `buffer` frames hold a list of `{source, content}` items, `trajectory*`
    /// frames hold a single trajectory. Items that don't parse are dropped.
    pub fn trajectories(&self) -> Vec<TrajectoryProperties> {
        if self.source == "buffer" {
            let Some(items) = self.content.as_array() else {
                return Vec::new();
            };
            items
                .iter()
                .filter_map(|item| item.get("content"))
                .filter_map(TrajectoryProperties::from_content)
                .collect()
        } else if self.source.starts_with("trajectory") {
            TrajectoryProperties::from_content(&self.content)
                .into_iter()
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn station(&self) -> Option<StationProperties> {
        if self.source != "station" {
            return None;
        }
        properties(&self.content)
    }

    pub fn timetable_entry(&self) -> Option<TimetableEntry> {
        if !self.source.starts_with("timetable_") {
            return None;
        }
        TimetableEntry::deserialize(&self.content).ok()
    }
}

fn properties<T: for<'de> Deserialize<'de>>(content: &Value) -> Option<T> {
    T::deserialize(content.get("properties")?).ok()
}

/// `content.properties` of a trajectory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrajectoryProperties {
    pub train_id: Option<String>,
    pub train_number: Option<i64>,
    pub state: Option<String>,
    /// `[lon, lat]` in EPSG:4326
    pub raw_coordinates: Option<Vec<f64>>,
    /// Milliseconds
    pub delay: Option<f64>,
}

impl TrajectoryProperties {
    fn from_content(content: &Value) -> Option<Self> {
        properties(content)
    }

    pub fn api_state(&self) -> Option<ApiState> {
        self.state.as_deref().and_then(ApiState::parse)
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        self.raw_coordinates
            .as_deref()
            .and_then(Coordinates::from_lon_lat)
    }

    pub fn delay_ms(&self) -> Option<i64> {
        self.delay.filter(|d| d.is_finite()).map(|d| d.round() as i64)
    }
}

/// `content.properties` of a station frame
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationProperties {
    #[serde(default)]
    pub name: String,
    pub uic: Option<Value>,
    #[serde(rename = "networkLines")]
    pub network_lines: Option<Value>,
}

impl StationProperties {
    /// UIC code as the string used in `GET timetable_<uic>`
    pub fn uic(&self) -> Option<String> {
        match self.uic.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Only stations served by network lines carry timetables
    pub fn is_served(&self) -> bool {
        match &self.network_lines {
            None | Some(Value::Null) => false,
            Some(Value::Array(lines)) => !lines.is_empty(),
            Some(Value::Object(lines)) => !lines.is_empty(),
            Some(_) => true,
        }
    }
}

/// One departure from `GET timetable_<uic>`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimetableEntry {
    pub train_number: Option<i64>,
    #[serde(default)]
    pub to: Vec<String>,
    /// Milliseconds since the epoch
    pub time: Option<i64>,
    pub state: Option<String>,
    #[serde(default)]
    pub has_realtime_journey: bool,
}

impl TimetableEntry {
    pub fn destination(&self) -> &str {
        self.to.first().map(String::as_str).unwrap_or("Unknown")
    }

    pub fn departure_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.time?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.as_deref() == Some("CANCELLED")
    }
}

pub type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One WebSocket connection to the realtime feed
pub struct RealtimeClient {
    ws: FeedStream,
}

impl RealtimeClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, FeedError> {
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| FeedError::Timeout)?
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        Ok(Self { ws })
    }

    pub async fn send(&mut self, command: &FeedCommand) -> Result<(), FeedError> {
        tracing::debug!(%command, "Sending feed command");
        self.ws
            .send(Message::Text(command.to_string()))
            .await
            .map_err(|e| FeedError::Send(e.to_string()))
    }

    /// Next JSON frame. Non-text messages and unparseable text are skipped.
    pub async fn next_frame(&mut self) -> Result<FeedFrame, FeedError> {
        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(FeedError::Receive(e.to_string())),
                None => return Err(FeedError::Closed),
            };

            match message {
                Message::Text(text) => match FeedFrame::parse(&text) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => tracing::debug!(error = %e, "Skipping malformed frame"),
                },
                Message::Close(_) => return Err(FeedError::Closed),
                _ => {}
            }
        }
    }

    /// Resolve a station's UIC code by (partial) name
    pub async fn station_uic(&mut self, name: &str, timeout: Duration) -> Result<String, FeedError> {
        self.send(&FeedCommand::GetStation).await?;

        let lookup = async {
            loop {
                let frame = self.next_frame().await?;
                let Some(station) = frame.station() else {
                    continue;
                };
                if station.name.contains(name) && station.is_served() {
                    if let Some(uic) = station.uic() {
                        tracing::info!(station = %station.name, %uic, "Resolved station");
                        return Ok::<_, FeedError>(uic);
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::StationNotFound(name.to_string())),
        }
    }

    /// Departures at a station, collected until `timeout` or `max_entries`.
    ///
    /// Cancelled departures are skipped. Sorted by departure time.
    pub async fn timetable(
        &mut self,
        uic: &str,
        timeout: Duration,
        max_entries: usize,
    ) -> Result<Vec<TimetableEntry>, FeedError> {
        self.send(&FeedCommand::GetTimetable(uic.to_string())).await?;

        let mut entries = Vec::new();
        let collect = async {
            while entries.len() < max_entries {
                let frame = self.next_frame().await?;
                if let Some(entry) = frame.timetable_entry() {
                    if !entry.is_cancelled() {
                        entries.push(entry);
                    }
                }
            }
            Ok::<(), FeedError>(())
        };

        // The feed never signals the end of a timetable, so running out of time is normal
        if let Ok(result) = tokio::time::timeout(timeout, collect).await {
            result?;
        }

        entries.sort_by_key(|entry| entry.time.unwrap_or(i64::MAX));
        tracing::info!(%uic, count = entries.len(), "Fetched timetable");
        Ok(entries)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Failed to connect to feed: {0}")]
    Connect(String),
    #[error("Failed to send to feed: {0}")]
    Send(String),
    #[error("Failed to read from feed: {0}")]
    Receive(String),
    #[error("Feed connection closed")]
    Closed,
    #[error("Invalid frame: {0}")]
    Json(String),
    #[error("Timed out waiting for the feed")]
    Timeout,
    #[error("Station not found: {0}")]
    StationNotFound(String),
    #[error("No train found going to {0}")]
    NoTrainFound(String),
}
