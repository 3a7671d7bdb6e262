use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// JSON station list (`{"stations": [...]}`), ordered along the line.
    pub stations_path: PathBuf,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub timetable: TimetableConfig,
    #[serde(default)]
    pub speed: SpeedProfile,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    /// Appended as `?key=` when set
    pub api_key: Option<String>,
    pub buffer: [u32; 2],
    pub bbox: BoundingBox,
    pub zoom: u32,
    pub tenant: String,
    pub keepalive_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub silence_warning_secs: u64,
    /// Skips the timetable lookup and tracks this train directly.
    pub train_number: Option<i64>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.geops.io/realtime-ws/v1/".to_string(),
            api_key: None,
            buffer: [100, 100],
            bbox: BoundingBox {
                min_x: 1_269_000.0,
                min_y: 6_087_000.0,
                max_x: 1_350_000.0,
                max_y: 6_200_000.0,
            },
            zoom: 5,
            tenant: "sbm".to_string(),
            keepalive_interval_secs: 7,
            reconnect_delay_secs: 5,
            silence_warning_secs: 300,
            train_number: None,
        }
    }
}

impl FeedConfig {
    /// WebSocket URL including the API key
    pub fn endpoint(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}key={}", self.url, separator, urlencoding::encode(key))
            }
            None => self.url.clone(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn silence_warning(&self) -> Duration {
        Duration::from_secs(self.silence_warning_secs.max(1))
    }
}

/// Subscription box in the feed's projected coordinates (EPSG:3857).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Returns bbox in the feed's command order: "min_x min_y max_x max_y"
    pub fn to_command_string(&self) -> String {
        format!("{} {} {} {}", self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimetableConfig {
    /// Station whose timetable is used to pick the train to track
    pub station_name: String,
    /// Accepted destinations (substring match)
    pub destinations: Vec<String>,
    pub lookahead_minutes: i64,
    pub request_timeout_secs: u64,
}

impl Default for TimetableConfig {
    fn default() -> Self {
        Self {
            station_name: "Fasanenpark".to_string(),
            destinations: vec!["Mammendorf".to_string(), "Maisach".to_string()],
            lookahead_minutes: 30,
            request_timeout_secs: 5,
        }
    }
}

impl TimetableConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Calibration of the model track against real travel times.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct SpeedProfile {
    /// Seconds the model needs for one station-to-station segment at full speed
    pub loop_seconds_at_full_speed: f64,
    /// Scheduled time for the run from the last station back to the origin marker
    pub return_to_origin_seconds: f64,
    pub min_speed: f64,
    pub max_speed: f64,
}

impl Default for SpeedProfile {
    fn default() -> Self {
        Self {
            loop_seconds_at_full_speed: 10.0,
            return_to_origin_seconds: 8.0,
            min_speed: 0.01,
            max_speed: 1.0,
        }
    }
}

impl SpeedProfile {
    /// Speed that makes the model cover one segment in `travel_seconds`.
    ///
    /// Absent or non-positive travel times fall back to `min_speed`.
    pub fn speed_for(&self, travel_seconds: Option<f64>) -> f64 {
        match travel_seconds {
            Some(seconds) if seconds > 0.0 => (self.loop_seconds_at_full_speed / seconds)
                .clamp(self.min_speed, self.max_speed),
            _ => self.min_speed,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub model: LinkConfig,
    pub station: LinkConfig,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            model: LinkConfig::default(),
            station: LinkConfig {
                bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
                ..LinkConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub bind: SocketAddr,
    pub handshake_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            handshake_timeout_secs: 5,
            heartbeat_interval_secs: 3,
            heartbeat_timeout_secs: 10,
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
    /// Explicitly allow all origins (development only). Defaults to false.
    pub cors_permissive: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            cors_permissive: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
