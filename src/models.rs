use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Run state of the real vehicle as reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiState {
    /// Standing at a platform with doors open
    Boarding,
    /// Moving between two stations
    Driving,
}

impl ApiState {
    /// Parses the feed's `state` property. Other values (e.g. `CANCELLED`) are not run states.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BOARDING" => Some(ApiState::Boarding),
            "DRIVING" => Some(ApiState::Driving),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiState::Boarding => "BOARDING",
            ApiState::Driving => "DRIVING",
        }
    }
}

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinates {
    pub lon: f64,
    pub lat: f64,
}

impl Coordinates {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    /// Builds from a `[lon, lat]` pair (GeoJSON order). Non-finite values are rejected.
    pub fn from_lon_lat(pair: &[f64]) -> Option<Self> {
        match pair {
            [lon, lat, ..] if lon.is_finite() && lat.is_finite() => Some(Self::new(*lon, *lat)),
            _ => None,
        }
    }
}

/// A state change of the tracked vehicle, produced by the feed session
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TrainUpdate {
    pub train_number: i64,
    pub api_state: ApiState,
    pub coordinates: Option<Coordinates>,
    /// Reported delay in milliseconds, informational only
    pub delay_ms: Option<i64>,
}

/// Everything the sync engine reacts to, funneled through one queue
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    RemoteStateChange(TrainUpdate),
    ArrivalSensor,
}
