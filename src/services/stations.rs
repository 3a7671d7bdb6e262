/// Station catalogue and nearest-station matching
///
/// The catalogue is the ordered list of stops the model track represents,
/// loaded once at startup and never re-sorted. Matching a live coordinate to
/// a catalogue index is the only way the model gets anchored to a position,
/// so it has to be deterministic: ties resolve to the first station.
use crate::models::Coordinates;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use utoipa::ToSchema;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A stop on the modelled line
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Scheduled seconds to the next station along the line
    pub travel_time_to_next: Option<f64>,
}

impl Station {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lon, self.lat)
    }
}

/// On-disk station entry; `id` falls back to the name when absent
#[derive(Debug, Deserialize)]
struct StationEntry {
    #[serde(default)]
    id: Option<String>,
    name: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    travel_time_to_next: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StationFile {
    stations: Vec<StationEntry>,
}

/// Immutable, ordered station list
#[derive(Debug, Clone, PartialEq)]
pub struct StationCatalog {
    stations: Vec<Station>,
}

impl StationCatalog {
    pub fn new(stations: Vec<Station>) -> Result<Self, CatalogError> {
        if stations.is_empty() {
            return Err(CatalogError::Empty);
        }

        if let Some(bad) = stations
            .iter()
            .find(|s| !s.lat.is_finite() || !s.lon.is_finite())
        {
            return Err(CatalogError::InvalidCoordinates {
                name: bad.name.clone(),
            });
        }

        Ok(Self { stations })
    }

    /// Load from the JSON station file (`{"stations": [...]}`)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CatalogError::ReadError(e.to_string()))?;
        let catalog = Self::from_json(&content)?;

        info!(
            path = %path.as_ref().display(),
            station_count = catalog.len(),
            "Loaded station catalogue"
        );
        Ok(catalog)
    }

    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let file: StationFile =
            serde_json::from_str(content).map_err(|e| CatalogError::ParseError(e.to_string()))?;

        let stations = file
            .stations
            .into_iter()
            .map(|entry| Station {
                id: entry.id.unwrap_or_else(|| entry.name.clone()),
                name: entry.name,
                lat: entry.lat,
                lon: entry.lon,
                travel_time_to_next: entry.travel_time_to_next,
            })
            .collect();

        Self::new(stations)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Station> {
        self.stations.get(index)
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn last_index(&self) -> usize {
        self.stations.len() - 1
    }

    /// Index of the station closest to `coordinates` by great-circle distance.
    ///
    /// Strict comparison keeps the first of equally distant stations.
    pub fn nearest(&self, coordinates: Coordinates) -> usize {
        let mut best_index = 0;
        let mut best_distance = f64::INFINITY;

        for (i, station) in self.stations.iter().enumerate() {
            let distance = haversine_distance(coordinates, station.coordinates());
            if distance < best_distance {
                best_distance = distance;
                best_index = i;
            }
        }

        best_index
    }
}

/// Calculate distance between two coordinates using Haversine formula
/// Returns distance in meters
pub fn haversine_distance(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read station file: {0}")]
    ReadError(String),
    #[error("Failed to parse station file: {0}")]
    ParseError(String),
    #[error("Station catalogue is empty")]
    Empty,
    #[error("Station {name} has non-finite coordinates")]
    InvalidCoordinates { name: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn station(name: &str, lon: f64, lat: f64, travel: Option<f64>) -> Station {
        Station {
            id: name.to_lowercase(),
            name: name.to_string(),
            lat,
            lon,
            travel_time_to_next: travel,
        }
    }

    #[test]
    fn loads_travel_times_file_shape() {
        let json = r#"{
            "stations": [
                {"name": "Pasing", "lat": 48.1496, "lon": 11.4614, "travel_time_to_next": 120},
                {"id": "laim", "name": "Laim", "lat": 48.1446, "lon": 11.5035}
            ]
        }"#;
        let catalog = StationCatalog::from_json(json).unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.last_index(), 1);
        let pasing = catalog.get(0).unwrap();
        assert_eq!(pasing.id, "Pasing");
        assert_eq!(pasing.travel_time_to_next, Some(120.0));
        let laim = catalog.get(1).unwrap();
        assert_eq!(laim.id, "laim");
        assert_eq!(laim.travel_time_to_next, None);
    }

    #[test]
    fn rejects_empty_catalogue() {
        let err = StationCatalog::from_json(r#"{"stations": []}"#).unwrap_err();
        assert!(matches!(err, CatalogError::Empty));
    }

    #[test]
    fn rejects_malformed_file() {
        let err = StationCatalog::from_json(r#"{"stations": [{"name": "X"}]}"#).unwrap_err();
        assert!(matches!(err, CatalogError::ParseError(_)));
    }

    #[test]
    fn rejects_non_finite_coordinates() {
        let err = StationCatalog::new(vec![station("Nowhere", f64::NAN, 0.0, None)]).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidCoordinates { name } if name == "Nowhere"));
    }

    #[test]
    fn haversine_known_distances() {
        let origin = Coordinates::new(0.0, 0.0);
        assert_eq!(haversine_distance(origin, origin), 0.0);

        // One degree of latitude is ~111.195 km on this sphere
        let north = Coordinates::new(0.0, 1.0);
        let d = haversine_distance(origin, north);
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");

        // Symmetric
        assert!((d - haversine_distance(north, origin)).abs() < 1e-6);

        // Marienplatz to Ostbahnhof, roughly 2.4 km
        let marienplatz = Coordinates::new(11.5755, 48.1374);
        let ostbahnhof = Coordinates::new(11.6046, 48.1275);
        let d = haversine_distance(marienplatz, ostbahnhof);
        assert!((2_200.0..2_700.0).contains(&d), "got {d}");
    }

    #[test]
    fn nearest_picks_closest_station() {
        let catalog = StationCatalog::new(vec![
            station("S0", 0.0, 0.0, Some(10.0)),
            station("S1", 0.0, 1.0, Some(20.0)),
            station("S2", 0.0, 2.0, None),
        ])
        .unwrap();

        assert_eq!(catalog.nearest(Coordinates::new(0.0, 0.0)), 0);
        assert_eq!(catalog.nearest(Coordinates::new(0.0, 0.9)), 1);
        assert_eq!(catalog.nearest(Coordinates::new(0.1, 5.0)), 2);
        assert_eq!(catalog.nearest(Coordinates::new(0.0, -3.0)), 0);
    }

    #[test]
    fn nearest_ties_resolve_to_first_occurrence() {
        let catalog = StationCatalog::new(vec![
            station("West", -1.0, 0.0, None),
            station("East", 1.0, 0.0, None),
            station("WestAgain", -1.0, 0.0, None),
        ])
        .unwrap();

        // Equidistant from West and East
        assert_eq!(catalog.nearest(Coordinates::new(0.0, 0.0)), 0);
        // Duplicate coordinates: the earlier entry wins
        assert_eq!(catalog.nearest(Coordinates::new(-1.0, 0.0)), 0);
    }
}
