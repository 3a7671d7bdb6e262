use crate::config::SpeedProfile;
use crate::device::protocol::DeviceCommand;
use crate::models::{ApiState, Coordinates, SyncEvent};
use crate::outputs::{ModelOutput, StationDisplayOutput};
use crate::services::stations::StationCatalog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Capacity of the serialized event queue
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Where the model is relative to the real vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Parked at the origin marker, waiting for the real train to board
    WaitingAtOrigin,
    /// At a station while the real train is boarding there
    AtStationValid,
    /// At a station while the real train is still on its way
    AtStationWaiting,
    /// Running between two stations
    Driving,
    /// Running from the last station back to the origin marker
    DrivingToOrigin,
    /// Late: the real train already boards at our destination
    RunningToCatchUp,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::WaitingAtOrigin => "WAITING_AT_ORIGIN",
            SyncState::AtStationValid => "AT_STATION_VALID",
            SyncState::AtStationWaiting => "AT_STATION_WAITING",
            SyncState::Driving => "DRIVING",
            SyncState::DrivingToOrigin => "DRIVING_TO_ORIGIN",
            SyncState::RunningToCatchUp => "RUNNING_TO_CATCH_UP",
        }
    }
}

/// Moore outputs of one state
#[derive(Debug, Clone, PartialEq)]
pub struct Outputs {
    pub model: DeviceCommand,
    pub display: DeviceCommand,
}

/// Six-state Moore machine keeping the model in step with the real vehicle.
///
/// Arrival is only ever confirmed by the physical sensor; speed and
/// destination only ever come from the remote feed.
pub struct SyncStateMachine<M, D> {
    catalog: Arc<StationCatalog>,
    speed: SpeedProfile,
    model: M,
    display: D,
    state: SyncState,
    station_index: Option<usize>,
    last_api_state: Option<ApiState>,
    target_speed: f64,
}

impl<M: ModelOutput, D: StationDisplayOutput> SyncStateMachine<M, D> {
    /// Starts in `WaitingAtOrigin` and applies its outputs right away.
    pub fn new(catalog: Arc<StationCatalog>, speed: SpeedProfile, model: M, display: D) -> Self {
        let mut machine = Self {
            catalog,
            speed,
            model,
            display,
            state: SyncState::WaitingAtOrigin,
            station_index: None,
            last_api_state: None,
            target_speed: 0.0,
        };
        machine.apply_outputs();
        machine
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn station_index(&self) -> Option<usize> {
        self.station_index
    }

    pub fn last_api_state(&self) -> Option<ApiState> {
        self.last_api_state
    }

    pub fn target_speed(&self) -> f64 {
        self.target_speed
    }

    /// The real train changed between BOARDING and DRIVING.
    ///
    /// A repeat of the last seen state is dropped before it can cause a
    /// transition. Returns the new state if a transition happened.
    pub fn on_remote_state_change(
        &mut self,
        api_state: ApiState,
        coordinates: Option<Coordinates>,
    ) -> Option<SyncState> {
        if self.last_api_state == Some(api_state) {
            debug!(api_state = api_state.as_str(), "Ignoring repeated remote state");
            return None;
        }
        self.last_api_state = Some(api_state);

        let next = self.transition_on_remote(api_state)?;
        self.enter(next, coordinates);
        Some(next)
    }

    /// The model reached a station marker. Returns the new state if a transition happened.
    pub fn on_arrival_sensor(&mut self) -> Option<SyncState> {
        let next = self.transition_on_sensor();
        match next {
            Some(next) => self.enter(next, None),
            None => debug!(state = ?self.state, "Arrival sensor ignored in this state"),
        }
        next
    }

    fn transition_on_remote(&self, api_state: ApiState) -> Option<SyncState> {
        use SyncState::*;

        match (self.state, api_state) {
            (WaitingAtOrigin, ApiState::Boarding) => Some(AtStationValid),
            (AtStationValid, ApiState::Driving) => Some(self.departure_state()),
            (AtStationWaiting, ApiState::Boarding) => Some(AtStationValid),
            // Real train boards before the model arrived
            (Driving, ApiState::Boarding) => Some(RunningToCatchUp),
            // Real train left before the model arrived
            (RunningToCatchUp, ApiState::Driving) => Some(self.departure_state()),
            _ => None,
        }
    }

    fn transition_on_sensor(&self) -> Option<SyncState> {
        match self.state {
            SyncState::Driving => match self.last_api_state {
                Some(ApiState::Boarding) => Some(SyncState::AtStationValid),
                _ => Some(SyncState::AtStationWaiting),
            },
            SyncState::DrivingToOrigin => Some(SyncState::WaitingAtOrigin),
            SyncState::RunningToCatchUp => Some(SyncState::AtStationValid),
            _ => None,
        }
    }

    /// Leaving the last station means heading back to the origin marker
    fn departure_state(&self) -> SyncState {
        if self.is_at_last_station() {
            SyncState::DrivingToOrigin
        } else {
            SyncState::Driving
        }
    }

    fn is_at_last_station(&self) -> bool {
        self.station_index
            .is_some_and(|index| index >= self.catalog.last_index())
    }

    fn enter(&mut self, next: SyncState, coordinates: Option<Coordinates>) {
        let from = self.state;

        // Entry actions
        match next {
            SyncState::AtStationValid if from == SyncState::WaitingAtOrigin => {
                self.first_sync(coordinates);
            }
            SyncState::Driving => self.depart(),
            SyncState::DrivingToOrigin => {
                self.target_speed = self.speed.speed_for(Some(self.speed.return_to_origin_seconds));
            }
            SyncState::RunningToCatchUp => {
                self.target_speed = self.speed.max_speed;
            }
            SyncState::WaitingAtOrigin => {
                self.station_index = None;
                self.last_api_state = None;
                self.target_speed = 0.0;
            }
            _ => {}
        }

        self.state = next;
        info!(
            from = ?from,
            to = ?next,
            station_index = ?self.station_index,
            station = self.current_station_name().unwrap_or("-"),
            "Sync state transition"
        );

        self.apply_outputs();
    }

    /// Anchor the model to the station nearest to the real train
    fn first_sync(&mut self, coordinates: Option<Coordinates>) {
        let index = match coordinates {
            Some(coordinates) => {
                let index = self.catalog.nearest(coordinates);
                info!(
                    station_index = index,
                    station = self.station_name(index).unwrap_or("-"),
                    lon = coordinates.lon,
                    lat = coordinates.lat,
                    "Synced to nearest station"
                );
                index
            }
            None => {
                warn!(
                    station = self.station_name(0).unwrap_or("-"),
                    "No coordinates for first sync, defaulting to first station"
                );
                0
            }
        };
        self.station_index = Some(index);
    }

    /// Speed for the segment leaving the current station, then point at the destination
    fn depart(&mut self) {
        let Some(departed) = self.station_index else {
            warn!("Departing without a station index");
            self.target_speed = self.speed.min_speed;
            return;
        };

        let travel_time = self
            .catalog
            .get(departed)
            .and_then(|station| station.travel_time_to_next);
        self.target_speed = self.speed.speed_for(travel_time);

        let last = self.catalog.last_index();
        let mut destination = departed + 1;
        if destination > last {
            warn!(
                station_index = departed,
                station_count = self.catalog.len(),
                "More departures than stations remain, clamping to last station"
            );
            destination = last;
        }
        self.station_index = Some(destination);
    }

    /// Outputs as a pure function of the current state
    pub fn outputs(&self) -> Outputs {
        let station_display = |valid: bool| match self.current_station_name() {
            Some(name) => DeviceCommand::ShowStation {
                name: name.to_string(),
                valid,
            },
            None => DeviceCommand::ClearStation,
        };

        match self.state {
            SyncState::WaitingAtOrigin => Outputs {
                model: DeviceCommand::Stop,
                display: DeviceCommand::ClearStation,
            },
            SyncState::AtStationValid => Outputs {
                model: DeviceCommand::Stop,
                display: station_display(true),
            },
            SyncState::AtStationWaiting => Outputs {
                model: DeviceCommand::Stop,
                display: station_display(false),
            },
            // After departure the index points at the destination
            SyncState::Driving => Outputs {
                model: DeviceCommand::Speed(self.target_speed),
                display: station_display(false),
            },
            SyncState::DrivingToOrigin => Outputs {
                model: DeviceCommand::Speed(self.target_speed),
                display: DeviceCommand::ClearStation,
            },
            SyncState::RunningToCatchUp => Outputs {
                model: DeviceCommand::Speed(self.speed.max_speed),
                display: station_display(false),
            },
        }
    }

    fn apply_outputs(&mut self) {
        let outputs = self.outputs();

        match outputs.model {
            DeviceCommand::Speed(speed) => self.model.set_speed(speed),
            _ => self.model.stop(),
        }
        match outputs.display {
            DeviceCommand::ShowStation { name, valid } => self.display.show(&name, valid),
            _ => self.display.clear(),
        }
    }

    fn station_name(&self, index: usize) -> Option<&str> {
        self.catalog.get(index).map(|s| s.name.as_str())
    }

    fn current_station_name(&self) -> Option<&str> {
        self.station_index.and_then(|index| self.station_name(index))
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let commanded_speed = match self.outputs().model {
            DeviceCommand::Speed(speed) => speed,
            _ => 0.0,
        };

        SyncSnapshot {
            state: self.state,
            station_index: self.station_index,
            station_name: self.current_station_name().map(str::to_string),
            next_station_name: self
                .station_index
                .and_then(|index| self.station_name(index + 1))
                .map(str::to_string),
            last_api_state: self.last_api_state,
            target_speed: self.target_speed,
            commanded_speed,
            updated_at: Utc::now(),
        }
    }
}

/// Read-only view of the machine for the status API
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SyncSnapshot {
    pub state: SyncState,
    pub station_index: Option<usize>,
    /// Current station, or the destination while driving
    pub station_name: Option<String>,
    pub next_station_name: Option<String>,
    pub last_api_state: Option<ApiState>,
    pub target_speed: f64,
    pub commanded_speed: f64,
    pub updated_at: DateTime<Utc>,
}

impl SyncSnapshot {
    /// `STATE | current → next | API: state | Speed: x.xx`
    pub fn summary(&self) -> String {
        let api = self.last_api_state.map(|s| s.as_str()).unwrap_or("-");
        format!(
            "{} | {} → {} | API: {} | Speed: {:.2}",
            self.state.as_str(),
            self.station_name.as_deref().unwrap_or("-"),
            self.next_station_name.as_deref().unwrap_or("-"),
            api,
            self.commanded_speed
        )
    }
}

pub type SyncStatusStore = Arc<RwLock<SyncSnapshot>>;

/// Create the serialized event queue feeding the engine
pub fn event_queue() -> (mpsc::Sender<SyncEvent>, mpsc::Receiver<SyncEvent>) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

/// Owns the state machine and applies queued events one at a time
pub struct SyncEngine<M, D> {
    machine: SyncStateMachine<M, D>,
    events: mpsc::Receiver<SyncEvent>,
    status: SyncStatusStore,
    silence_warning: Duration,
}

impl<M: ModelOutput, D: StationDisplayOutput> SyncEngine<M, D> {
    pub fn new(
        machine: SyncStateMachine<M, D>,
        events: mpsc::Receiver<SyncEvent>,
        silence_warning: Duration,
    ) -> Self {
        let status = Arc::new(RwLock::new(machine.snapshot()));
        Self {
            machine,
            events,
            status,
            silence_warning,
        }
    }

    pub fn status_store(&self) -> SyncStatusStore {
        self.status.clone()
    }

    pub fn handle(&mut self, event: SyncEvent) -> Option<SyncState> {
        match event {
            SyncEvent::RemoteStateChange(update) => self
                .machine
                .on_remote_state_change(update.api_state, update.coordinates),
            SyncEvent::ArrivalSensor => self.machine.on_arrival_sensor(),
        }
    }

    /// Process events until every sender is gone
    pub async fn run(mut self) {
        info!(state = ?self.machine.state(), "Sync engine started");

        let mut last_update = Instant::now();
        let mut silence_reported = false;
        let mut silence_check = tokio::time::interval(self.silence_warning);
        // Skip the first tick which fires immediately
        silence_check.tick().await;

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("Event queue closed, sync engine stopping");
                        break;
                    };
                    if matches!(event, SyncEvent::RemoteStateChange(_)) {
                        last_update = Instant::now();
                        silence_reported = false;
                    }
                    self.handle(event);
                    *self.status.write().await = self.machine.snapshot();
                }
                _ = silence_check.tick() => {
                    let silent_for = last_update.elapsed();
                    if !silence_reported && silent_for >= self.silence_warning {
                        warn!(
                            silent_for_secs = silent_for.as_secs(),
                            state = ?self.machine.state(),
                            "No updates from the feed for the tracked train"
                        );
                        silence_reported = true;
                    }
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync engine is not running")]
    QueueClosed,
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::outputs::recording::Recorder;
    use crate::services::stations::tests::station;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Input {
        Remote(ApiState, Option<(f64, f64)>),
        Sensor,
    }

    fn input() -> impl Strategy<Value = Input> {
        prop_oneof![
            (
                prop_oneof![Just(ApiState::Boarding), Just(ApiState::Driving)],
                proptest::option::of((-1.0f64..1.0, -1.0f64..6.0)),
            )
                .prop_map(|(state, coords)| Input::Remote(state, coords)),
            Just(Input::Sensor),
        ]
    }

    /// The transition table, written out independently of the machine
    fn expected(
        state: SyncState,
        input: &Input,
        last_api: Option<ApiState>,
        at_last: bool,
    ) -> Option<SyncState> {
        use SyncState::*;
        let departure = if at_last { DrivingToOrigin } else { Driving };
        match input {
            Input::Remote(api, _) if Some(*api) == last_api => None,
            Input::Remote(ApiState::Boarding, _) => match state {
                WaitingAtOrigin | AtStationWaiting => Some(AtStationValid),
                Driving => Some(RunningToCatchUp),
                _ => None,
            },
            Input::Remote(ApiState::Driving, _) => match state {
                AtStationValid | RunningToCatchUp => Some(departure),
                _ => None,
            },
            Input::Sensor => match state {
                Driving if last_api == Some(ApiState::Boarding) => Some(AtStationValid),
                Driving => Some(AtStationWaiting),
                DrivingToOrigin => Some(WaitingAtOrigin),
                RunningToCatchUp => Some(AtStationValid),
                _ => None,
            },
        }
    }

    proptest! {
        /// Every step follows the transition table, the index stays in range
        /// and only ever moves forward between returns to the origin.
        #[test]
        fn random_scripts_follow_the_table(
            inputs in proptest::collection::vec(input(), 0..60),
            line_len in 1usize..6,
        ) {
            let stations = (0..line_len)
                .map(|i| station(&format!("S{i}"), 0.0, i as f64, Some(5.0 + i as f64)))
                .collect();
            let catalog = Arc::new(StationCatalog::new(stations).unwrap());
            let mut sm = SyncStateMachine::new(
                catalog.clone(),
                SpeedProfile::default(),
                Recorder::default(),
                Recorder::default(),
            );

            for input in &inputs {
                let before = sm.state();
                let before_index = sm.station_index();
                let at_last = before_index.is_some_and(|i| i >= catalog.last_index());
                let want = expected(before, input, sm.last_api_state(), at_last);

                let got = match input {
                    Input::Remote(api, coords) => sm.on_remote_state_change(
                        *api,
                        coords.map(|(lon, lat)| Coordinates::new(lon, lat)),
                    ),
                    Input::Sensor => sm.on_arrival_sensor(),
                };

                prop_assert_eq!(got, want);
                prop_assert_eq!(sm.state(), want.unwrap_or(before));

                if let Some(index) = sm.station_index() {
                    prop_assert!(index < catalog.len());
                    if sm.state() != SyncState::AtStationValid || before != SyncState::WaitingAtOrigin {
                        if let Some(prev) = before_index {
                            prop_assert!(index >= prev);
                        }
                    }
                } else {
                    prop_assert!(matches!(sm.state(), SyncState::WaitingAtOrigin));
                }
            }
        }
    }
}
