/// Output sinks driven by the sync state machine
///
/// Sinks are fire-and-forget command emitters. Delivery problems are the
/// device link's business (it reconnects and replays the latest command),
/// so nothing here returns an error.
use crate::device::link::LinkHandle;
use crate::device::protocol::DeviceCommand;

/// Server → model train
pub trait ModelOutput: Send {
    /// Absolute speed in `[0, 1]`
    fn set_speed(&mut self, speed: f64);
    fn stop(&mut self);
}

/// Server → station display
pub trait StationDisplayOutput: Send {
    fn show(&mut self, name: &str, valid: bool);
    fn clear(&mut self);
}

/// Model output encoded onto the model's device link
pub struct LinkModelOutput {
    link: LinkHandle,
}

impl LinkModelOutput {
    pub fn new(link: LinkHandle) -> Self {
        Self { link }
    }
}

impl ModelOutput for LinkModelOutput {
    fn set_speed(&mut self, speed: f64) {
        self.link.send(DeviceCommand::Speed(speed.clamp(0.0, 1.0)));
    }

    fn stop(&mut self) {
        self.link.send(DeviceCommand::Stop);
    }
}

/// Display output encoded onto the station display's device link
pub struct LinkDisplayOutput {
    link: LinkHandle,
}

impl LinkDisplayOutput {
    pub fn new(link: LinkHandle) -> Self {
        Self { link }
    }
}

impl StationDisplayOutput for LinkDisplayOutput {
    fn show(&mut self, name: &str, valid: bool) {
        self.link.send(DeviceCommand::ShowStation {
            name: name.to_string(),
            valid,
        });
    }

    fn clear(&mut self) {
        self.link.send(DeviceCommand::ClearStation);
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every command in order; clones share the same log
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        log: Arc<Mutex<Vec<DeviceCommand>>>,
    }

    impl Recorder {
        pub(crate) fn commands(&self) -> Vec<DeviceCommand> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn last(&self) -> Option<DeviceCommand> {
            self.log.lock().unwrap().last().cloned()
        }

        fn push(&self, command: DeviceCommand) {
            self.log.lock().unwrap().push(command);
        }
    }

    impl ModelOutput for Recorder {
        fn set_speed(&mut self, speed: f64) {
            self.push(DeviceCommand::Speed(speed));
        }

        fn stop(&mut self) {
            self.push(DeviceCommand::Stop);
        }
    }

    impl StationDisplayOutput for Recorder {
        fn show(&mut self, name: &str, valid: bool) {
            self.push(DeviceCommand::ShowStation {
                name: name.to_string(),
                valid,
            });
        }

        fn clear(&mut self) {
            self.push(DeviceCommand::ClearStation);
        }
    }
}
