//! Line protocol between the sync server and the embedded controllers.
//!
//! Every message is one newline-terminated ASCII line:
//!
//! | Direction | Line | Meaning |
//! |---|---|---|
//! | peer → link | `HELLO:MODEL`, `HELLO:STATION` | identification, must be first |
//! | link → peer | `ACK` | identification accepted |
//! | link → peer | `ERROR:expected HELLO:<ROLE>` | identification rejected, link closes |
//! | both | `PING` / `PONG` | liveness probe and response |
//! | peer → link | `HALL` | arrival sensor triggered |
//! | link → peer | `SPEED:<0.00-1.00>`, `STOP` | motor commands |
//! | link → peer | `STATION:<name>:valid`, `STATION:<name>:invalid`, `STATION:clear` | display commands |

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

pub const ACK: &str = "ACK";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const HALL: &str = "HALL";
pub const STOP: &str = "STOP";

const HELLO_PREFIX: &str = "HELLO:";
const SPEED_PREFIX: &str = "SPEED:";
const STATION_PREFIX: &str = "STATION:";
const STATION_CLEAR: &str = "clear";

/// Which kind of controller sits at the other end of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Drives the model's motor and owns the arrival sensor
    Model,
    /// Shows the station name and its validity
    Station,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Model => "MODEL",
            PeerRole::Station => "STATION",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MODEL" => Some(PeerRole::Model),
            "STATION" => Some(PeerRole::Station),
            _ => None,
        }
    }

    pub fn hello(&self) -> String {
        format!("{HELLO_PREFIX}{}", self.as_str())
    }

    /// Reply sent before closing a connection that failed identification
    pub fn rejection(&self) -> String {
        format!("ERROR:expected {}", self.hello())
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotent actuator command; a newer command always supersedes an older one
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Absolute motor speed in `[0, 1]`
    Speed(f64),
    Stop,
    ShowStation { name: String, valid: bool },
    ClearStation,
}

impl DeviceCommand {
    /// Speed is clamped to `[0, 1]` and sent with two decimals.
    pub fn encode(&self) -> String {
        match self {
            DeviceCommand::Speed(speed) => {
                let speed = if speed.is_finite() { speed.clamp(0.0, 1.0) } else { 0.0 };
                format!("{SPEED_PREFIX}{speed:.2}")
            }
            DeviceCommand::Stop => STOP.to_string(),
            DeviceCommand::ShowStation { name, valid } => {
                let validity = if *valid { "valid" } else { "invalid" };
                format!("{STATION_PREFIX}{name}:{validity}")
            }
            DeviceCommand::ClearStation => format!("{STATION_PREFIX}{STATION_CLEAR}"),
        }
    }

    /// Parses a command line as received by a controller
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();

        if line == STOP {
            return Ok(DeviceCommand::Stop);
        }

        if let Some(value) = line.strip_prefix(SPEED_PREFIX) {
            let speed: f64 = value
                .parse()
                .map_err(|_| ProtocolError::InvalidSpeed(value.to_string()))?;
            if !speed.is_finite() {
                return Err(ProtocolError::InvalidSpeed(value.to_string()));
            }
            return Ok(DeviceCommand::Speed(speed.clamp(0.0, 1.0)));
        }

        if let Some(rest) = line.strip_prefix(STATION_PREFIX) {
            if rest == STATION_CLEAR {
                return Ok(DeviceCommand::ClearStation);
            }
            // Station names may contain ':'; validity is always the last field
            return match rest.rsplit_once(':') {
                Some((name, "valid")) => Ok(DeviceCommand::ShowStation {
                    name: name.to_string(),
                    valid: true,
                }),
                Some((name, "invalid")) => Ok(DeviceCommand::ShowStation {
                    name: name.to_string(),
                    valid: false,
                }),
                _ => Err(ProtocolError::Unknown(line.to_string())),
            };
        }

        Err(ProtocolError::Unknown(line.to_string()))
    }
}

/// Lines a controller may send to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMessage {
    Hello(PeerRole),
    Hall,
    Ping,
    Pong,
}

impl PeerMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        match line {
            HALL => Ok(PeerMessage::Hall),
            PING => Ok(PeerMessage::Ping),
            PONG => Ok(PeerMessage::Pong),
            _ => {
                let role = line
                    .strip_prefix(HELLO_PREFIX)
                    .ok_or_else(|| ProtocolError::Unknown(line.to_string()))?;
                PeerRole::parse(role)
                    .map(PeerMessage::Hello)
                    .ok_or_else(|| ProtocolError::UnknownRole(role.to_string()))
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown message: {0:?}")]
    Unknown(String),
    #[error("Unknown peer role: {0:?}")]
    UnknownRole(String),
    #[error("Invalid speed value: {0:?}")]
    InvalidSpeed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_motor_commands() {
        assert_eq!(DeviceCommand::Speed(0.5).encode(), "SPEED:0.50");
        assert_eq!(DeviceCommand::Speed(1.0).encode(), "SPEED:1.00");
        assert_eq!(DeviceCommand::Speed(0.01).encode(), "SPEED:0.01");
        assert_eq!(DeviceCommand::Stop.encode(), "STOP");
    }

    #[test]
    fn speed_is_clamped_on_the_wire() {
        assert_eq!(DeviceCommand::Speed(1.7).encode(), "SPEED:1.00");
        assert_eq!(DeviceCommand::Speed(-0.2).encode(), "SPEED:0.00");
        assert_eq!(DeviceCommand::Speed(f64::NAN).encode(), "SPEED:0.00");
    }

    #[test]
    fn encodes_display_commands() {
        let show = DeviceCommand::ShowStation {
            name: "Marienplatz".into(),
            valid: true,
        };
        assert_eq!(show.encode(), "STATION:Marienplatz:valid");

        let waiting = DeviceCommand::ShowStation {
            name: "Karlsplatz (Stachus)".into(),
            valid: false,
        };
        assert_eq!(waiting.encode(), "STATION:Karlsplatz (Stachus):invalid");
        assert_eq!(DeviceCommand::ClearStation.encode(), "STATION:clear");
    }

    #[test]
    fn parses_commands_as_a_controller_sees_them() {
        assert_eq!(DeviceCommand::parse("SPEED:0.25\n"), Ok(DeviceCommand::Speed(0.25)));
        assert_eq!(DeviceCommand::parse("SPEED:3"), Ok(DeviceCommand::Speed(1.0)));
        assert_eq!(DeviceCommand::parse("STOP"), Ok(DeviceCommand::Stop));
        assert_eq!(
            DeviceCommand::parse("STATION:Hbf: Gleis 1:invalid"),
            Ok(DeviceCommand::ShowStation {
                name: "Hbf: Gleis 1".into(),
                valid: false
            })
        );
        assert_eq!(DeviceCommand::parse("STATION:clear"), Ok(DeviceCommand::ClearStation));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(
            DeviceCommand::parse("SPEED:fast"),
            Err(ProtocolError::InvalidSpeed("fast".into()))
        );
        assert_eq!(
            DeviceCommand::parse("SPEED:inf"),
            Err(ProtocolError::InvalidSpeed("inf".into()))
        );
        assert!(DeviceCommand::parse("STATION:Pasing:maybe").is_err());
        assert!(DeviceCommand::parse("reverser:1").is_err());
    }

    #[test]
    fn parses_peer_messages() {
        assert_eq!(
            PeerMessage::parse("HELLO:MODEL"),
            Ok(PeerMessage::Hello(PeerRole::Model))
        );
        assert_eq!(
            PeerMessage::parse("HELLO:STATION\r\n"),
            Ok(PeerMessage::Hello(PeerRole::Station))
        );
        assert_eq!(PeerMessage::parse("HALL"), Ok(PeerMessage::Hall));
        assert_eq!(PeerMessage::parse(" PONG "), Ok(PeerMessage::Pong));
        assert_eq!(PeerMessage::parse("PING"), Ok(PeerMessage::Ping));
        assert_eq!(
            PeerMessage::parse("HELLO:TOASTER"),
            Err(ProtocolError::UnknownRole("TOASTER".into()))
        );
        assert!(PeerMessage::parse("GET / HTTP/1.1").is_err());
    }

    #[test]
    fn role_greetings() {
        assert_eq!(PeerRole::Model.hello(), "HELLO:MODEL");
        assert_eq!(PeerRole::Station.rejection(), "ERROR:expected HELLO:STATION");
    }
}
