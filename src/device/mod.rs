pub mod controller;
pub mod framing;
pub mod heartbeat;
pub mod link;
pub mod protocol;
