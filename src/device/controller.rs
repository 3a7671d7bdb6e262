//! Controller side of the device link, as run on the model's microcontroller.
//!
//! The arrival sensor is interrupt driven. [`SensorLatch::on_interrupt`] is
//! the whole interrupt handler: it only touches atomics (timestamp + flag)
//! and never the motor or the socket. The control loop polls the latch and
//! does the actual stop/notify work.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::device::framing::LineReader;
use crate::device::heartbeat::Heartbeat;
use crate::device::link::LinkError;
use crate::device::protocol::{DeviceCommand, PeerRole, ACK, HALL, PING, PONG};

/// Motor driver of the model
pub trait Motor: Send {
    /// `speed` is already clamped to `[0, 1]`
    fn set_speed(&mut self, speed: f64);
    fn stop(&mut self);
}

const NEVER: u64 = u64::MAX;

/// Interrupt-safe, debounced arrival flag
#[derive(Debug)]
pub struct SensorLatch {
    triggered: AtomicBool,
    last_trigger_ms: AtomicU64,
    min_interval_ms: u64,
}

impl SensorLatch {
    pub const fn new(min_interval_ms: u64) -> Self {
        Self {
            triggered: AtomicBool::new(false),
            last_trigger_ms: AtomicU64::new(NEVER),
            min_interval_ms,
        }
    }

    /// Interrupt handler body. Returns whether the edge was accepted.
    pub fn on_interrupt(&self, now_ms: u64) -> bool {
        let last = self.last_trigger_ms.load(Ordering::Acquire);
        if last != NEVER && now_ms.saturating_sub(last) < self.min_interval_ms {
            return false;
        }
        self.last_trigger_ms.store(now_ms, Ordering::Release);
        self.triggered.store(true, Ordering::Release);
        true
    }

    /// Consume a pending trigger (main loop only)
    pub fn take(&self) -> bool {
        self.triggered.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// `host:port` of the model link
    pub server: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_delay: Duration,
    /// How often the control loop checks the sensor latch
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(3),
            pong_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub struct ControllerClient<M: Motor> {
    config: ControllerConfig,
    motor: M,
    sensor: Arc<SensorLatch>,
}

impl<M: Motor> ControllerClient<M> {
    pub fn new(config: ControllerConfig, motor: M, sensor: Arc<SensorLatch>) -> Self {
        Self {
            config,
            motor,
            sensor,
        }
    }

    /// Connect, serve, and reconnect after a fixed delay, forever
    pub async fn run(mut self) {
        loop {
            match self.run_session().await {
                Ok(()) => info!(server = %self.config.server, "Server closed the connection"),
                Err(e) => warn!(server = %self.config.server, error = %e, "Controller session ended"),
            }

            // Never keep driving without a server that can stop us
            self.motor.stop();

            info!(
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "Reconnecting to server"
            );
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    async fn run_session(&mut self) -> Result<(), LinkError> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.server),
        )
        .await
        .map_err(|_| LinkError::HandshakeTimeout)??;

        let (read_half, mut writer) = stream.into_split();
        let mut lines = LineReader::new(read_half);

        write_line(&mut writer, &PeerRole::Model.hello()).await?;

        let reply = tokio::time::timeout(self.config.connect_timeout, lines.next_line())
            .await
            .map_err(|_| LinkError::HandshakeTimeout)??;
        match reply {
            Some(line) if line.trim() == ACK => {
                info!(server = %self.config.server, "Connected to server");
            }
            Some(line) => {
                return Err(LinkError::Handshake {
                    received: line.trim().to_string(),
                })
            }
            None => return Err(LinkError::Closed),
        }

        let mut heartbeat = Heartbeat::new(
            self.config.ping_interval,
            self.config.pong_timeout,
            Instant::now(),
        );
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    self.handle_line(&line, &mut heartbeat, &mut writer).await?;
                }
                _ = ping.tick() => {
                    if heartbeat.expired(Instant::now()) {
                        return Err(LinkError::HeartbeatTimeout);
                    }
                    write_line(&mut writer, PING).await?;
                }
                _ = poll.tick() => {
                    if self.sensor.take() {
                        self.motor.stop();
                        write_line(&mut writer, HALL).await?;
                        info!("Arrival sensor reported");
                    }
                }
            }
        }
    }

    async fn handle_line<W: AsyncWrite + Unpin>(
        &mut self,
        line: &str,
        heartbeat: &mut Heartbeat,
        writer: &mut W,
    ) -> Result<(), LinkError> {
        match line.trim() {
            PONG => heartbeat.on_ack(Instant::now()),
            PING => write_line(writer, PONG).await?,
            other => match DeviceCommand::parse(other) {
                Ok(DeviceCommand::Speed(speed)) => {
                    debug!(speed, "Setting motor speed");
                    self.motor.set_speed(speed);
                }
                Ok(DeviceCommand::Stop) => {
                    debug!("Stopping motor");
                    self.motor.stop();
                }
                Ok(command) => debug!(?command, "Ignoring display command"),
                Err(e) => debug!(error = %e, "Skipping malformed command"),
            },
        }
        Ok(())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
