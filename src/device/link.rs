//! Server side of the device control channel.
//!
//! One [`DeviceLink`] owns one listener and serves exactly one controller at
//! a time. A session runs handshake → command/heartbeat loop → teardown, and
//! the next connection is only accepted after teardown finished and the
//! reconnect delay elapsed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::LinkConfig;
use crate::device::framing::LineReader;
use crate::device::heartbeat::Heartbeat;
use crate::device::protocol::{DeviceCommand, PeerMessage, PeerRole, ACK, PING, PONG};
use crate::models::SyncEvent;

/// Observable state of a link, shared with the status API
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LinkStatus {
    pub role: PeerRole,
    pub connected: bool,
    pub peer: Option<String>,
    pub last_heartbeat_sent_at: Option<DateTime<Utc>>,
    pub last_heartbeat_ack_at: Option<DateTime<Utc>>,
    /// Sessions that completed the handshake
    pub sessions_started: u64,
    /// Sessions torn down for any reason, including rejected handshakes
    pub teardowns: u64,
    pub heartbeat_timeouts: u64,
    pub last_command: Option<String>,
}

impl LinkStatus {
    fn new(role: PeerRole) -> Self {
        Self {
            role,
            connected: false,
            peer: None,
            last_heartbeat_sent_at: None,
            last_heartbeat_ack_at: None,
            sessions_started: 0,
            teardowns: 0,
            heartbeat_timeouts: 0,
            last_command: None,
        }
    }
}

pub type LinkStatusStore = Arc<RwLock<LinkStatus>>;

/// Cheap, cloneable handle used by output sinks to issue commands.
///
/// Only the latest command is kept. Sending never blocks and never fails:
/// while no controller is connected the command waits and is replayed
/// right after the next handshake.
#[derive(Clone)]
pub struct LinkHandle {
    role: PeerRole,
    commands: Arc<watch::Sender<Option<DeviceCommand>>>,
    status: LinkStatusStore,
}

impl LinkHandle {
    pub fn send(&self, command: DeviceCommand) {
        debug!(role = %self.role, command = %command.encode(), "Queueing device command");
        self.commands.send_replace(Some(command));
    }

    pub fn latest_command(&self) -> Option<DeviceCommand> {
        self.commands.borrow().clone()
    }

    pub async fn status(&self) -> LinkStatus {
        self.status.read().await.clone()
    }
}

pub struct DeviceLink {
    role: PeerRole,
    config: LinkConfig,
    events: mpsc::Sender<SyncEvent>,
    // Held so that `changed()` never reports a closed channel
    _commands_tx: Arc<watch::Sender<Option<DeviceCommand>>>,
    commands: watch::Receiver<Option<DeviceCommand>>,
    status: LinkStatusStore,
}

impl DeviceLink {
    pub fn new(
        role: PeerRole,
        config: LinkConfig,
        events: mpsc::Sender<SyncEvent>,
    ) -> (Self, LinkHandle) {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let status = Arc::new(RwLock::new(LinkStatus::new(role)));

        let handle = LinkHandle {
            role,
            commands: tx.clone(),
            status: status.clone(),
        };
        let link = Self {
            role,
            config,
            events,
            _commands_tx: tx,
            commands: rx,
            status,
        };
        (link, handle)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs)
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_interval_secs.max(1))
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_timeout_secs)
    }

    fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.config.reconnect_delay_secs)
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, LinkError> {
        Ok(TcpListener::bind(self.config.bind).await?)
    }

    /// Accept loop: one session at a time, fixed delay between sessions
    pub async fn run(mut self, listener: TcpListener) {
        info!(
            role = %self.role,
            addr = ?listener.local_addr().ok(),
            "Device link listening"
        );

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "Failed to accept device connection");
                    tokio::time::sleep(self.reconnect_delay()).await;
                    continue;
                }
            };

            info!(role = %self.role, %peer, "Device connected");
            let (read_half, mut writer) = stream.into_split();
            let mut lines = LineReader::new(read_half);

            let result = self.run_session(&mut lines, &mut writer, peer).await;

            // Teardown: record it, then close the socket and drop any partial line
            self.mark_torn_down(&result).await;
            drop(lines);
            drop(writer);

            match result {
                Ok(()) => info!(role = %self.role, %peer, "Device closed the connection"),
                Err(LinkError::HeartbeatTimeout) => {
                    warn!(role = %self.role, %peer, "Device heartbeat timed out, session declared dead")
                }
                Err(e) => warn!(role = %self.role, %peer, error = %e, "Device session ended"),
            }

            info!(
                role = %self.role,
                delay_secs = self.config.reconnect_delay_secs,
                "Waiting before accepting the next device connection"
            );
            tokio::time::sleep(self.reconnect_delay()).await;
        }
    }

    async fn run_session(
        &mut self,
        lines: &mut LineReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        peer: SocketAddr,
    ) -> Result<(), LinkError> {
        // Step 1: the first line must identify the expected peer role
        let first = match tokio::time::timeout(self.handshake_timeout(), lines.next_line()).await {
            Err(_) => return Err(LinkError::HandshakeTimeout),
            Ok(line) => line?,
        };
        let Some(first) = first else {
            return Err(LinkError::Closed);
        };

        match PeerMessage::parse(&first) {
            Ok(PeerMessage::Hello(role)) if role == self.role => {}
            _ => {
                warn!(role = %self.role, %peer, received = %first.trim(), "Rejecting device handshake");
                // Best effort, the connection is closed either way
                let _ = write_line(writer, &self.role.rejection()).await;
                return Err(LinkError::Handshake {
                    received: first.trim().to_string(),
                });
            }
        }

        write_line(writer, ACK).await?;
        self.mark_connected(peer).await;
        info!(role = %self.role, %peer, "Device handshake accepted");

        // Step 2: bring the controller up to date with the latest command
        let latest = self.commands.borrow_and_update().clone();
        if let Some(command) = latest {
            self.send_command(writer, &command).await?;
        }

        // Step 3: command/heartbeat loop
        let mut heartbeat = Heartbeat::new(
            self.heartbeat_interval(),
            self.heartbeat_timeout(),
            Instant::now(),
        );
        let mut probe = tokio::time::interval(heartbeat.interval());
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first tick which fires immediately (the handshake just proved liveness)
        probe.tick().await;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Ok(());
                    };
                    self.handle_line(&line, &mut heartbeat, writer).await?;
                }
                _ = probe.tick() => {
                    if heartbeat.expired(Instant::now()) {
                        return Err(LinkError::HeartbeatTimeout);
                    }
                    write_line(writer, PING).await?;
                    self.status.write().await.last_heartbeat_sent_at = Some(Utc::now());
                    debug!(role = %self.role, "Sent heartbeat probe");
                }
                Ok(()) = self.commands.changed() => {
                    let command = self.commands.borrow_and_update().clone();
                    if let Some(command) = command {
                        self.send_command(writer, &command).await?;
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
        match PeerMessage::parse(line) {
            Ok(PeerMessage::Pong) => {
                heartbeat.on_ack(Instant::now());
                self.status.write().await.last_heartbeat_ack_at = Some(Utc::now());
                debug!(role = %self.role, "Heartbeat acknowledged");
            }
            Ok(PeerMessage::Ping) => {
                // Controller-initiated keepalive counts as liveness too
                heartbeat.on_ack(Instant::now());
                self.status.write().await.last_heartbeat_ack_at = Some(Utc::now());
                write_line(writer, PONG).await?;
            }
            Ok(PeerMessage::Hall) if self.role == PeerRole::Model => {
                info!(role = %self.role, "Arrival sensor triggered");
                if self.events.send(SyncEvent::ArrivalSensor).await.is_err() {
                    warn!("Sync engine is gone, dropping arrival sensor event");
                }
            }
            Ok(other) => {
                debug!(role = %self.role, message = ?other, "Ignoring unexpected device message");
            }
            Err(e) => {
                debug!(role = %self.role, error = %e, "Skipping malformed device line");
            }
        }
        Ok(())
    }

    async fn send_command<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        command: &DeviceCommand,
    ) -> Result<(), LinkError> {
        let line = command.encode();
        write_line(writer, &line).await?;
        debug!(role = %self.role, command = %line, "Sent device command");
        self.status.write().await.last_command = Some(line);
        Ok(())
    }

    async fn mark_connected(&self, peer: SocketAddr) {
        let mut status = self.status.write().await;
        status.connected = true;
        status.peer = Some(peer.to_string());
        status.sessions_started += 1;
        status.last_heartbeat_ack_at = Some(Utc::now());
    }

    async fn mark_torn_down(&self, result: &Result<(), LinkError>) {
        let mut status = self.status.write().await;
        status.connected = false;
        status.peer = None;
        status.teardowns += 1;
        if matches!(result, Err(LinkError::HeartbeatTimeout)) {
            status.heartbeat_timeouts += 1;
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unexpected handshake: {received:?}")]
    Handshake { received: String },
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Heartbeat timed out")]
    HeartbeatTimeout,
    #[error("Connection closed")]
    Closed,
}
