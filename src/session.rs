//! Per-shard gateway protocol state machine.
//!
//! [`ShardSession`] owns no socket and no timers. The connection actor
//! feeds it socket and timer events, then drains the [`SessionAction`]s it
//! queued and carries them out in order.

use crate::close::CloseCode;
use crate::config::GatewayConfig;
use crate::error::{Error, TimeoutKind};
use crate::events::GatewayEvent;
use crate::health::HeartbeatMonitor;
use crate::payload::{
    GatewayPayload, Hello, Identify, IdentifyProperties, OpCode, Presence, Ready,
    RequestGuildMembers, Resume, Status,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Close code that ends the socket but keeps the server-side session
pub const RESUME_CLOSE_CODE: u16 = 4901;

/// Connection status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStatus {
    /// No socket
    #[default]
    Disconnected,
    /// Socket is opening
    Connecting,
    /// Socket open, waiting for HELLO / READY
    Handshaking,
    /// IDENTIFY in flight
    Identifying,
    /// RESUME in flight
    Resuming,
    /// Session established
    Ready,
}

impl ShardStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Disconnected => "disconnected",
            ShardStatus::Connecting => "connecting",
            ShardStatus::Handshaking => "handshaking",
            ShardStatus::Identifying => "identifying",
            ShardStatus::Resuming => "resuming",
            ShardStatus::Ready => "ready",
        }
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    /// Resume immediately when possible, otherwise back off
    Auto,
    /// Keep the session for a later manual connect
    Manual,
    /// Forget everything (hard reset)
    Never,
}

/// A frame waiting for its token bucket grant
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    /// Frame to write
    pub payload: GatewayPayload,
    /// May use reserved tokens and jumps the queue
    pub priority: bool,
}

impl OutboundFrame {
    /// PRESENCE_UPDATE frames also need the presence bucket
    pub fn is_presence_update(&self) -> bool {
        self.payload.op == OpCode::PresenceUpdate
    }
}

/// Side effect requested by the state machine
#[derive(Debug, Clone)]
pub enum SessionAction {
    /// Queue a frame on the outbound buckets
    Send(OutboundFrame),
    /// (Re)start the periodic heartbeat
    StartHeartbeat(Duration),
    /// Cancel the periodic heartbeat
    StopHeartbeat,
    /// Cancel the connect timeout
    ClearConnectTimeout,
    /// Send a close frame and drop the socket
    Close { code: u16, reason: &'static str },
    /// Drop the socket without a close frame
    DropSocket,
    /// Publish an event
    Emit(GatewayEvent),
    /// Ask the scheduler to connect this shard again after `delay`
    Reconnect { delay: Duration },
    /// Replace the outbound buckets with fresh ones
    ResetBuckets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    Absent,
    Pending,
    Open,
    Closed,
}

/// Protocol state of one gateway connection
#[derive(Debug)]
pub struct ShardSession {
    id: u32,
    shard_count: u32,
    token: String,
    gateway_url: String,
    config: GatewayConfig,

    status: ShardStatus,
    socket: SocketState,
    sequence: u64,
    session_id: Option<String>,
    resume_url: Option<String>,

    connecting: bool,
    ready: bool,
    heartbeat: HeartbeatMonitor,
    connect_attempts: u32,
    reconnect_interval: Duration,
    presence: Presence,

    actions: Vec<SessionAction>,
}

impl ShardSession {
    /// Create a disconnected session
    pub fn new(
        id: u32,
        shard_count: u32,
        token: impl Into<String>,
        gateway_url: impl Into<String>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            id,
            shard_count,
            token: token.into(),
            gateway_url: gateway_url.into(),
            status: ShardStatus::Disconnected,
            socket: SocketState::Absent,
            sequence: 0,
            session_id: None,
            resume_url: None,
            connecting: false,
            ready: false,
            heartbeat: HeartbeatMonitor::new(),
            connect_attempts: 0,
            reconnect_interval: config.backoff.initial_delay,
            presence: config.presence.clone(),
            config,
            actions: Vec::new(),
        }
    }

    /// Take the queued side effects
    pub fn drain_actions(&mut self) -> Vec<SessionAction> {
        std::mem::take(&mut self.actions)
    }

    /// Start a connection attempt and return the URL to open.
    pub fn connect(&mut self) -> Result<String, Error> {
        if matches!(self.socket, SocketState::Pending | SocketState::Open) {
            warn!("[SHARD-{}] Connect requested with an existing connection", self.id);
            return Err(Error::ExistingConnection);
        }
        if self.token.is_empty() {
            return Err(Error::MissingToken);
        }

        self.connect_attempts += 1;
        self.connecting = true;
        self.status = ShardStatus::Connecting;
        self.socket = SocketState::Pending;

        let url = match (&self.session_id, &self.resume_url) {
            (Some(_), Some(resume_url)) => resume_url.clone(),
            (Some(_), None) => {
                self.warn("Resume url is not currently present, the gateway may disconnect sooner");
                self.config.connect_url(&self.gateway_url)
            }
            (None, _) => self.config.connect_url(&self.gateway_url),
        };

        debug!(
            "[SHARD-{}] Connecting (attempt {}) to {}",
            self.id, self.connect_attempts, url
        );
        Ok(url)
    }

    /// Socket finished its opening handshake
    pub fn on_open(&mut self) {
        if self.socket != SocketState::Pending {
            return;
        }
        self.socket = SocketState::Open;
        self.status = ShardStatus::Handshaking;
        self.heartbeat.reset();
        debug!("[SHARD-{}] Socket open", self.id);
        self.emit(GatewayEvent::Connect { shard_id: self.id });
    }

    /// Socket could not be opened
    pub fn on_connect_failed(&mut self, error: Error) {
        if self.socket != SocketState::Pending {
            return;
        }
        self.socket = SocketState::Closed;
        self.disconnect(Reconnect::Auto, Some(error));
    }

    /// The connect deadline passed
    pub fn on_connect_timeout(&mut self) {
        if self.connecting {
            self.disconnect(Reconnect::Auto, Some(Error::timeout(TimeoutKind::Connect)));
        }
    }

    /// Socket was closed by the peer or the network
    pub fn on_close(&mut self, code: Option<u16>, reason: &str) {
        if self.socket == SocketState::Absent {
            return;
        }
        self.socket = SocketState::Closed;

        let Some(code) = code else {
            debug!("[SHARD-{}] WS close: unknown code: {}", self.id, reason);
            self.disconnect(Reconnect::Auto, None);
            return;
        };

        let close = CloseCode::from(code);
        let action = close.action();
        debug!(
            "[SHARD-{}] {} WS close: {}: {}",
            self.id,
            if code == 1000 { "Clean" } else { "Unclean" },
            code,
            reason
        );

        if action.invalidate_session {
            self.invalidate_session();
        }
        if action.reset_sequence {
            self.sequence = 0;
        }

        let reconnect = if action.reconnect {
            Reconnect::Auto
        } else {
            Reconnect::Never
        };
        self.disconnect(reconnect, close.to_error(reason).map(Error::from));
    }

    /// Process one inbound frame
    pub fn handle_payload(&mut self, payload: GatewayPayload) -> Result<(), Error> {
        if let Some(seq) = payload.s.filter(|s| *s > 0) {
            if seq > self.sequence + 1
                && self.socket != SocketState::Absent
                && self.status != ShardStatus::Resuming
            {
                let message = format!("Non-consecutive sequence ({} -> {})", self.sequence, seq);
                self.warn(&message);
            }
            self.sequence = seq;
        }

        match payload.op {
            OpCode::Dispatch => self.handle_dispatch(payload)?,
            OpCode::Heartbeat => self.heartbeat(false),
            OpCode::InvalidSession => {
                if payload.d.as_bool().unwrap_or(false) {
                    debug!("[SHARD-{}] Invalid session, resuming", self.id);
                    self.resume();
                } else {
                    self.sequence = 0;
                    self.invalidate_session();
                    self.warn("Invalid session, reidentifying");
                    self.identify();
                }
            }
            OpCode::Reconnect => {
                debug!("[SHARD-{}] Reconnecting due to server request", self.id);
                self.disconnect(Reconnect::Auto, None);
            }
            OpCode::Hello => {
                let hello: Hello = serde_json::from_value(payload.d)?;
                if hello.heartbeat_interval > 0 {
                    let interval = Duration::from_millis(hello.heartbeat_interval);
                    self.heartbeat.set_interval(interval);
                    self.actions.push(SessionAction::StartHeartbeat(interval));
                }

                self.connecting = false;
                self.actions.push(SessionAction::ClearConnectTimeout);

                if self.session_id.is_some() {
                    self.resume();
                } else {
                    self.identify();
                    self.heartbeat(true);
                }

                self.emit(GatewayEvent::Hello {
                    shard_id: self.id,
                    heartbeat_interval: hello.heartbeat_interval,
                });
            }
            OpCode::HeartbeatAck => {
                self.heartbeat.record_ack();
                trace!(
                    "[SHARD-{}] Heartbeat acknowledged, latency {:?}",
                    self.id,
                    self.heartbeat.latency()
                );
            }
            other => self.emit(GatewayEvent::Unknown {
                shard_id: self.id,
                op: u8::from(other),
                data: payload.d,
            }),
        }

        Ok(())
    }

    fn handle_dispatch(&mut self, payload: GatewayPayload) -> Result<(), Error> {
        let name = payload.t.unwrap_or_default();
        match name.as_str() {
            "READY" => {
                let ready: Ready = serde_json::from_value(payload.d)?;
                self.mark_established();
                self.presence.status = Status::Online;
                self.resume_url = ready
                    .resume_gateway_url
                    .as_deref()
                    .map(|url| self.config.connect_url(url));
                self.session_id = Some(ready.session_id);

                info!(
                    "[SHARD-{}] Ready with {} guilds",
                    self.id,
                    ready.guilds.len()
                );
                self.emit(GatewayEvent::Ready { shard_id: self.id });
            }
            "RESUMED" => {
                self.mark_established();
                info!("[SHARD-{}] Resumed at sequence {}", self.id, self.sequence);
                self.emit(GatewayEvent::Resumed { shard_id: self.id });
            }
            _ => self.emit(GatewayEvent::Dispatch {
                shard_id: self.id,
                name,
                sequence: payload.s,
                data: payload.d,
            }),
        }
        Ok(())
    }

    fn mark_established(&mut self) {
        self.connect_attempts = 0;
        self.reconnect_interval = self.config.backoff.initial_delay;
        self.connecting = false;
        self.actions.push(SessionAction::ClearConnectTimeout);
        self.status = ShardStatus::Ready;
        self.ready = true;
    }

    /// Send a heartbeat.
    ///
    /// `normal` beats come from the interval timer and fail the connection
    /// when the previous beat was never acknowledged. Requested beats skip
    /// that check.
    pub fn heartbeat(&mut self, normal: bool) {
        // The identify path never assigns Identifying, so only Resuming suppresses in practice
        if matches!(self.status, ShardStatus::Resuming | ShardStatus::Identifying) {
            trace!("[SHARD-{}] Skipping heartbeat while {}", self.id, self.status);
            return;
        }

        if normal {
            if !self.heartbeat.is_acked() {
                debug!(
                    "[SHARD-{}] Heartbeat timeout, last sent {:?}, last ack {:?}",
                    self.id,
                    self.heartbeat.last_sent(),
                    self.heartbeat.last_received()
                );
                self.disconnect(Reconnect::Auto, Some(Error::timeout(TimeoutKind::Heartbeat)));
                return;
            }
            self.heartbeat.expect_ack();
        }

        self.heartbeat.record_sent();
        let sequence = if self.sequence > 0 {
            Value::from(self.sequence)
        } else {
            Value::Null
        };
        self.send(OpCode::Heartbeat, &sequence, true);
    }

    fn identify(&mut self) {
        let identify = Identify {
            token: self.token.clone(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: [self.id, self.shard_count],
            presence: self.presence.clone(),
            intents: self.config.intents,
        };
        debug!("[SHARD-{}] Identifying", self.id);
        self.send(OpCode::Identify, &identify, true);
    }

    fn resume(&mut self) {
        let Some(session_id) = self.session_id.clone() else {
            self.identify();
            return;
        };

        self.status = ShardStatus::Resuming;
        let resume = Resume {
            token: self.token.clone(),
            session_id,
            seq: self.sequence,
        };
        debug!("[SHARD-{}] Resuming at sequence {}", self.id, self.sequence);
        self.send(OpCode::Resume, &resume, true);
    }

    /// Tear down the connection.
    pub fn disconnect(&mut self, reconnect: Reconnect, error: Option<Error>) {
        if self.socket == SocketState::Absent {
            return;
        }

        self.actions.push(SessionAction::StopHeartbeat);
        let keep_session = reconnect != Reconnect::Never && self.session_id.is_some();
        match self.socket {
            SocketState::Open if keep_session => self.actions.push(SessionAction::Close {
                code: RESUME_CLOSE_CODE,
                reason: "reconnect",
            }),
            SocketState::Open => self.actions.push(SessionAction::Close {
                code: 1000,
                reason: "normal",
            }),
            SocketState::Pending => {
                debug!("[SHARD-{}] Terminating socket before open", self.id);
                self.actions.push(SessionAction::DropSocket);
            }
            SocketState::Closed | SocketState::Absent => {}
        }

        self.socket = SocketState::Absent;
        self.reset();

        let error = error.map(Arc::new);
        if let Some(error) = &error {
            self.emit(GatewayEvent::Error {
                shard_id: self.id,
                error: Arc::clone(error),
            });
        }
        self.emit(GatewayEvent::Disconnect {
            shard_id: self.id,
            error,
        });

        if self.session_id.is_some() && self.connect_attempts >= self.config.max_resume_attempts {
            debug!(
                "[SHARD-{}] Invalidating session after {} resume attempts",
                self.id, self.connect_attempts
            );
            self.invalidate_session();
        }

        match reconnect {
            Reconnect::Auto if self.config.auto_reconnect => {
                if self.session_id.is_some() {
                    debug!(
                        "[SHARD-{}] Immediately reconnecting for potential resume (attempt {})",
                        self.id, self.connect_attempts
                    );
                    self.actions.push(SessionAction::Reconnect {
                        delay: Duration::ZERO,
                    });
                } else {
                    debug!(
                        "[SHARD-{}] Queueing reconnect in {:?} (attempt {})",
                        self.id, self.reconnect_interval, self.connect_attempts
                    );
                    self.actions.push(SessionAction::Reconnect {
                        delay: self.reconnect_interval,
                    });
                    self.reconnect_interval =
                        self.config.backoff.next_delay(self.reconnect_interval);
                }
            }
            Reconnect::Manual => {}
            _ => self.hard_reset(),
        }
    }

    fn reset(&mut self) {
        self.connecting = false;
        self.ready = false;
        self.heartbeat.reset();
        self.status = ShardStatus::Disconnected;
        self.actions.push(SessionAction::ClearConnectTimeout);
    }

    /// Restore pristine state, keeping only identity and configuration
    pub fn hard_reset(&mut self) {
        self.reset();
        self.socket = SocketState::Absent;
        self.sequence = 0;
        self.invalidate_session();
        self.reconnect_interval = self.config.backoff.initial_delay;
        self.connect_attempts = 0;
        self.presence = self.config.presence.clone();
        self.actions.push(SessionAction::ResetBuckets);
    }

    fn invalidate_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
    }

    /// Replace the presence and publish it when connected
    pub fn update_presence(&mut self, presence: Presence) {
        self.presence = presence;
        let presence = self.presence.clone();
        self.send(OpCode::PresenceUpdate, &presence, false);
    }

    /// Ask for guild member chunks
    pub fn request_guild_members(&mut self, request: &RequestGuildMembers) {
        self.send(OpCode::RequestGuildMembers, request, false);
    }

    fn send<T: Serialize + ?Sized>(&mut self, op: OpCode, data: &T, priority: bool) {
        if self.socket != SocketState::Open {
            trace!("[SHARD-{}] Dropping {:?} frame, socket not open", self.id, op);
            return;
        }
        match GatewayPayload::new(op, data) {
            Ok(payload) => self
                .actions
                .push(SessionAction::Send(OutboundFrame { payload, priority })),
            Err(e) => error!("[SHARD-{}] Failed to encode {:?} frame: {}", self.id, op, e),
        }
    }

    fn emit(&mut self, event: GatewayEvent) {
        self.actions.push(SessionAction::Emit(event));
    }

    fn warn(&mut self, message: &str) {
        warn!("[SHARD-{}] {}", self.id, message);
        self.emit(GatewayEvent::Warn {
            shard_id: self.id,
            message: message.to_string(),
        });
    }

    /// Shard ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Connection status
    pub fn status(&self) -> ShardStatus {
        self.status
    }

    /// Whether READY or RESUMED arrived on the current socket
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether a socket is open or opening
    pub fn has_socket(&self) -> bool {
        matches!(self.socket, SocketState::Pending | SocketState::Open)
    }

    /// Whether the socket has not reached HELLO yet
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Whether the socket is open
    pub fn is_open(&self) -> bool {
        self.socket == SocketState::Open
    }

    /// Last sequence number received
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Session used for RESUME
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// URL used for the next resume
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Connect attempts since the last READY/RESUMED
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Delay before the next non-resumable reconnect
    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    /// Heartbeat round trip, `None` when unknown
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    /// Desired presence
    pub fn presence(&self) -> &Presence {
        &self.presence
    }
}
