use crate::bucket::TokenBucket;
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::events::{EventEmitter, GatewayEvent};
use crate::metrics::Metrics;
use crate::payload::{GatewayPayload, OpCode, Presence, RequestGuildMembers};
use crate::session::{OutboundFrame, Reconnect, SessionAction, ShardSession};
use crate::shard::ShardSnapshot;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Duration, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands that can be sent to a shard
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Open a socket (sent by the scheduler once admitted)
    Connect,
    /// Tear down the socket
    Disconnect(Reconnect),
    /// Replace the presence
    UpdatePresence(Presence),
    /// Send REQUEST_GUILD_MEMBERS
    RequestGuildMembers(RequestGuildMembers),
    /// Disconnect for good and end the task
    Shutdown,
}

/// Messages consumed by the scheduler task
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SchedulerEvent {
    /// Put a shard in the connect queue
    Enqueue(u32),
    /// HELLO arrived, the connect slot is free again
    Connected(u32),
    /// The connect was refused before a socket existed
    ConnectFailed(u32),
    /// READY arrived
    Ready(u32),
    /// RESUMED arrived
    Resumed(u32),
    /// Socket is gone
    Disconnected(u32),
    /// Put a shard back in the queue after `delay`
    Requeue { id: u32, delay: Duration },
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type PendingConnect = Pin<Box<dyn Future<Output = Result<WsStream, Error>> + Send>>;

/// What woke the runner
enum Wake {
    Command(Option<ShardCommand>),
    Opened(Result<WsStream, Error>),
    Inbound(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Heartbeat,
    ConnectTimeout,
}

/// Socket actor for one shard.
///
/// Owns the [`ShardSession`], the socket halves, the heartbeat interval
/// and the outbound buckets. Everything the session asks for is carried
/// out in [`ShardRunner::apply_actions`].
pub(crate) struct ShardRunner {
    id: u32,
    session: ShardSession,
    config: GatewayConfig,
    emitter: EventEmitter,
    metrics: Arc<Metrics>,
    snapshot: Arc<RwLock<ShardSnapshot>>,
    commands: mpsc::Receiver<ShardCommand>,
    scheduler: mpsc::UnboundedSender<SchedulerEvent>,
    frame_bucket: TokenBucket,
    presence_bucket: TokenBucket,
    pending: Option<PendingConnect>,
    connect_deadline: Option<Instant>,
    heartbeat: Option<Interval>,
    reader: Option<SplitStream<WsStream>>,
    writer: Option<mpsc::UnboundedSender<Message>>,
    writer_task: Option<JoinHandle<()>>,
}

impl ShardRunner {
    pub(crate) fn new(
        session: ShardSession,
        config: GatewayConfig,
        emitter: EventEmitter,
        metrics: Arc<Metrics>,
        snapshot: Arc<RwLock<ShardSnapshot>>,
        commands: mpsc::Receiver<ShardCommand>,
        scheduler: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            id: session.id(),
            frame_bucket: TokenBucket::new(config.frame_bucket),
            presence_bucket: TokenBucket::new(config.presence_bucket),
            session,
            config,
            emitter,
            metrics,
            snapshot,
            commands,
            scheduler,
            pending: None,
            connect_deadline: None,
            heartbeat: None,
            reader: None,
            writer: None,
            writer_task: None,
        }
    }

    /// Run until shutdown or until a fatal event goes unobserved
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        info!("[SHARD-{}] Entering event loop", self.id);

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                result = poll_connect(&mut self.pending) => Wake::Opened(result),
                message = next_message(&mut self.reader) => Wake::Inbound(message),
                _ = next_tick(&mut self.heartbeat) => Wake::Heartbeat,
                _ = wait_deadline(self.connect_deadline) => Wake::ConnectTimeout,
            };

            match wake {
                Wake::Command(Some(ShardCommand::Shutdown)) | Wake::Command(None) => {
                    info!("[SHARD-{}] Shutting down", self.id);
                    self.session.disconnect(Reconnect::Never, None);
                    self.apply_actions()?;
                    self.abort_socket();
                    return Ok(());
                }
                Wake::Command(Some(command)) => self.handle_command(command)?,
                Wake::Opened(result) => {
                    self.pending = None;
                    match result {
                        Ok(stream) => self.on_socket_open(stream),
                        Err(e) => {
                            debug!("[SHARD-{}] Connect failed: {}", self.id, e);
                            self.metrics.record_error();
                            self.session.on_connect_failed(e);
                        }
                    }
                }
                Wake::Inbound(message) => self.on_message(message),
                Wake::Heartbeat => self.session.heartbeat(true),
                Wake::ConnectTimeout => {
                    self.connect_deadline = None;
                    self.session.on_connect_timeout();
                }
            }

            self.apply_actions()?;
        }
    }

    fn handle_command(&mut self, command: ShardCommand) -> Result<(), Error> {
        match command {
            ShardCommand::Connect => match self.session.connect() {
                Ok(url) => {
                    self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
                    self.pending = Some(Box::pin(connect_with_options(url)));
                }
                Err(e) => {
                    let _ = self.scheduler.send(SchedulerEvent::ConnectFailed(self.id));
                    if e.is_fatal() {
                        error!("[SHARD-{}] Cannot connect: {}", self.id, e);
                        self.emitter.emit(GatewayEvent::Error {
                            shard_id: self.id,
                            error: Arc::new(e),
                        })?;
                    } else {
                        debug!("[SHARD-{}] Connect ignored: {}", self.id, e);
                    }
                }
            },
            ShardCommand::Disconnect(reconnect) => self.session.disconnect(reconnect, None),
            ShardCommand::UpdatePresence(presence) => self.session.update_presence(presence),
            ShardCommand::RequestGuildMembers(request) => {
                self.session.request_guild_members(&request)
            }
            ShardCommand::Shutdown => {}
        }
        Ok(())
    }

    fn on_socket_open(&mut self, stream: WsStream) {
        let (sink, reader) = stream.split();
        let (writer, task) = spawn_writer(self.id, sink, Arc::clone(&self.metrics));
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.writer_task = Some(task);

        self.metrics.record_connection();
        self.metrics.update_shard(self.id, |s| {
            s.is_connected = true;
            s.last_connected_at = Some(Instant::now());
        });
        info!("[SHARD-{}] Connected", self.id);

        self.session.on_open();
    }

    fn on_message(
        &mut self,
        message: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match message {
            Some(Ok(Message::Text(text))) => {
                self.metrics.record_frame_received();
                self.metrics.update_shard(self.id, |s| {
                    s.last_frame_at = Some(Instant::now());
                });

                let result = GatewayPayload::decode(&text)
                    .map_err(Error::from)
                    .and_then(|payload| {
                        match payload.op {
                            OpCode::HeartbeatAck => self.metrics.record_heartbeat_ack(),
                            OpCode::InvalidSession => self.metrics.record_invalid_session(),
                            _ => {}
                        }
                        self.session.handle_payload(payload)
                    });
                if let Err(e) = result {
                    warn!("[SHARD-{}] Failed to handle frame: {}", self.id, e);
                    self.report(e);
                }
            }
            Some(Ok(Message::Binary(data))) => {
                warn!(
                    "[SHARD-{}] Ignoring {} byte binary frame",
                    self.id,
                    data.len()
                );
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                self.abort_socket();
                self.session.on_close(code, &reason);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("[SHARD-{}] WebSocket error: {}", self.id, e);
                let reason = e.to_string();
                self.report(Error::WebSocket(e));
                self.abort_socket();
                self.session.on_close(Some(1006), &reason);
            }
            None => {
                info!("[SHARD-{}] WebSocket stream ended", self.id);
                self.abort_socket();
                self.session.on_close(Some(1006), "");
            }
        }
    }

    /// Publish a non-fatal error observed outside the state machine
    fn report(&mut self, error: Error) {
        self.metrics.record_error();
        let event = GatewayEvent::Error {
            shard_id: self.id,
            error: Arc::new(error),
        };
        if let Err(e) = self.emitter.emit(event) {
            error!("[SHARD-{}] {}", self.id, e);
        }
    }

    /// Carry out everything the session queued.
    ///
    /// The snapshot is refreshed before the scheduler hears about the
    /// transition, so its readiness scan always sees the new state.
    fn apply_actions(&mut self) -> Result<(), Error> {
        let mut notices = Vec::new();
        let mut failure = None;

        for action in self.session.drain_actions() {
            match action {
                SessionAction::Send(frame) => self.queue_frame(frame),
                SessionAction::StartHeartbeat(period) => {
                    let mut interval = interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(interval);
                }
                SessionAction::StopHeartbeat => self.heartbeat = None,
                SessionAction::ClearConnectTimeout => self.connect_deadline = None,
                SessionAction::Close { code, reason } => self.close_socket(code, reason),
                SessionAction::DropSocket => {
                    self.pending = None;
                    self.abort_socket();
                }
                SessionAction::Emit(event) => {
                    if let Some(notice) = scheduler_notice(&event) {
                        notices.push(notice);
                    }
                    if let GatewayEvent::Disconnect { .. } = event {
                        self.metrics.update_shard(self.id, |s| {
                            s.is_connected = false;
                            if let Some(connected_at) = s.last_connected_at {
                                s.total_uptime += connected_at.elapsed();
                            }
                        });
                    }
                    if let Err(e) = self.emitter.emit(event) {
                        error!("[SHARD-{}] {}", self.id, e);
                        failure.get_or_insert(e);
                    }
                }
                SessionAction::Reconnect { delay } => {
                    self.metrics.record_reconnection();
                    notices.push(SchedulerEvent::Requeue { id: self.id, delay });
                }
                SessionAction::ResetBuckets => {
                    self.frame_bucket = TokenBucket::new(self.config.frame_bucket);
                    self.presence_bucket = TokenBucket::new(self.config.presence_bucket);
                }
            }
        }

        self.publish();
        for notice in notices {
            if self.scheduler.send(notice).is_err() {
                trace!("[SHARD-{}] Scheduler is gone", self.id);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pace a frame through the buckets; PRESENCE_UPDATE waits on the
    /// presence bucket first, then on the frame bucket
    fn queue_frame(&mut self, frame: OutboundFrame) {
        let Some(writer) = self.writer.clone() else {
            return;
        };

        let text = match frame.payload.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("[SHARD-{}] Failed to encode frame: {}", self.id, e);
                return;
            }
        };

        let id = self.id;
        let op = frame.payload.op;
        let priority = frame.priority;
        let metrics = Arc::clone(&self.metrics);
        let write = move || {
            // The socket may have closed while the frame waited for a token
            if writer.is_closed() || writer.send(Message::Text(text)).is_err() {
                trace!("[SHARD-{}] Skipping frame, socket closed", id);
                return;
            }
            match op {
                OpCode::Heartbeat => metrics.record_heartbeat(),
                OpCode::Identify => metrics.record_identify(),
                OpCode::Resume => metrics.record_resume(),
                _ => {}
            }
        };

        if frame.is_presence_update() {
            let frame_bucket = self.frame_bucket.clone();
            self.presence_bucket
                .enqueue(move || frame_bucket.enqueue(write, priority), priority);
        } else {
            self.frame_bucket.enqueue(write, priority);
        }
    }

    fn close_socket(&mut self, code: u16, reason: &'static str) {
        self.reader = None;
        self.writer_task = None;
        if let Some(writer) = self.writer.take() {
            debug!("[SHARD-{}] Closing socket with {}", self.id, code);
            let frame = CloseFrame {
                code: WsCloseCode::from(code),
                reason: Cow::Borrowed(reason),
            };
            let _ = writer.send(Message::Close(Some(frame)));
        }
    }

    fn abort_socket(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }

    fn publish(&self) {
        let session = &self.session;
        {
            let mut snapshot = self.snapshot.write();
            snapshot.status = session.status();
            snapshot.ready = session.is_ready();
            snapshot.connecting = session.is_connecting();
            snapshot.resumable = session.session_id().is_some();
            snapshot.sequence = session.sequence();
            snapshot.latency = session.latency();
            snapshot.connect_attempts = session.connect_attempts();
        }
        self.metrics.update_shard(self.id, |s| {
            s.is_ready = session.is_ready();
            s.latency = session.latency();
            s.sequence = session.sequence();
            s.connect_attempts = session.connect_attempts();
        });
    }
}

impl Drop for ShardRunner {
    fn drop(&mut self) {
        self.abort_socket();
    }
}

fn scheduler_notice(event: &GatewayEvent) -> Option<SchedulerEvent> {
    match *event {
        GatewayEvent::Hello { shard_id, .. } => Some(SchedulerEvent::Connected(shard_id)),
        GatewayEvent::Ready { shard_id } => Some(SchedulerEvent::Ready(shard_id)),
        GatewayEvent::Resumed { shard_id } => Some(SchedulerEvent::Resumed(shard_id)),
        GatewayEvent::Disconnect { shard_id, .. } => Some(SchedulerEvent::Disconnected(shard_id)),
        _ => None,
    }
}

/// Writer half: one task per socket, ends after a close frame
fn spawn_writer(
    shard_id: u32,
    mut sink: SplitSink<WsStream, Message>,
    metrics: Arc<Metrics>,
) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("[SHARD-{}] Failed to send frame: {}", shard_id, e);
                break;
            }
            if closing {
                break;
            }
            metrics.record_frame_sent();
        }
        let _ = sink.close().await;
    });
    (tx, task)
}

async fn poll_connect(pending: &mut Option<PendingConnect>) -> Result<WsStream, Error> {
    match pending {
        Some(connect) => connect.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    reader: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match reader {
        Some(reader) => reader.next().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Open a gateway socket: DNS, TCP with low-latency options, then TLS and
/// the WebSocket handshake.
async fn connect_with_options(url: String) -> Result<WsStream, Error> {
    let parsed_url =
        Url::parse(&url).map_err(|e| Error::ConnectionFailed(format!("Invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port).await?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    socket.connect(dest_addr).await.map_err(|e| {
        Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e))
    })
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle's algorithm
    let _ = sock2.set_nodelay(true);

    // Keepalive to detect dead connections
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketConfig;
    use crate::error::ErrorKind;
    use crate::payload::Status;
    use serde_json::json;

    struct Harness {
        runner: ShardRunner,
        commands: mpsc::Sender<ShardCommand>,
        scheduler: mpsc::UnboundedReceiver<SchedulerEvent>,
        emitter: EventEmitter,
    }

    fn harness(token: &str, config: GatewayConfig) -> Harness {
        let (commands, command_rx) = mpsc::channel(8);
        let (scheduler_tx, scheduler) = mpsc::unbounded_channel();
        let emitter = EventEmitter::default();
        let session = ShardSession::new(1, 2, token, "wss://gateway.example.gg", config.clone());
        let runner = ShardRunner::new(
            session,
            config,
            emitter.clone(),
            Arc::new(Metrics::new()),
            Arc::new(RwLock::new(ShardSnapshot::new(1))),
            command_rx,
            scheduler_tx,
        );
        Harness {
            runner,
            commands,
            scheduler,
            emitter,
        }
    }

    fn frame(op: OpCode, priority: bool) -> OutboundFrame {
        OutboundFrame {
            payload: GatewayPayload::new(op, json!({"n": 1})).unwrap(),
            priority,
        }
    }

    fn attach_writer(runner: &mut ShardRunner) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        runner.writer = Some(tx);
        rx
    }

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let mut h = harness("Bot token", GatewayConfig::default());
        let mut written = attach_writer(&mut h.runner);

        h.runner.queue_frame(frame(OpCode::RequestGuildMembers, false));
        h.runner.queue_frame(frame(OpCode::Heartbeat, true));

        // Both fit in the window, so each is written as soon as it is queued
        let first = written.recv().await.unwrap();
        let second = written.recv().await.unwrap();
        assert!(first.to_text().unwrap().contains("\"op\":8"));
        assert!(second.to_text().unwrap().contains("\"op\":1"));
        assert_eq!(h.runner.metrics.heartbeats_sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_frames_wait_for_presence_bucket() {
        let config = GatewayConfig {
            presence_bucket: BucketConfig {
                capacity: 1,
                window: Duration::from_secs(20),
                reserved: 0,
            },
            ..GatewayConfig::default()
        };
        let mut h = harness("Bot token", config);
        let mut written = attach_writer(&mut h.runner);

        h.runner.queue_frame(frame(OpCode::PresenceUpdate, false));
        h.runner.queue_frame(frame(OpCode::PresenceUpdate, false));

        assert!(written.recv().await.is_some());
        assert!(written.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(written.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_frames_dropped_without_socket() {
        let mut h = harness("Bot token", GatewayConfig::default());
        h.runner.queue_frame(frame(OpCode::Heartbeat, true));
        assert_eq!(h.runner.metrics.heartbeats_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_dropped_after_socket_closes_is_not_counted() {
        let config = GatewayConfig {
            frame_bucket: BucketConfig {
                capacity: 1,
                window: Duration::from_secs(60),
                reserved: 0,
            },
            ..GatewayConfig::default()
        };
        let mut h = harness("Bot token", config);
        let mut written = attach_writer(&mut h.runner);

        h.runner.queue_frame(frame(OpCode::Identify, true));
        h.runner.queue_frame(frame(OpCode::Heartbeat, true));
        assert!(written.recv().await.is_some());
        assert_eq!(h.runner.metrics.identifies(), 1);

        // The heartbeat is still waiting for a token when the socket goes away
        drop(written);
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(h.runner.metrics.heartbeats_sent(), 0);
        assert_eq!(h.runner.frame_bucket.queued(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_is_reported() {
        let h = harness("", GatewayConfig::default());
        let mut events = h.emitter.subscribe();
        let mut scheduler = h.scheduler;
        let task = tokio::spawn(h.runner.run());

        h.commands.send(ShardCommand::Connect).await.unwrap();

        assert_eq!(scheduler.recv().await, Some(SchedulerEvent::ConnectFailed(1)));
        match events.recv().await.unwrap() {
            GatewayEvent::Error { shard_id, error } => {
                assert_eq!(shard_id, 1);
                assert_eq!(error.kind(), ErrorKind::Config);
            }
            other => panic!("unexpected event {:?}", other),
        }

        h.commands.send(ShardCommand::Shutdown).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unobserved_fatal_error_ends_runner() {
        let h = harness("", GatewayConfig::default());
        let task = tokio::spawn(h.runner.run());

        h.commands.send(ShardCommand::Connect).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::UnhandledEvent { shard_id: 1, .. })));
    }

    #[tokio::test]
    async fn test_presence_update_while_disconnected_is_stored() {
        let mut h = harness("Bot token", GatewayConfig::default());
        h.runner
            .handle_command(ShardCommand::UpdatePresence(Presence {
                status: Status::Idle,
                ..Presence::default()
            }))
            .unwrap();
        h.runner.apply_actions().unwrap();

        assert_eq!(h.runner.session.presence().status, Status::Idle);
        assert!(h.scheduler.try_recv().is_err());
    }

    #[test]
    fn test_scheduler_notices() {
        assert_eq!(
            scheduler_notice(&GatewayEvent::Hello {
                shard_id: 3,
                heartbeat_interval: 41250
            }),
            Some(SchedulerEvent::Connected(3))
        );
        assert_eq!(
            scheduler_notice(&GatewayEvent::Disconnect {
                shard_id: 3,
                error: None
            }),
            Some(SchedulerEvent::Disconnected(3))
        );
        assert_eq!(
            scheduler_notice(&GatewayEvent::Warn {
                shard_id: 3,
                message: String::new()
            }),
            None
        );
    }
}
