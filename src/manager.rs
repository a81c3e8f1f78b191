use crate::config::{ConfigError, GatewayConfig};
use crate::connection::{SchedulerEvent, ShardCommand, ShardRunner};
use crate::error::Error;
use crate::events::{EventEmitter, GatewayEvent};
use crate::metrics::Metrics;
use crate::payload::{Presence, RequestGuildMembers};
use crate::session::{Reconnect, ShardSession};
use crate::shard::{self, ShardHandle, ShardSnapshot};
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Minimum spacing between identifies sharing a concurrency key
pub const IDENTIFY_WINDOW: Duration = Duration::from_millis(5000);

/// How often a non-empty connect queue is re-examined
pub const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Identify-concurrency admission control.
///
/// Shards are grouped by `id % concurrency`. A shard is held back while a
/// shard with the same key is still connecting, or, unless it can resume,
/// while its key was used within the last [`IDENTIFY_WINDOW`].
#[derive(Debug)]
pub struct ConnectQueue {
    concurrency: u32,
    queue: VecDeque<u32>,
    last_connect_by_key: HashMap<u32, Instant>,
    in_flight: BTreeSet<u32>,
}

impl ConnectQueue {
    /// Create an empty queue; a concurrency below 1 is treated as 1
    pub fn new(concurrency: u32) -> Self {
        Self {
            concurrency: concurrency.max(1),
            queue: VecDeque::new(),
            last_connect_by_key: HashMap::new(),
            in_flight: BTreeSet::new(),
        }
    }

    /// Concurrency key of a shard
    pub fn key(&self, id: u32) -> u32 {
        id % self.concurrency
    }

    /// Queue a shard; returns false if it is already queued
    pub fn enqueue(&mut self, id: u32) -> bool {
        if self.queue.contains(&id) {
            return false;
        }
        self.queue.push_back(id);
        true
    }

    /// Admit every queued shard whose key is free, in queue order.
    ///
    /// `resumable` reports whether a shard holds a session it can resume.
    /// Admitted shards count as connecting until [`connect_finished`].
    ///
    /// [`connect_finished`]: ConnectQueue::connect_finished
    pub fn try_connect(&mut self, now: Instant, resumable: impl Fn(u32) -> bool) -> Vec<u32> {
        let mut admitted = Vec::new();
        let mut held = VecDeque::with_capacity(self.queue.len());

        while let Some(id) = self.queue.pop_front() {
            let key = self.key(id);
            let recently_used = self
                .last_connect_by_key
                .get(&key)
                .is_some_and(|at| now.saturating_duration_since(*at) < IDENTIFY_WINDOW);
            let key_busy = self.in_flight.iter().any(|other| self.key(*other) == key);

            if key_busy || (recently_used && !resumable(id)) {
                held.push_back(id);
                continue;
            }

            self.in_flight.insert(id);
            self.last_connect_by_key.insert(key, now);
            admitted.push(id);
        }

        self.queue = held;
        admitted
    }

    /// The shard is no longer connecting (HELLO, failure or disconnect)
    pub fn connect_finished(&mut self, id: u32) {
        self.in_flight.remove(&id);
    }

    /// Stamp the shard's key on READY
    pub fn mark_ready(&mut self, id: u32, now: Instant) {
        let key = self.key(id);
        self.last_connect_by_key.insert(key, now);
    }

    /// Number of queued shards
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of shards currently connecting
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Default)]
struct ReadyState {
    ready: bool,
    start_time: Option<Instant>,
}

type ShardMap = Arc<RwLock<BTreeMap<u32, ShardHandle>>>;

/// Single writer for the connect queue and the readiness flag
struct Scheduler {
    queue: ConnectQueue,
    shards: ShardMap,
    state: Arc<RwLock<ReadyState>>,
    emitter: EventEmitter,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    requeue: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    async fn run(mut self) {
        let mut recheck: Option<Instant> = None;

        loop {
            let event = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = wait_recheck(recheck) => None,
            };

            match event {
                Some(event) => self.handle(event),
                None => recheck = None,
            }

            self.try_connect().await;

            if self.queue.is_empty() {
                recheck = None;
            } else if recheck.is_none() {
                recheck = Some(Instant::now() + RECHECK_INTERVAL);
            }
        }

        debug!("Scheduler stopped");
    }

    fn handle(&mut self, event: SchedulerEvent) {
        trace!("Scheduler event {:?}", event);
        match event {
            SchedulerEvent::Enqueue(id) => {
                self.queue.enqueue(id);
            }
            SchedulerEvent::Connected(id) | SchedulerEvent::ConnectFailed(id) => {
                self.queue.connect_finished(id);
            }
            SchedulerEvent::Ready(id) => {
                self.queue.mark_ready(id, Instant::now());
                self.on_shard_ready();
            }
            SchedulerEvent::Resumed(_) => self.on_shard_ready(),
            SchedulerEvent::Disconnected(id) => {
                self.queue.connect_finished(id);
                self.on_shard_disconnect();
            }
            SchedulerEvent::Requeue { id, delay } if delay.is_zero() => {
                self.queue.enqueue(id);
            }
            SchedulerEvent::Requeue { id, delay } => {
                let requeue = self.requeue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(SchedulerEvent::Enqueue(id));
                });
            }
        }
    }

    async fn try_connect(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let admitted = {
            let shards = self.shards.read();
            self.queue.try_connect(Instant::now(), |id| {
                shards.get(&id).is_some_and(|s| s.is_resumable())
            })
        };

        for id in admitted {
            let handle = self.shards.read().get(&id).cloned();
            let sent = match handle {
                Some(handle) => {
                    debug!("[SHARD-{}] Admitted to connect", id);
                    handle.send(ShardCommand::Connect).await
                }
                None => Err(Error::UnknownShard(id)),
            };
            if let Err(e) = sent {
                warn!("[SHARD-{}] Failed to start connect: {}", id, e);
                self.queue.connect_finished(id);
            }
        }
    }

    fn on_shard_ready(&mut self) {
        if self.state.read().ready {
            return;
        }

        let all_ready = {
            let shards = self.shards.read();
            !shards.is_empty() && shard::find(&shards, |s| !s.is_ready()).is_none()
        };
        if !all_ready {
            return;
        }

        {
            let mut state = self.state.write();
            state.ready = true;
            state.start_time = Some(Instant::now());
        }
        info!("All shards ready");
        if let Err(e) = self.emitter.emit(GatewayEvent::AllReady) {
            warn!("Failed to emit AllReady: {}", e);
        }
    }

    fn on_shard_disconnect(&mut self) {
        if !self.state.read().ready {
            return;
        }

        let none_ready = shard::find(&self.shards.read(), |s| s.is_ready()).is_none();
        if none_ready {
            self.state.write().ready = false;
            info!("No shards ready");
        }
    }
}

async fn wait_recheck(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Owns the shards of this process and admits their connects.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by `parking_lot::RwLock`
/// which does not poison on panic.
pub struct ShardManager {
    token: String,
    gateway_url: String,
    shard_count: u32,
    concurrency: u32,
    config: GatewayConfig,
    emitter: EventEmitter,
    metrics: Arc<Metrics>,
    shards: ShardMap,
    /// Shard task handles indexed by shard ID
    shard_tasks: RwLock<BTreeMap<u32, JoinHandle<Result<(), Error>>>>,
    state: Arc<RwLock<ReadyState>>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    scheduler: JoinHandle<()>,
    /// Serializes shutdown against itself.
    /// This is a tokio::Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
}

impl ShardManager {
    /// Create a manager and start its scheduler task.
    ///
    /// Must be called from within a Tokio runtime. `concurrency` is the
    /// resolved identify concurrency (values below 1 are treated as 1).
    pub fn new(
        token: impl Into<String>,
        gateway_url: impl Into<String>,
        shard_count: u32,
        concurrency: u32,
        config: GatewayConfig,
        emitter: EventEmitter,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shards: ShardMap = Arc::new(RwLock::new(BTreeMap::new()));
        let state = Arc::new(RwLock::new(ReadyState::default()));

        let scheduler = Scheduler {
            queue: ConnectQueue::new(concurrency),
            shards: Arc::clone(&shards),
            state: Arc::clone(&state),
            emitter: emitter.clone(),
            events: events_rx,
            requeue: events.clone(),
        };
        let scheduler = tokio::spawn(scheduler.run());

        Self {
            token: token.into(),
            gateway_url: gateway_url.into(),
            shard_count: shard_count.max(1),
            concurrency: concurrency.max(1),
            config,
            emitter,
            metrics,
            shards,
            shard_tasks: RwLock::new(BTreeMap::new()),
            state,
            events,
            scheduler,
            lifecycle_lock: Mutex::new(()),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe to gateway events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.emitter.subscribe()
    }

    /// Total shards across all processes
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Resolved identify concurrency
    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    /// Create the shard if needed and queue its connect.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is not below the shard count or if the
    /// scheduler has stopped.
    pub fn spawn(&self, id: u32) -> Result<(), Error> {
        if id >= self.shard_count {
            return Err(Error::Config(ConfigError::InvalidShards(format!(
                "shard {} is outside shard_count {}",
                id, self.shard_count
            ))));
        }

        {
            let mut shards = self.shards.write();
            if !shards.contains_key(&id) {
                self.create_shard(id, &mut shards);
            }
        }

        self.enqueue(id)
    }

    fn create_shard(&self, id: u32, shards: &mut BTreeMap<u32, ShardHandle>) {
        let (tx, rx) = mpsc::channel::<ShardCommand>(DEFAULT_CHANNEL_SIZE);
        let snapshot = Arc::new(RwLock::new(ShardSnapshot::new(id)));

        debug!("[SHARD-{}] Creating shard {}/{}", id, id, self.shard_count);

        let session = ShardSession::new(
            id,
            self.shard_count,
            self.token.clone(),
            self.gateway_url.clone(),
            self.config.clone(),
        );
        let runner = ShardRunner::new(
            session,
            self.config.clone(),
            self.emitter.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&snapshot),
            rx,
            self.events.clone(),
        );

        // Spawn shard task with panic recovery
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(async move { Self::run_shard_with_recovery(id, runner, metrics).await });

        shards.insert(id, ShardHandle::new(id, tx, snapshot));
        self.shard_tasks.write().insert(id, task);

        // Initialize metrics
        self.metrics.update_shard(id, |s| {
            s.is_connected = false;
            s.is_ready = false;
        });
    }

    /// Run a shard with panic recovery
    async fn run_shard_with_recovery(
        shard_id: u32,
        runner: ShardRunner,
        metrics: Arc<Metrics>,
    ) -> Result<(), Error> {
        match AssertUnwindSafe(runner.run()).catch_unwind().await {
            Ok(Ok(())) => {
                debug!("[SHARD-{}] Shard task completed normally", shard_id);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("[SHARD-{}] Shard task ended with error: {}", shard_id, e);
                Err(e)
            }
            Err(panic_err) => {
                // Extract panic message if possible
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(
                    "[SHARD-{}] Shard task PANICKED: {}. Shard is now dead.",
                    shard_id, panic_msg
                );
                metrics.record_error();
                Err(Error::ConnectionFailed(format!(
                    "Shard {} task panicked: {}",
                    shard_id, panic_msg
                )))
            }
        }
    }

    /// Queue an existing shard for (re)connection
    pub fn connect(&self, id: u32) -> Result<(), Error> {
        if !self.shards.read().contains_key(&id) {
            return Err(Error::UnknownShard(id));
        }
        self.enqueue(id)
    }

    fn enqueue(&self, id: u32) -> Result<(), Error> {
        self.events
            .send(SchedulerEvent::Enqueue(id))
            .map_err(|_| Error::ShuttingDown)
    }

    fn handle(&self, id: u32) -> Result<ShardHandle, Error> {
        self.shards
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownShard(id))
    }

    fn handles(&self) -> Vec<ShardHandle> {
        self.shards.read().values().cloned().collect()
    }

    /// Disconnect one shard
    pub async fn disconnect(&self, id: u32, reconnect: Reconnect) -> Result<(), Error> {
        self.handle(id)?
            .send(ShardCommand::Disconnect(reconnect))
            .await
    }

    /// Disconnect every shard
    pub async fn disconnect_all(&self, reconnect: Reconnect) {
        for handle in self.handles() {
            if let Err(e) = handle.send(ShardCommand::Disconnect(reconnect)).await {
                warn!("[SHARD-{}] Failed to send disconnect: {}", handle.id, e);
            }
        }
    }

    /// Update the presence of every shard
    pub async fn update_presence(&self, presence: Presence) {
        for handle in self.handles() {
            if let Err(e) = handle
                .send(ShardCommand::UpdatePresence(presence.clone()))
                .await
            {
                warn!("[SHARD-{}] Failed to send presence: {}", handle.id, e);
            }
        }
    }

    /// Update the presence of one shard
    pub async fn update_shard_presence(&self, id: u32, presence: Presence) -> Result<(), Error> {
        self.handle(id)?
            .send(ShardCommand::UpdatePresence(presence))
            .await
    }

    /// Shard that receives events for a guild
    pub fn shard_for_guild(&self, guild_id: u64) -> u32 {
        ((guild_id >> 22) % u64::from(self.shard_count)) as u32
    }

    /// Ask the guild's shard for member chunks
    pub async fn request_guild_members(&self, request: RequestGuildMembers) -> Result<(), Error> {
        let guild_id = request
            .guild_id
            .parse::<u64>()
            .map_err(|_| Error::InvalidSnowflake(request.guild_id.clone()))?;
        let id = self.shard_for_guild(guild_id);
        self.handle(id)?
            .send(ShardCommand::RequestGuildMembers(request))
            .await
    }

    /// Whether every shard is ready
    pub fn ready(&self) -> bool {
        self.state.read().ready
    }

    /// When the process last became ready
    pub fn start_time(&self) -> Option<Instant> {
        self.state.read().start_time
    }

    /// IDs of the shards owned by this manager
    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.read().keys().copied().collect()
    }

    /// Number of shards owned by this manager
    pub fn len(&self) -> usize {
        self.shards.read().len()
    }

    /// Whether no shard has been spawned
    pub fn is_empty(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Snapshot of one shard
    pub fn snapshot(&self, id: u32) -> Option<ShardSnapshot> {
        self.shards.read().get(&id).map(ShardHandle::snapshot)
    }

    /// Snapshots of all shards in ID order
    pub fn snapshots(&self) -> Vec<ShardSnapshot> {
        self.shards.read().values().map(ShardHandle::snapshot).collect()
    }

    /// Snapshot of the lowest shard
    pub fn first(&self) -> Option<ShardSnapshot> {
        shard::first(&self.shards.read()).map(ShardHandle::snapshot)
    }

    /// Snapshot of the highest shard
    pub fn last(&self) -> Option<ShardSnapshot> {
        shard::last(&self.shards.read()).map(ShardHandle::snapshot)
    }

    /// Snapshot of the first shard matching `predicate`
    pub fn find(&self, mut predicate: impl FnMut(&ShardSnapshot) -> bool) -> Option<ShardSnapshot> {
        let shards = self.shards.read();
        shard::find(&shards, |s| predicate(&s.snapshot())).map(ShardHandle::snapshot)
    }

    /// Snapshot of a random shard
    pub fn random(&self) -> Option<ShardSnapshot> {
        shard::random(&self.shards.read()).map(ShardHandle::snapshot)
    }

    /// Wait for every shard task to end.
    ///
    /// Returns the first error a shard ended with, typically a fatal
    /// event nobody was subscribed to.
    pub async fn wait(&self) -> Result<(), Error> {
        let tasks: Vec<_> = std::mem::take(&mut *self.shard_tasks.write())
            .into_iter()
            .map(|(id, task)| async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => Err(Error::ConnectionFailed(format!(
                        "Shard {} task panicked: {}",
                        id, e
                    ))),
                }
            })
            .collect();

        futures_util::future::try_join_all(tasks).await.map(|_| ())
    }

    /// Disconnect all shards for good and wait for their tasks.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        info!("Stopping ShardManager");

        for handle in self.handles() {
            if let Err(e) = handle.send(ShardCommand::Shutdown).await {
                warn!("[SHARD-{}] Failed to send shutdown: {}", handle.id, e);
            }
        }

        let result = self.wait().await;

        self.shards.write().clear();
        self.scheduler.abort();
        {
            let mut state = self.state.write();
            state.ready = false;
        }

        info!("ShardManager stopped");
        result
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        // Abort all shard handles to prevent orphaned tasks
        self.scheduler.abort();
        let handles = std::mem::take(&mut *self.shard_tasks.write());
        for (_shard_id, handle) in handles {
            handle.abort();
        }
    }
}
