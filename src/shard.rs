use crate::connection::ShardCommand;
use crate::error::Error;
use crate::session::ShardStatus;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Point-in-time view of a shard, refreshed by its runner after every event
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSnapshot {
    /// Shard identifier
    pub id: u32,
    /// Connection status
    pub status: ShardStatus,
    /// READY or RESUMED arrived on the current socket
    pub ready: bool,
    /// Socket has not reached HELLO yet
    pub connecting: bool,
    /// A session exists that RESUME could continue
    pub resumable: bool,
    /// Last sequence number received
    pub sequence: u64,
    /// Heartbeat round trip (None if unknown)
    pub latency: Option<Duration>,
    /// Connect attempts since the last READY/RESUMED
    pub connect_attempts: u32,
}

impl ShardSnapshot {
    /// Snapshot of a shard that never connected
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: ShardStatus::Disconnected,
            ready: false,
            connecting: false,
            resumable: false,
            sequence: 0,
            latency: None,
            connect_attempts: 0,
        }
    }
}

/// The manager's handle on a running shard
#[derive(Debug, Clone)]
pub struct ShardHandle {
    /// Shard identifier
    pub id: u32,
    /// Command sender for this shard's runner
    pub(crate) commands: mpsc::Sender<ShardCommand>,
    pub(crate) snapshot: Arc<RwLock<ShardSnapshot>>,
}

impl ShardHandle {
    pub(crate) fn new(
        id: u32,
        commands: mpsc::Sender<ShardCommand>,
        snapshot: Arc<RwLock<ShardSnapshot>>,
    ) -> Self {
        Self {
            id,
            commands,
            snapshot,
        }
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> ShardSnapshot {
        self.snapshot.read().clone()
    }

    /// Whether READY or RESUMED arrived on the current socket
    pub fn is_ready(&self) -> bool {
        self.snapshot.read().ready
    }

    /// Whether a session exists that RESUME could continue
    pub fn is_resumable(&self) -> bool {
        self.snapshot.read().resumable
    }

    pub(crate) async fn send(&self, command: ShardCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|e| Error::ChannelSend(format!("shard {}: {}", self.id, e)))
    }
}

/// Shard with the lowest ID
pub fn first<V>(shards: &BTreeMap<u32, V>) -> Option<&V> {
    shards.values().next()
}

/// Shard with the highest ID
pub fn last<V>(shards: &BTreeMap<u32, V>) -> Option<&V> {
    shards.values().next_back()
}

/// First shard in ID order matching `predicate`
pub fn find<V>(shards: &BTreeMap<u32, V>, mut predicate: impl FnMut(&V) -> bool) -> Option<&V> {
    shards.values().find(|shard| predicate(shard))
}

/// Uniformly random shard
pub fn random<V>(shards: &BTreeMap<u32, V>) -> Option<&V> {
    shards.values().choose(&mut rand::thread_rng())
}
