//! Observable gateway events.
//!
//! Events fan out over a broadcast channel. A fatal [`GatewayEvent::Error`]
//! emitted while nobody is subscribed is returned to the emitter as
//! [`Error::UnhandledEvent`] instead of being dropped.

use crate::error::Error;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Something a shard or the manager wants observers to know about
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Socket opened, handshake in progress
    Connect { shard_id: u32 },
    /// HELLO received
    Hello { shard_id: u32, heartbeat_interval: u64 },
    /// READY received, new session established
    Ready { shard_id: u32 },
    /// RESUMED received, previous session continued
    Resumed { shard_id: u32 },
    /// Socket is gone
    Disconnect {
        shard_id: u32,
        error: Option<Arc<Error>>,
    },
    /// Dispatch event (everything but READY and RESUMED)
    Dispatch {
        shard_id: u32,
        name: String,
        sequence: Option<u64>,
        data: Value,
    },
    /// Opcode this crate does not handle
    Unknown { shard_id: u32, op: u8, data: Value },
    /// Non-fatal anomaly
    Warn { shard_id: u32, message: String },
    /// Error raised by a shard
    Error { shard_id: u32, error: Arc<Error> },
    /// Every shard owned by the manager is ready
    AllReady,
}

impl GatewayEvent {
    /// Shard the event belongs to, `None` for process-wide events
    pub fn shard_id(&self) -> Option<u32> {
        match self {
            GatewayEvent::Connect { shard_id }
            | GatewayEvent::Hello { shard_id, .. }
            | GatewayEvent::Ready { shard_id }
            | GatewayEvent::Resumed { shard_id }
            | GatewayEvent::Disconnect { shard_id, .. }
            | GatewayEvent::Dispatch { shard_id, .. }
            | GatewayEvent::Unknown { shard_id, .. }
            | GatewayEvent::Warn { shard_id, .. }
            | GatewayEvent::Error { shard_id, .. } => Some(*shard_id),
            GatewayEvent::AllReady => None,
        }
    }

    /// Whether an unobserved emission must be raised
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayEvent::Error { error, .. } if error.is_fatal())
    }
}

/// Fan-out of [`GatewayEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventEmitter {
    /// Create an emitter buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver an event.
    ///
    /// Fails only for a fatal event nobody is listening to.
    pub fn emit(&self, event: GatewayEvent) -> Result<(), Error> {
        if self.tx.receiver_count() == 0 {
            if let GatewayEvent::Error { shard_id, error } = &event {
                if error.is_fatal() {
                    return Err(Error::UnhandledEvent {
                        shard_id: *shard_id,
                        message: error.to_string(),
                    });
                }
            }
            trace!("Dropping {:?} with no listeners", event);
            return Ok(());
        }

        // Receivers may drop between the check and the send
        let _ = self.tx.send(event);
        Ok(())
    }
}
