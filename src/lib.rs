//! # shardwire
//!
//! Sharded gateway client and rate-limited REST dispatcher for a real-time
//! chat platform.
//!
//! ## Features
//!
//! - **Sharding** with identify-concurrency admission control
//! - **Resume and reconnect** driven by the close-code table, with exponential backoff
//! - **Outbound pacing** through per-shard token buckets
//! - **REST rate limiting** per canonical route, with global-limit handling and 429/502 retries
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use shardwire::{Client, ClientConfig, GatewayEvent};
//!
//! let config = ClientConfig::builder("Bot token").intents(513).build()?;
//! let client = Client::new(config)?;
//! let mut events = client.subscribe();
//! client.connect().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let GatewayEvent::Dispatch { name, .. } = event {
//!         println!("{name}");
//!     }
//! }
//! ```

mod bucket;
mod client;
mod close;
mod config;
mod connection;
mod error;
mod events;
mod health;
mod manager;
mod metrics;
mod payload;
pub mod rest;
mod session;
mod shard;
pub mod snowflake;

pub use bucket::{BucketPermit, SequentialBucket, TokenBucket};
pub use client::{Client, ShardPlan};
pub use close::{CloseAction, CloseCode};
pub use config::{
    BackoffConfig, BucketConfig, ClientConfig, ClientConfigBuilder, Concurrency, ConfigError,
    GatewayConfig, RestConfig, ShardCount, GATEWAY_VERSION,
};
pub use error::{
    ApiError, Error, ErrorKind, FieldError, GatewayCloseError, HttpError, TimeoutKind,
};
pub use events::{EventEmitter, GatewayEvent};
pub use health::HeartbeatMonitor;
pub use manager::{ConnectQueue, ShardManager, IDENTIFY_WINDOW, RECHECK_INTERVAL};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use payload::{
    Activity, GatewayPayload, Hello, Identify, IdentifyProperties, OpCode, Presence, Ready,
    RequestGuildMembers, Resume, Status,
};
pub use session::{
    OutboundFrame, Reconnect, SessionAction, ShardSession, ShardStatus, RESUME_CLOSE_CODE,
};
pub use shard::{ShardHandle, ShardSnapshot};

/// Result type for shardwire operations
pub type Result<T> = std::result::Result<T, Error>;
