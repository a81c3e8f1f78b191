use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Metrics for observability
///
/// Counters cover both the gateway shards and the REST dispatcher. Use
/// `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = client.metrics();
///
/// println!("Frames received: {}", metrics.frames_received());
/// println!("429s: {}", metrics.rate_limited());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Gateway counters
    connections_total: AtomicU64,
    reconnections_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    identifies_total: AtomicU64,
    resumes_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    errors_total: AtomicU64,

    // REST counters
    rest_requests_total: AtomicU64,
    rate_limited_total: AtomicU64,
    bad_gateway_retries_total: AtomicU64,
    global_blocks_total: AtomicU64,

    /// Per-shard metrics keyed by shard ID
    shard_metrics: RwLock<BTreeMap<u32, ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u32,
    /// Whether the socket is open
    pub is_connected: bool,
    /// Whether READY or RESUMED arrived on the current socket
    pub is_ready: bool,
    /// Heartbeat round trip (None if unknown)
    pub latency: Option<Duration>,
    /// Last sequence number received
    pub sequence: u64,
    /// Connect attempts since the last READY/RESUMED
    pub connect_attempts: u32,
    /// Duration since last successful connection (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Duration since last frame received (None if no frames)
    pub time_since_last_frame: Option<Duration>,
    /// Total uptime for this shard
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
    #[doc(hidden)]
    pub(crate) last_frame_at: Option<Instant>,
}

impl ShardMetrics {
    fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            is_connected: false,
            is_ready: false,
            latency: None,
            sequence: 0,
            connect_attempts: 0,
            time_since_connected: None,
            time_since_last_frame: None,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
            last_frame_at: None,
        }
    }

    /// Create a snapshot with computed durations
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            time_since_last_frame: self.last_frame_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total sockets opened
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnections requested
    pub fn reconnections(&self) -> u64 {
        self.reconnections_total.load(Ordering::Relaxed)
    }

    /// Get total gateway frames received
    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    /// Get total gateway frames written
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats written
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeat acknowledgements received
    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Get total IDENTIFY frames written
    pub fn identifies(&self) -> u64 {
        self.identifies_total.load(Ordering::Relaxed)
    }

    /// Get total RESUME frames written
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Get total INVALID_SESSION frames received
    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Get total errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total REST requests sent, retries included
    pub fn rest_requests(&self) -> u64 {
        self.rest_requests_total.load(Ordering::Relaxed)
    }

    /// Get total 429 responses
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited_total.load(Ordering::Relaxed)
    }

    /// Get total retries after 502
    pub fn bad_gateway_retries(&self) -> u64 {
        self.bad_gateway_retries_total.load(Ordering::Relaxed)
    }

    /// Get total global rate limit blocks
    pub fn global_blocks(&self) -> u64 {
        self.global_blocks_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnection(&self) {
        self.reconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_identify(&self) {
        self.identifies_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rest_request(&self) {
        self.rest_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bad_gateway_retry(&self) {
        self.bad_gateway_retries_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_global_block(&self) {
        self.global_blocks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u32, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();
        let entry = shards
            .entry(shard_id)
            .or_insert_with(|| ShardMetrics::new(shard_id));
        update_fn(entry);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().values().map(|s| s.snapshot()).collect()
    }

    /// Get current open socket count
    pub fn active_connections(&self) -> usize {
        self.shard_metrics
            .read()
            .values()
            .filter(|s| s.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        // Take the shard lock once to ensure consistency
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.values().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnections_total: self.reconnections_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            identifies_total: self.identifies_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            rest_requests_total: self.rest_requests_total.load(Ordering::Acquire),
            rate_limited_total: self.rate_limited_total.load(Ordering::Acquire),
            bad_gateway_retries_total: self.bad_gateway_retries_total.load(Ordering::Acquire),
            global_blocks_total: self.global_blocks_total.load(Ordering::Acquire),
            active_connections: shard_snapshots.iter().filter(|s| s.is_connected).count(),
            ready_shards: shard_snapshots.iter().filter(|s| s.is_ready).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnections_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub identifies_total: u64,
    pub resumes_total: u64,
    pub invalid_sessions_total: u64,
    pub errors_total: u64,
    pub rest_requests_total: u64,
    pub rate_limited_total: u64,
    pub bad_gateway_retries_total: u64,
    pub global_blocks_total: u64,
    pub active_connections: usize,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnection();
        metrics.record_rate_limited();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnections(), 1);
        assert_eq!(metrics.rate_limited(), 1);
    }

    #[test]
    fn test_shard_metrics_keyed_by_id() {
        let metrics = Metrics::new();

        metrics.update_shard(4, |s| {
            s.is_connected = true;
            s.is_ready = true;
        });
        metrics.update_shard(7, |s| {
            s.is_connected = true;
        });

        assert_eq!(metrics.active_connections(), 2);
        let ids: Vec<u32> = metrics.shard_metrics().iter().map(|s| s.shard_id).collect();
        assert_eq!(ids, vec![4, 7]);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_identify();
        metrics.record_heartbeat();
        metrics.record_heartbeat();
        metrics.update_shard(0, |s| {
            s.is_connected = true;
            s.is_ready = true;
            s.sequence = 42;
        });

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.identifies_total, 1);
        assert_eq!(snapshot.heartbeats_sent_total, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.ready_shards, 1);
        assert_eq!(snapshot.shards[0].sequence, 42);
    }

    #[test]
    fn test_individual_getters() {
        let metrics = Metrics::new();

        metrics.record_frame_received();
        metrics.record_frame_received();
        metrics.record_error();
        metrics.record_global_block();

        assert_eq!(metrics.frames_received(), 2);
        assert_eq!(metrics.errors(), 1);
        assert_eq!(metrics.global_blocks(), 1);
        assert_eq!(metrics.frames_sent(), 0);
    }
}
