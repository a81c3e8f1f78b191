use tokio::time::{Duration, Instant};

/// Tracks heartbeat state for a single gateway connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Interval announced by HELLO
    interval: Option<Duration>,

    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Time of last acknowledgement received
    last_received: Option<Instant>,

    /// Whether the previous heartbeat was acknowledged
    acked: bool,

    /// Round trip of the last acknowledged heartbeat, `None` when unknown
    latency: Option<Duration>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor
    pub fn new() -> Self {
        Self {
            interval: None,
            last_sent: None,
            last_received: None,
            acked: true,
            latency: None,
        }
    }

    /// Record the interval from HELLO
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    /// Heartbeat interval, if HELLO has been received
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Mark that the next acknowledgement is required before another
    /// periodic heartbeat may be sent
    pub fn expect_ack(&mut self) {
        self.acked = false;
    }

    /// Record that we sent a heartbeat
    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// Record that we received HEARTBEAT_ACK
    pub fn record_ack(&mut self) {
        let now = Instant::now();
        self.acked = true;
        self.last_received = Some(now);
        // Without a send time the latency is unknown
        self.latency = self.last_sent.map(|sent| now.duration_since(sent));
    }

    /// Whether the previous heartbeat was acknowledged
    pub fn is_acked(&self) -> bool {
        self.acked
    }

    /// Last measured latency, `None` when unknown
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Time of last heartbeat sent
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Time of last acknowledgement
    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    /// Clear per-connection bookkeeping. The latency survives so callers
    /// still see the last measurement while reconnecting.
    pub fn reset(&mut self) {
        self.interval = None;
        self.last_sent = None;
        self.last_received = None;
        self.acked = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let monitor = HeartbeatMonitor::new();
        assert!(monitor.is_acked());
        assert!(monitor.latency().is_none());
        assert!(monitor.interval().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ack_cycle() {
        let mut monitor = HeartbeatMonitor::new();

        monitor.expect_ack();
        monitor.record_sent();
        assert!(!monitor.is_acked());

        tokio::time::advance(Duration::from_millis(42)).await;
        monitor.record_ack();

        assert!(monitor.is_acked());
        assert_eq!(monitor.latency(), Some(Duration::from_millis(42)));
    }

    #[test]
    fn test_ack_without_send_is_unknown_latency() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.record_ack();
        assert!(monitor.latency().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_keeps_latency() {
        let mut monitor = HeartbeatMonitor::new();
        monitor.set_interval(Duration::from_millis(41_250));
        monitor.record_sent();
        tokio::time::advance(Duration::from_millis(10)).await;
        monitor.record_ack();
        monitor.expect_ack();

        monitor.reset();

        assert!(monitor.is_acked());
        assert!(monitor.last_sent().is_none());
        assert!(monitor.interval().is_none());
        assert_eq!(monitor.latency(), Some(Duration::from_millis(10)));
    }
}
