//! Global rate limit gate.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Default)]
struct GateState {
    blocked: bool,
    ready: VecDeque<oneshot::Sender<()>>,
}

/// Holds authenticated requests while a global rate limit is in force.
///
/// Waiters are released in FIFO order once the block clears; priority
/// waiters are placed at the front.
#[derive(Debug, Default)]
pub struct GlobalGate {
    state: Mutex<GateState>,
}

impl GlobalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a global block is in force.
    pub fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    /// Number of requests held by the block.
    pub fn waiting(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Wait until no global block is in force.
    pub async fn wait(&self, priority: bool) {
        let rx = {
            let mut state = self.state.lock();
            if !state.blocked {
                return;
            }
            let (tx, rx) = oneshot::channel();
            if priority {
                state.ready.push_front(tx);
            } else {
                state.ready.push_back(tx);
            }
            rx
        };
        // A dropped gate releases its waiters too
        let _ = rx.await;
    }

    /// Block for `delay`, then release every waiter.
    pub fn block(self: &Arc<Self>, delay: Duration) {
        self.state.lock().blocked = true;
        debug!(delay_ms = delay.as_millis() as u64, "Global rate limit hit");

        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(gate) = weak.upgrade() {
                gate.unblock();
            }
        });
    }

    /// Clear the block and release every waiter in order.
    pub fn unblock(&self) {
        let ready = {
            let mut state = self.state.lock();
            state.blocked = false;
            std::mem::take(&mut state.ready)
        };
        for waiter in ready {
            let _ = waiter.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_open_gate_does_not_wait() {
        let gate = GlobalGate::new();
        gate.wait(false).await;
        assert!(!gate.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_releases_after_delay() {
        let gate = Arc::new(GlobalGate::new());
        let start = Instant::now();

        gate.block(Duration::from_millis(1500));
        assert!(gate.is_blocked());

        gate.wait(false).await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert!(!gate.is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_waiter_released_first() {
        let gate = Arc::new(GlobalGate::new());
        gate.block(Duration::from_secs(1));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (name, priority) in [("a", false), ("b", false), ("c", true)] {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                gate.wait(priority).await;
                order.lock().push(name);
            }));
            // Let each task register before the next
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.waiting(), 3);

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["c", "a", "b"]);
    }
}
