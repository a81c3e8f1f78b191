//! Paced execution queues.
//!
//! [`TokenBucket`] refills a fixed number of tokens every window and is
//! used to pace outbound gateway frames. [`SequentialBucket`] admits one
//! unit of work at a time against a limit the caller learns from the
//! server, and backs each REST route.

use crate::config::BucketConfig;
use crate::error::Error;
use crate::rest::latency::LatencyRef;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::{sleep, sleep_until, Duration, Instant};

type Action = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    action: Action,
    priority: bool,
}

struct TokenState {
    config: BucketConfig,
    used: u32,
    last_reset: Instant,
    queue: VecDeque<Queued>,
    timer_armed: bool,
}

/// Fixed-capacity bucket that refills every window.
///
/// Non-priority actions may use `capacity - reserved` tokens per window,
/// priority actions may use all of them.
#[derive(Clone)]
pub struct TokenBucket {
    shared: Arc<Mutex<TokenState>>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TokenBucket")
            .field("config", &state.config)
            .field("used", &state.used)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl TokenBucket {
    /// Create an empty bucket.
    pub fn new(config: BucketConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(TokenState {
                config,
                used: 0,
                last_reset: Instant::now(),
                queue: VecDeque::new(),
                timer_armed: false,
            })),
        }
    }

    /// Queue an action; it runs once a token is available.
    ///
    /// Priority actions jump to the front of the queue.
    pub fn enqueue<F>(&self, action: F, priority: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            let item = Queued {
                action: Box::new(action),
                priority,
            };
            if priority {
                state.queue.push_front(item);
            } else {
                state.queue.push_back(item);
            }
        }
        check_tokens(&self.shared);
    }

    /// Wait for a token.
    pub async fn acquire(&self, priority: bool) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            move || {
                let _ = tx.send(());
            },
            priority,
        );
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Tokens left for non-priority actions in the current window.
    pub fn remaining(&self) -> u32 {
        let state = self.shared.lock();
        let available = state.config.capacity - state.config.reserved;
        if state.last_reset.elapsed() >= state.config.window {
            available
        } else {
            available.saturating_sub(state.used)
        }
    }

    /// Number of actions waiting for a token.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

fn check_tokens(shared: &Arc<Mutex<TokenState>>) {
    let ready = {
        let mut state = shared.lock();
        if state.queue.is_empty() {
            return;
        }

        let now = Instant::now();
        if now.duration_since(state.last_reset) >= state.config.window {
            state.last_reset = now;
            state.used = 0;
        }

        let mut ready = Vec::new();
        loop {
            let allowed = match state.queue.front() {
                None => break,
                Some(item) if item.priority => state.config.capacity,
                Some(_) => state.config.capacity - state.config.reserved,
            };
            if state.used >= allowed {
                break;
            }
            if let Some(item) = state.queue.pop_front() {
                state.used += 1;
                ready.push(item.action);
            }
        }

        if !state.queue.is_empty() && !state.timer_armed {
            state.timer_armed = true;
            let delay = state
                .config
                .window
                .saturating_sub(now.duration_since(state.last_reset));
            let weak = Arc::downgrade(shared);
            tokio::spawn(async move {
                sleep(delay).await;
                if let Some(shared) = weak.upgrade() {
                    shared.lock().timer_armed = false;
                    check_tokens(&shared);
                }
            });
        }

        ready
    };

    // Run outside the lock so an action may enqueue again
    for action in ready {
        action();
    }
}

struct SequentialState {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    busy: bool,
    waiters: VecDeque<oneshot::Sender<BucketPermit>>,
}

struct SequentialShared {
    state: Mutex<SequentialState>,
    latency: Arc<LatencyRef>,
}

/// One-at-a-time bucket driven by server-reported limits.
///
/// A waiter is admitted once the bucket is idle and either `remaining > 0`
/// or the reset time has passed, in which case `remaining` returns to
/// `limit`. The admitted waiter holds a [`BucketPermit`] and reports the
/// new limits through it; dropping the permit admits the next waiter.
#[derive(Clone)]
pub struct SequentialBucket {
    shared: Arc<SequentialShared>,
}

impl std::fmt::Debug for SequentialBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SequentialBucket")
            .field("limit", &state.limit)
            .field("remaining", &state.remaining)
            .field("reset_at", &state.reset_at)
            .field("busy", &state.busy)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl SequentialBucket {
    /// Create an idle bucket with `remaining == limit`.
    pub fn new(limit: u32, latency: Arc<LatencyRef>) -> Self {
        let limit = limit.max(1);
        Self {
            shared: Arc::new(SequentialShared {
                state: Mutex::new(SequentialState {
                    limit,
                    remaining: limit,
                    reset_at: None,
                    busy: false,
                    waiters: VecDeque::new(),
                }),
                latency,
            }),
        }
    }

    /// Wait for the exclusive permit.
    pub async fn acquire(&self, priority: bool) -> Result<BucketPermit, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if priority {
                state.waiters.push_front(tx);
            } else {
                state.waiters.push_back(tx);
            }
        }
        check_sequential(&self.shared);
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Run `action` while holding the permit.
    pub async fn enqueue<F, Fut>(&self, action: F, priority: bool) -> Result<Fut::Output, Error>
    where
        F: FnOnce(BucketPermit) -> Fut,
        Fut: Future,
    {
        let permit = self.acquire(priority).await?;
        Ok(action(permit).await)
    }

    /// Last limit reported by the server.
    pub fn limit(&self) -> u32 {
        self.shared.state.lock().limit
    }

    /// Requests left before the reset.
    pub fn remaining(&self) -> u32 {
        self.shared.state.lock().remaining
    }

    /// When the server resets this bucket.
    pub fn reset_at(&self) -> Option<Instant> {
        self.shared.state.lock().reset_at
    }

    /// Number of callers waiting for the permit.
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiters.len()
    }
}

fn check_sequential(shared: &Arc<SequentialShared>) {
    let (waiter, permit) = {
        let mut state = shared.state.lock();
        if state.busy {
            return;
        }

        while state.waiters.front().is_some_and(|w| w.is_closed()) {
            state.waiters.pop_front();
        }
        if state.waiters.is_empty() {
            return;
        }

        let now = Instant::now();
        let offset = shared.latency.latency();
        let expired = state.reset_at.map_or(true, |reset| reset + offset < now);
        if expired {
            state.reset_at = None;
            state.remaining = state.limit;
        }

        if state.remaining == 0 {
            if let Some(reset) = state.reset_at {
                state.busy = true;
                let deadline = reset + offset + Duration::from_millis(1);
                let weak: Weak<SequentialShared> = Arc::downgrade(shared);
                tokio::spawn(async move {
                    sleep_until(deadline).await;
                    if let Some(shared) = weak.upgrade() {
                        shared.state.lock().busy = false;
                        check_sequential(&shared);
                    }
                });
            }
            return;
        }

        let Some(waiter) = state.waiters.pop_front() else {
            return;
        };
        state.remaining -= 1;
        state.busy = true;
        (
            waiter,
            BucketPermit {
                shared: Arc::clone(shared),
            },
        )
    };

    // A waiter that went away hands the permit straight back via Drop
    let _ = waiter.send(permit);
}

/// Exclusive access to a [`SequentialBucket`].
pub struct BucketPermit {
    shared: Arc<SequentialShared>,
}

impl std::fmt::Debug for BucketPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketPermit").finish_non_exhaustive()
    }
}

impl BucketPermit {
    /// Record the server-reported limit.
    pub fn set_limit(&self, limit: u32) {
        self.shared.state.lock().limit = limit.max(1);
    }

    /// Record the server-reported remaining count.
    pub fn set_remaining(&self, remaining: u32) {
        self.shared.state.lock().remaining = remaining;
    }

    /// Record when the server resets the bucket.
    pub fn set_reset_at(&self, reset_at: Instant) {
        self.shared.state.lock().reset_at = Some(reset_at);
    }

    /// Current limit.
    pub fn limit(&self) -> u32 {
        self.shared.state.lock().limit
    }

    /// Take one more request from the bucket without giving up the permit.
    ///
    /// When the window is exhausted this sleeps past the reset and refills
    /// first, the same wait a queued caller would see.
    pub async fn wait_reset(&self) {
        loop {
            let deadline = {
                let mut state = self.shared.state.lock();
                let offset = self.shared.latency.latency();
                let expired = state
                    .reset_at
                    .map_or(true, |reset| reset + offset < Instant::now());
                if expired {
                    state.reset_at = None;
                    state.remaining = state.limit;
                }
                match state.reset_at {
                    Some(reset) if state.remaining == 0 => {
                        reset + offset + Duration::from_millis(1)
                    }
                    _ => {
                        state.remaining = state.remaining.saturating_sub(1);
                        return;
                    }
                }
            };
            sleep_until(deadline).await;
        }
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        self.shared.state.lock().busy = false;
        check_sequential(&self.shared);
    }
}
