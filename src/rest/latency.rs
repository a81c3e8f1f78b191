//! Rolling request latency and server clock offset.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

const SAMPLES: usize = 10;

/// The date header is only sampled this often.
const OFFSET_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The date header has one-second resolution, so assume the midpoint.
const DATE_HEADER_ROUNDING_MS: i64 = 500;

#[derive(Debug)]
struct LatencyState {
    latency: i64,
    raw: VecDeque<i64>,
    time_offset: i64,
    time_offsets: VecDeque<i64>,
    last_offset_check: Option<Instant>,
}

/// Shared latency estimate for the REST dispatcher and its route buckets.
///
/// Both values are rolling sums over the last ten samples, each sample
/// contributing a tenth (integer division) of its value.
#[derive(Debug)]
pub struct LatencyRef {
    state: Mutex<LatencyState>,
    threshold: i64,
}

impl LatencyRef {
    /// Create an estimate seeded with `offset` in every latency slot.
    pub fn new(offset: Duration, threshold: Duration) -> Self {
        let seed = offset.as_millis() as i64;
        Self {
            state: Mutex::new(LatencyState {
                latency: seed,
                raw: std::iter::repeat(seed).take(SAMPLES).collect(),
                time_offset: 0,
                time_offsets: std::iter::repeat(0).take(SAMPLES).collect(),
                last_offset_check: None,
            }),
            threshold: threshold.as_millis() as i64,
        }
    }

    /// Current latency estimate in milliseconds.
    pub fn latency_ms(&self) -> i64 {
        self.state.lock().latency
    }

    /// Current latency estimate, clamped at zero.
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms().max(0) as u64)
    }

    /// Estimated milliseconds the server clock is ahead of the local clock.
    pub fn time_offset(&self) -> i64 {
        self.state.lock().time_offset
    }

    /// Fold in an observed round trip.
    pub fn record_latency(&self, sample: Duration) {
        let sample = sample.as_millis() as i64;
        let mut state = self.state.lock();
        let oldest = state.raw.pop_front().unwrap_or(0);
        state.latency = state.latency - oldest / 10 + sample / 10;
        state.raw.push_back(sample);
    }

    /// Fold in the server `date` header, at most once per five seconds.
    ///
    /// Returns `true` when the clock drift warning was raised.
    pub fn record_server_date(&self, server_ms: i64, local_ms: i64) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(last) = state.last_offset_check {
            if now.duration_since(last) <= OFFSET_CHECK_INTERVAL {
                return false;
            }
        }
        state.last_offset_check = Some(now);

        let offset = server_ms + DATE_HEADER_ROUNDING_MS - local_ms;
        let drifted = state.time_offset - state.latency >= self.threshold
            && offset - state.latency >= self.threshold;
        if drifted {
            warn!(
                offset_ms = state.time_offset,
                "Local clock is behind the server clock, check your connection and system time"
            );
        }

        let oldest = state.time_offsets.pop_front().unwrap_or(0);
        state.time_offset = state.time_offset - oldest / 10 + offset / 10;
        state.time_offsets.push_back(offset);
        drifted
    }
}
