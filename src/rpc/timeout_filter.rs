//! Adaptive stall-timeout estimation from observed response delays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::messages::Message;
use crate::rpc::call::{CallListener, RpcCall};

/// Hard ceiling on any call timeout.
pub const RPC_CALL_TIMEOUT_MAX: Duration = Duration::from_millis(10_000);
/// Floor below which stall timeouts would only add spurious retransmits.
pub const STALL_TIMEOUT_FLOOR: Duration = Duration::from_millis(500);

const BIN_WIDTH_MS: u64 = 50;
const NUM_BINS: usize = (RPC_CALL_TIMEOUT_MAX.as_millis() as u64 / BIN_WIDTH_MS) as usize;
/// Per-sample decay applied to the histogram, so old network conditions age out.
const DECAY: f64 = 0.95;
/// Stall timeout is the RTT below which this share of responses arrive.
const QUANTILE: f64 = 0.9;

struct Histogram {
    bins: [f64; NUM_BINS],
    sample_count: u64,
}

/// Accumulates an RTT histogram over calls to the unverified node population
/// and publishes a stall timeout at the [QUANTILE] of observed delays.
///
/// Verified routing-table peers are biased towards low RTTs and are kept out
/// of the estimate; register only calls to peers that were not already
/// verified at creation time.
pub struct ResponseTimeoutFilter {
    inner: Mutex<Histogram>,
    stall_timeout_millis: AtomicU64,
}

impl ResponseTimeoutFilter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Histogram {
                bins: [0.0; NUM_BINS],
                sample_count: 0,
            }),
            stall_timeout_millis: AtomicU64::new(RPC_CALL_TIMEOUT_MAX.as_millis() as u64),
        }
    }

    /// Attach the RTT probe to a call; its response delay feeds the histogram.
    pub fn register_call(self: &Arc<Self>, call: &RpcCall) {
        call.add_listener(Arc::new(FilterListener {
            filter: Arc::downgrade(self),
        }));
    }

    /// Current adaptive upper bound on an "expected" round trip.
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_millis.load(Ordering::Relaxed))
    }

    pub fn sample_count(&self) -> u64 {
        self.lock().sample_count
    }

    /// Forget accumulated samples; called when the socket is (re)opened and
    /// when reachability drops, so stale conditions don't contaminate the
    /// next connectivity window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.bins = [0.0; NUM_BINS];
        inner.sample_count = 0;
        drop(inner);
        self.stall_timeout_millis
            .store(RPC_CALL_TIMEOUT_MAX.as_millis() as u64, Ordering::Relaxed);
    }

    fn add_sample(&self, rtt: Duration) {
        let mut inner = self.lock();

        let bin = ((rtt.as_millis() as u64 / BIN_WIDTH_MS) as usize).min(NUM_BINS - 1);
        for count in inner.bins.iter_mut() {
            *count *= DECAY;
        }
        inner.bins[bin] += 1.0;
        inner.sample_count += 1;

        let total: f64 = inner.bins.iter().sum();
        let mut cumulative = 0.0;
        let mut quantile_bin = NUM_BINS - 1;
        for (i, count) in inner.bins.iter().enumerate() {
            cumulative += count;
            if cumulative >= total * QUANTILE {
                quantile_bin = i;
                break;
            }
        }
        drop(inner);

        let timeout = Duration::from_millis((quantile_bin as u64 + 1) * BIN_WIDTH_MS)
            .clamp(STALL_TIMEOUT_FLOOR, RPC_CALL_TIMEOUT_MAX);
        self.stall_timeout_millis
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, Histogram> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResponseTimeoutFilter {
    fn default() -> Self {
        Self::new()
    }
}

struct FilterListener {
    filter: Weak<ResponseTimeoutFilter>,
}

impl CallListener for FilterListener {
    fn on_response(&self, call: &RpcCall, _response: &Message) {
        if let (Some(filter), Some(sent_at)) = (self.filter.upgrade(), call.sent_at()) {
            filter.add_sample(sent_at.elapsed());
        }
    }
}
