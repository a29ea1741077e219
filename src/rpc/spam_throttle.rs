//! Per-address inbound rate limiting, consulted before any decoding work.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Hits above this leave a source throttled until it backs off.
const BURST_CAPACITY: u32 = 10;
/// Counter decay per second of wall time.
const DECAY_PER_SECOND: u32 = 2;
/// Counters saturate here so a flood can't buy unbounded penalty time.
const SATURATION: u32 = 2 * BURST_CAPACITY;

struct ThrottleInner {
    counters: HashMap<IpAddr, u32>,
    last_decay: Instant,
}

/// Counts datagrams per source IP with steady decay. `is_spam` both observes
/// and decides: a source exceeding the burst rate reads `true` until enough
/// idle time has passed.
pub struct SpamThrottle {
    inner: Mutex<ThrottleInner>,
}

impl SpamThrottle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ThrottleInner {
                counters: HashMap::new(),
                last_decay: Instant::now(),
            }),
        }
    }

    /// Record one datagram from `ip` and report whether it should be dropped.
    pub fn is_spam(&self, ip: &IpAddr) -> bool {
        self.is_spam_at(ip, Instant::now())
    }

    fn is_spam_at(&self, ip: &IpAddr, now: Instant) -> bool {
        let mut inner = self.lock();

        let elapsed_seconds = now.duration_since(inner.last_decay).as_secs() as u32;
        if elapsed_seconds > 0 {
            let decay = elapsed_seconds.saturating_mul(DECAY_PER_SECOND);
            inner.counters.retain(|_, counter| {
                *counter = counter.saturating_sub(decay);
                *counter > 0
            });
            inner.last_decay = now;
        }

        let counter = inner.counters.entry(*ip).or_insert(0);
        *counter = (*counter + 1).min(SATURATION);
        *counter > BURST_CAPACITY
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SpamThrottle {
    fn default() -> Self {
        Self::new()
    }
}
