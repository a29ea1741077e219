//! External address consensus from peers' "you appear as" observations.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::debug;

use crate::common::is_global_unicast;

/// Reporting sources kept, access ordered; the eldest is evicted past this.
const ORIGIN_PAIRS_CAPACITY: usize = 64;
/// Elections run once strictly more sources than this have reported.
const ELECTION_THRESHOLD: usize = 20;

/// Bounded LRU of (reporting peer IP -> externally observed address) with
/// majority election of the mode.
pub(crate) struct AddressConsensus {
    origin_pairs: Mutex<LruCache<IpAddr, SocketAddr>>,
    elected: Mutex<Option<SocketAddr>>,
}

impl AddressConsensus {
    pub fn new() -> Self {
        Self {
            origin_pairs: Mutex::new(LruCache::new(
                NonZeroUsize::new(ORIGIN_PAIRS_CAPACITY).expect("capacity is non-zero"),
            )),
            elected: Mutex::new(None),
        }
    }

    /// Feed one observation. Non-global-unicast claims are not credible and
    /// are ignored.
    pub fn observe(&self, source: IpAddr, reported: SocketAddr) {
        if !is_global_unicast(&reported.ip()) {
            return;
        }

        let mut pairs = self
            .origin_pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        pairs.put(source, reported);

        if pairs.len() > ELECTION_THRESHOLD {
            // Count oldest-to-newest; only a strictly greater count takes the
            // lead, so the first candidate to reach the winning tally holds it.
            let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
            let mut winner: Option<(SocketAddr, usize)> = None;
            for (_, address) in pairs.iter().rev() {
                let count = counts.entry(*address).or_insert(0);
                *count += 1;
                if winner.map_or(true, |(_, best)| *count > best) {
                    winner = Some((*address, *count));
                }
            }
            drop(pairs);

            if let Some((address, votes)) = winner {
                debug!(?address, votes, "Updated consensus external address");
                *self.lock_elected() = Some(address);
            }
        }
    }

    /// The majority-elected external address, if an election has happened.
    pub fn external_address(&self) -> Option<SocketAddr> {
        *self.lock_elected()
    }

    #[cfg(test)]
    fn tracked_sources(&self) -> usize {
        self.origin_pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn lock_elected(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.elected.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn source(n: u8) -> IpAddr {
        IpAddr::V4([83, 97, 73, n].into())
    }

    #[test]
    fn majority_wins() {
        let consensus = AddressConsensus::new();
        let majority: SocketAddr = "203.0.113.1:6881".parse().unwrap();
        let minority: SocketAddr = "198.51.100.2:6881".parse().unwrap();

        for n in 0..15 {
            consensus.observe(source(n), majority);
        }
        for n in 15..21 {
            consensus.observe(source(n), minority);
        }

        assert_eq!(consensus.external_address(), Some(majority));
    }

    #[test]
    fn no_election_below_threshold() {
        let consensus = AddressConsensus::new();
        for n in 0..ELECTION_THRESHOLD as u8 {
            consensus.observe(source(n), "203.0.113.1:6881".parse().unwrap());
        }
        assert_eq!(consensus.external_address(), None);
    }

    #[test]
    fn tie_goes_to_first_reaching_the_count() {
        let consensus = AddressConsensus::new();
        let first: SocketAddr = "203.0.113.1:6881".parse().unwrap();
        let second: SocketAddr = "198.51.100.2:6881".parse().unwrap();

        // interleaved, `first` always a step ahead
        for n in 0..11u8 {
            consensus.observe(source(n * 2), first);
            consensus.observe(source(n * 2 + 1), second);
        }

        assert_eq!(consensus.external_address(), Some(first));
    }

    #[test]
    fn non_global_claims_are_ignored() {
        let consensus = AddressConsensus::new();
        for n in 0..30 {
            consensus.observe(source(n), "192.168.1.1:6881".parse().unwrap());
        }
        assert_eq!(consensus.external_address(), None);
        assert_eq!(consensus.tracked_sources(), 0);
    }

    #[test]
    fn origin_pairs_are_bounded() {
        let consensus = AddressConsensus::new();
        for n in 0..100u32 {
            let bytes = n.to_be_bytes();
            consensus.observe(
                IpAddr::V4([83, bytes[2], bytes[1], bytes[3]].into()),
                "203.0.113.1:6881".parse().unwrap(),
            );
        }
        assert_eq!(consensus.tracked_sources(), ORIGIN_PAIRS_CAPACITY);
    }
}
