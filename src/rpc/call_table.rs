//! Concurrent transaction-id to call mapping with bounded occupancy.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;

use crate::config::MTID_LENGTH;
use crate::messages::RequestMethod;
use crate::rpc::call::RpcCall;
use crate::{Error, Result};

/// A six byte transaction id, compared by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mtid([u8; MTID_LENGTH]);

impl Mtid {
    /// Fresh random id from the thread-local, cryptographically seeded PRNG.
    /// Uniqueness is statistical; insertion handles the residual collisions.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_bytes(&self) -> &[u8; MTID_LENGTH] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<&[u8]> for Mtid {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; MTID_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidTransactionId(bytes.to_vec()))?;
        Ok(Self(bytes))
    }
}

impl Debug for Mtid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Mtid(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Maps in-flight transaction ids to their calls. Insertion is
/// insert-if-absent with collision retry; removal is conditional on call
/// identity so a late duplicate response can never evict a reused id.
pub(crate) struct CallTable {
    max_active_calls: usize,
    calls: Mutex<HashMap<Mtid, Arc<RpcCall>>>,
}

impl CallTable {
    pub fn new(max_active_calls: usize) -> Self {
        Self {
            max_active_calls,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Admits `call` under a fresh transaction id, or returns None when the
    /// table is at the active-call ceiling.
    pub fn try_insert(&self, call: &Arc<RpcCall>) -> Option<Mtid> {
        let mut calls = self.lock();

        if calls.len() >= self.max_active_calls {
            return None;
        }

        loop {
            let mtid = Mtid::random();
            match calls.entry(mtid) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(call.clone());
                    call.assign_mtid(mtid);
                    return Some(mtid);
                }
            }
        }
    }

    pub fn get(&self, mtid: &Mtid) -> Option<Arc<RpcCall>> {
        self.lock().get(mtid).cloned()
    }

    /// Removes the entry only if it still maps to this exact call.
    /// Idempotent; returns whether this caller performed the removal.
    pub fn remove_if_same(&self, mtid: &Mtid, call: &RpcCall) -> bool {
        let mut calls = self.lock();
        if let Some(entry) = calls.get(mtid) {
            if std::ptr::eq(Arc::as_ptr(entry), call as *const RpcCall) {
                calls.remove(mtid);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < self.max_active_calls
    }

    /// Resolver for response parsing: which request schema a pending
    /// transaction id expects.
    pub fn method_of(&self, transaction_id: &[u8]) -> Option<RequestMethod> {
        let mtid = Mtid::try_from(transaction_id).ok()?;
        self.get(&mtid).map(|call| call.request_method())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Mtid, Arc<RpcCall>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
