//! The pending-request correlation table.
//!
//! Maps in-flight correlation ids to one-shot awaiters.  Ids come from a
//! monotonically increasing counter truncated into the 16-bit wire id
//! space; a slot collision (an id from 65536 requests ago still awaiting)
//! retries with the next id.  Once the table is poisoned by a connection
//! failure every present and future awaiter observes the same error.

use crate::error::RpcError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tandem_protocol::Status;
use tokio::sync::oneshot;
use tracing::debug;

/// Number of distinct correlation ids.
const ID_SPACE: usize = 1 << 16;

/// A raw response, before typed deserialization at the proxy layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub status: Status,
    /// Codec named in the response header; `None` means the default.
    pub encoding: Option<String>,
    pub payload: Vec<u8>,
}

pub(crate) type PendingResult = Result<ResponseEnvelope, RpcError>;
pub(crate) type Awaiter = oneshot::Receiver<PendingResult>;

pub(crate) struct PendingTable {
    slots: Mutex<Slots>,
    next_id: AtomicU32,
}

struct Slots {
    map: HashMap<u16, oneshot::Sender<PendingResult>>,
    poison: Option<RpcError>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            slots: Mutex::new(Slots {
                map: HashMap::new(),
                poison: None,
            }),
            next_id: AtomicU32::new(0),
        }
    }

    /// Allocate a correlation id and its awaiter.  The entry is visible in
    /// the table before this returns, so a response can never race its own
    /// registration.
    pub fn register(&self) -> Result<(i32, Awaiter), RpcError> {
        let mut slots = lock(&self.slots);
        if let Some(err) = &slots.poison {
            return Err(err.clone());
        }
        if slots.map.len() >= ID_SPACE {
            return Err(RpcError::IdSpaceExhausted);
        }
        // Bounded by the occupancy check above: at least one free id exists.
        let uid = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed) as u16;
            if !slots.map.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = oneshot::channel();
        slots.map.insert(uid, tx);
        Ok((i32::from(uid), rx))
    }

    /// Resolve the awaiter for `uid`, at most once.  Returns false when no
    /// entry exists (already completed, or a stray id from the peer); an
    /// entry whose awaiter was dropped still counts as completed.
    pub fn complete(&self, uid: i32, result: PendingResult) -> bool {
        let Ok(key) = u16::try_from(uid) else {
            debug!(uid, "response uid outside the allocated id space");
            return false;
        };
        let sender = lock(&self.slots).map.remove(&key);
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => {
                debug!(uid, "response for unknown or already-completed request");
                false
            }
        }
    }

    /// Drop the entry for `uid` without resolving it.  Used when a request
    /// fails locally before it ever reaches the queue.
    pub fn discard(&self, uid: i32) {
        if let Ok(key) = u16::try_from(uid) {
            lock(&self.slots).map.remove(&key);
        }
    }

    /// Poison the table: fail every pending awaiter with `err` and make all
    /// later `register` calls fail the same way.  Idempotent; the first
    /// error wins.
    pub fn fail_all(&self, err: RpcError) {
        let senders: Vec<_> = {
            let mut slots = lock(&self.slots);
            if slots.poison.is_some() {
                return;
            }
            slots.poison = Some(err.clone());
            slots.map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Err(err.clone()));
        }
    }

    #[cfg(test)]
    pub fn is_poisoned(&self) -> bool {
        lock(&self.slots).poison.is_some()
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        lock(&self.slots).map.len()
    }
}
