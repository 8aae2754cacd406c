//! The per-connection in-flight work counter.
//!
//! Counts requests that still owe a response, in either direction.  The
//! value −1 is the drained sentinel: shutdown has been requested and no
//! work remains.  Transitions:
//!
//! - a request begins (outbound send or inbound dispatch): `+1`, refused
//!   once the counter is at the sentinel;
//! - a response completes (sent or received): `−1`;
//! - shutdown: `−1`, exactly once.
//!
//! Whichever operation lands the counter on −1 owns starting the close
//! handshake.

use std::sync::atomic::{AtomicI64, Ordering};

const DRAINED: i64 = -1;

pub(crate) struct InflightCounter(AtomicI64);

impl InflightCounter {
    pub fn new() -> Self {
        InflightCounter(AtomicI64::new(0))
    }

    /// Try to account for a new request.  Fails when shutdown has already
    /// drained the connection; the caller must drop the request.
    pub fn try_begin_request(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == DRAINED {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Account for one completed response.  True when this completion
    /// drained the connection (shutdown pending, nothing left in flight).
    pub fn complete_response(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) - 1 == DRAINED
    }

    /// Record the shutdown decrement.  True when the connection is already
    /// idle, i.e. the caller should start the close handshake immediately.
    pub fn begin_shutdown(&self) -> bool {
        self.0.fetch_sub(1, Ordering::AcqRel) - 1 == DRAINED
    }

    #[cfg(test)]
    fn value(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}
