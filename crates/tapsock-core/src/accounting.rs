//! Socket provisioning limits and identifier allocation.
//!
//! Shared by the service (for `socket()`) and every Tap event loop (for
//! connections produced by the accept callback), so both paths respect the
//! same live-socket ceiling.

use crate::error::{SocketError, SocketResult};
use crate::vsocket::SocketId;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Live-socket counter with an upper bound
#[derive(Debug)]
pub struct SocketAccounting {
    next_id: AtomicU32,
    live: AtomicUsize,
    limit: usize,
}

impl SocketAccounting {
    /// Create accounting allowing at most `limit` live sockets
    pub fn new(limit: usize) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            live: AtomicUsize::new(0),
            limit,
        }
    }

    /// Reserve capacity for one more socket and allocate its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::SocketLimit`] when `limit` sockets are live.
    pub fn provision(&self) -> SocketResult<SocketId> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.limit).then_some(live + 1)
            })
            .map_err(|_| SocketError::SocketLimit { limit: self.limit })?;
        Ok(SocketId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    /// Check whether another socket could be provisioned right now
    pub fn can_provision(&self) -> bool {
        self.live.load(Ordering::Acquire) < self.limit
    }

    /// Return the capacity held by a socket that reached `Closed`
    pub fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1));
    }

    /// Number of live sockets
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Configured ceiling
    pub fn limit(&self) -> usize {
        self.limit
    }
}
