//! Per-listener queue of accepted connections.
//!
//! The event loop pushes newly established connections and application threads
//! pop them in FIFO order. The queue is lock-free and bounded by the listen
//! backlog, so a push from the event loop never blocks.

use crate::vsocket::VirtualSocket;
use crossbeam_queue::ArrayQueue;
use std::sync::Arc;

/// Bounded FIFO of accepted virtual sockets
#[derive(Debug)]
pub struct AcceptQueue {
    queue: ArrayQueue<Arc<VirtualSocket>>,
}

impl AcceptQueue {
    /// Create a queue holding at most `backlog` pending connections
    ///
    /// A backlog of 0 is treated as 1.
    pub fn new(backlog: usize) -> Self {
        Self {
            queue: ArrayQueue::new(backlog.max(1)),
        }
    }

    /// Append an accepted connection.
    ///
    /// Returns the socket back if the queue is full.
    pub fn push(&self, socket: Arc<VirtualSocket>) -> Result<(), Arc<VirtualSocket>> {
        self.queue.push(socket)
    }

    /// Dequeue the oldest pending connection
    pub fn pop(&self) -> Option<Arc<VirtualSocket>> {
        self.queue.pop()
    }

    /// Number of pending connections
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if no connection is pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Check if the backlog is exhausted
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Maximum number of pending connections
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Remove and return every pending connection
    pub fn drain(&self) -> Vec<Arc<VirtualSocket>> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }
}
