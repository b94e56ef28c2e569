//! Readiness notification collaborator.
//!
//! The socket layer does not implement `poll`/`select`. It only flips readable
//! and writable flags on an external multiplexer whenever RX data arrives, the
//! RX ring drains, or TX space opens up.

use std::collections::HashMap;
use parking_lot::Mutex;

/// Descriptor number as handed to the application
pub type Fd = i32;

/// External I/O-multiplexing facility observing descriptor readiness
///
/// Implementations are called from the event-loop thread and must not block.
pub trait ReadinessNotifier: Send + Sync {
    /// Enable or disable read-readiness notification for `fd`
    fn set_readable(&self, fd: Fd, ready: bool);

    /// Enable or disable write-readiness notification for `fd`
    fn set_writable(&self, fd: Fd, ready: bool);
}

/// Notifier that ignores every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ReadinessNotifier for NoopNotifier {
    fn set_readable(&self, _fd: Fd, _ready: bool) {}
    fn set_writable(&self, _fd: Fd, _ready: bool) {}
}

/// Current readiness of one descriptor
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Read notifications enabled
    pub readable: bool,
    /// Write notifications enabled
    pub writable: bool,
}

/// Notifier that remembers the latest readiness per descriptor
///
/// Useful for embedding in a simple `poll` loop and in tests.
#[derive(Debug, Default)]
pub struct ReadinessTable {
    entries: Mutex<HashMap<Fd, Readiness>>,
}

impl ReadinessTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest readiness for `fd` (both false if never reported)
    pub fn get(&self, fd: Fd) -> Readiness {
        self.entries.lock().get(&fd).copied().unwrap_or_default()
    }

    /// Descriptors currently flagged readable
    pub fn readable(&self) -> Vec<Fd> {
        let entries = self.entries.lock();
        let mut fds: Vec<Fd> = entries
            .iter()
            .filter(|(_, r)| r.readable)
            .map(|(fd, _)| *fd)
            .collect();
        fds.sort_unstable();
        fds
    }

    /// Forget a descriptor
    pub fn remove(&self, fd: Fd) {
        self.entries.lock().remove(&fd);
    }

    fn update(&self, fd: Fd, f: impl FnOnce(&mut Readiness)) {
        f(self.entries.lock().entry(fd).or_default());
    }
}

impl ReadinessNotifier for ReadinessTable {
    fn set_readable(&self, fd: Fd, ready: bool) {
        self.update(fd, |r| r.readable = ready);
    }

    fn set_writable(&self, fd: Fd, ready: bool) {
        self.update(fd, |r| r.writable = ready);
    }
}
