//! Virtual socket state machine.
//!
//! A [`VirtualSocket`] bridges one application descriptor to one protocol
//! control block (PCB) inside the embedded stack. The PCB itself lives in the
//! owning Tap's event loop and is never visible here; application threads see
//! only the buffers, the control-plane state and a published snapshot of the
//! protocol state.
//!
//! # Control-plane states
//!
//! ```text
//!            connect completes (event loop)
//!   ACTIVE ─────────────────────────────────► UNHANDLED_CONNECTED
//!     │  ▲                                          │
//!     │  └──────────── connect() claims ────────────┘
//!     │
//!     │ close()/shutdown() request (application)
//!     ▼
//!   SHOULD_SHUTDOWN ──── PCB released (event loop) ───► CLOSED (terminal)
//! ```
//!
//! Only the event loop moves a socket into `Closed`; application threads only
//! ever *request* teardown.

use crate::accept_queue::AcceptQueue;
use crate::config::{StackConfig, WriteMode};
use crate::error::StackErrorKind;
use crate::readiness::Fd;
use crate::ring_buffer::RingBuffer;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Identifier of a virtual socket, unique within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vs-{}", self.0)
    }
}

/// Identifier of a joined virtual network (and therefore of its Tap)
///
/// Written as 16 hex digits in configuration files and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkId(pub u64);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for NetworkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim_start_matches("0x"), 16).map(Self)
    }
}

impl TryFrom<String> for NetworkId {
    type Error = std::num::ParseIntError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetworkId> for String {
    fn from(id: NetworkId) -> Self {
        id.to_string()
    }
}

/// Transport type, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Reliable byte stream (TCP)
    Stream,
    /// Datagrams (UDP)
    Datagram,
}

impl SocketType {
    /// Parse a POSIX `SOCK_*` value, ignoring `SOCK_NONBLOCK`/`SOCK_CLOEXEC` flags
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) {
            libc::SOCK_STREAM => Some(Self::Stream),
            libc::SOCK_DGRAM => Some(Self::Datagram),
            _ => None,
        }
    }

    /// POSIX `SOCK_*` value
    pub fn raw(self) -> i32 {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Datagram => libc::SOCK_DGRAM,
        }
    }

    /// Short name for logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Datagram => "datagram",
        }
    }
}

/// Address family, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4
    Inet,
    /// IPv6
    Inet6,
}

impl AddressFamily {
    /// Parse a POSIX `AF_*` value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            libc::AF_INET => Some(Self::Inet),
            libc::AF_INET6 => Some(Self::Inet6),
            _ => None,
        }
    }

    /// POSIX `AF_*` value
    pub fn raw(self) -> i32 {
        match self {
            Self::Inet => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
        }
    }

    /// Family of an IP address
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Check whether `ip` belongs to this family
    pub fn matches(self, ip: &IpAddr) -> bool {
        Self::of(ip) == self
    }
}

/// Control-plane state, distinct from the protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VsState {
    /// Normal operation
    Active,
    /// Outbound connect completed, waiting for the connecting thread to claim it
    UnhandledConnected,
    /// Application asked for teardown; the event loop will release the PCB
    ShouldShutdown,
    /// PCB released; terminal
    Closed,
}

/// Snapshot of the embedded stack's protocol state, published by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolState {
    /// No PCB yet
    Unbound = 0,
    /// Local endpoint reserved, no connection
    Bound = 1,
    /// Listening for connections
    Listen = 2,
    /// SYN sent
    SynSent = 3,
    /// SYN received
    SynReceived = 4,
    /// Connection open
    Established = 5,
    /// Local close, FIN sent
    FinWait1 = 6,
    /// Local FIN acknowledged
    FinWait2 = 7,
    /// Remote closed
    CloseWait = 8,
    /// Simultaneous close
    Closing = 9,
    /// Remote closed, local FIN sent
    LastAck = 10,
    /// Waiting out stray segments
    TimeWait = 11,
    /// PCB gone
    Closed = 12,
}

impl ProtocolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Bound,
            2 => Self::Listen,
            3 => Self::SynSent,
            4 => Self::SynReceived,
            5 => Self::Established,
            6 => Self::FinWait1,
            7 => Self::FinWait2,
            8 => Self::CloseWait,
            9 => Self::Closing,
            10 => Self::LastAck,
            11 => Self::TimeWait,
            12 => Self::Closed,
            _ => Self::Unbound,
        }
    }

    /// No further teardown work is needed for this PCB
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::TimeWait)
    }

    /// Data may still flow in at least one direction
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::CloseWait
        )
    }
}

/// Direction argument of `shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    /// `SHUT_RD`
    Read,
    /// `SHUT_WR`
    Write,
    /// `SHUT_RDWR`
    Both,
}

impl ShutdownHow {
    /// Parse a POSIX `SHUT_*` value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            libc::SHUT_RD => Some(Self::Read),
            libc::SHUT_WR => Some(Self::Write),
            libc::SHUT_RDWR => Some(Self::Both),
            _ => None,
        }
    }

    /// Includes the read side
    pub fn read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    /// Includes the write side
    pub fn write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

/// Staged outbound bytes plus the hand-off accounting of the write discipline.
///
/// Under [`WriteMode::Copy`] bytes leave the ring as soon as the stack accepts
/// them. Under [`WriteMode::NoCopy`] accepted bytes stay at the front of the
/// ring as *in flight* until [`TxStage::acknowledged`] releases them.
#[derive(Debug)]
pub struct TxStage {
    buf: RingBuffer,
    in_flight: usize,
    mode: WriteMode,
}

impl TxStage {
    fn new(capacity: usize, mode: WriteMode) -> Self {
        Self {
            buf: RingBuffer::new(capacity),
            in_flight: 0,
            mode,
        }
    }

    /// Stage as much of `data` as fits
    pub fn stage(&mut self, data: &[u8]) -> usize {
        self.buf.produce(data)
    }

    /// Bytes staged but not yet handed to the stack
    pub fn pending(&self) -> usize {
        self.buf.count() - self.in_flight
    }

    /// Bytes handed to the stack and awaiting acknowledgement
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Pending bytes as at most two slices
    pub fn pending_slices(&self) -> (&[u8], &[u8]) {
        self.buf.slices_from(self.in_flight)
    }

    /// Record that the stack accepted `n` pending bytes
    pub fn handed_off(&mut self, n: usize) {
        let n = n.min(self.pending());
        match self.mode {
            WriteMode::Copy => {
                self.buf.consume(n);
            }
            WriteMode::NoCopy => self.in_flight += n,
        }
    }

    /// Release up to `n` acknowledged in-flight bytes, returning the count released
    pub fn acknowledged(&mut self, n: usize) -> usize {
        let n = n.min(self.in_flight);
        self.buf.consume(n);
        self.in_flight -= n;
        n
    }

    /// Free staging space
    pub fn free(&self) -> usize {
        self.buf.free()
    }

    /// Total staged bytes including in-flight ones
    pub fn count(&self) -> usize {
        self.buf.count()
    }

    /// Staging capacity
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Nothing staged and nothing in flight
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write discipline
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Underlying ring, used for datagram units
    pub fn ring_mut(&mut self) -> &mut RingBuffer {
        &mut self.buf
    }

    /// Drop everything, including in-flight bytes
    pub fn clear(&mut self) {
        self.buf.clear();
        self.in_flight = 0;
    }
}

/// Per-endpoint state shared between application threads and the event loop
pub struct VirtualSocket {
    id: SocketId,
    socket_type: SocketType,
    family: AddressFamily,

    state: Mutex<VsState>,
    state_changed: Condvar,
    protocol: AtomicU8,

    rx: Mutex<RingBuffer>,
    tx: Mutex<TxStage>,

    pending_error: Mutex<Option<StackErrorKind>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    fd: AtomicI32,
    network: OnceLock<NetworkId>,
    accept_queue: OnceLock<AcceptQueue>,

    read_shutdown: AtomicBool,
    write_shutdown: AtomicBool,
    peer_closed: AtomicBool,

    nodelay: AtomicBool,
    linger: Mutex<Option<Duration>>,
    keepalive: Mutex<Option<Duration>>,
}

impl VirtualSocket {
    /// Create a socket with buffers sized by `config`
    pub fn new(
        id: SocketId,
        socket_type: SocketType,
        family: AddressFamily,
        config: &StackConfig,
    ) -> Self {
        Self {
            id,
            socket_type,
            family,
            state: Mutex::new(VsState::Active),
            state_changed: Condvar::new(),
            protocol: AtomicU8::new(ProtocolState::Unbound as u8),
            rx: Mutex::new(RingBuffer::new(config.rx_buffer_size)),
            tx: Mutex::new(TxStage::new(config.tx_buffer_size, config.write_mode)),
            pending_error: Mutex::new(None),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            fd: AtomicI32::new(-1),
            network: OnceLock::new(),
            accept_queue: OnceLock::new(),
            read_shutdown: AtomicBool::new(false),
            write_shutdown: AtomicBool::new(false),
            peer_closed: AtomicBool::new(false),
            // New stream PCBs have Nagle disabled
            nodelay: AtomicBool::new(true),
            linger: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    /// Socket identifier
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Transport type
    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    /// Address family
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Check if this is a stream socket
    pub fn is_stream(&self) -> bool {
        self.socket_type == SocketType::Stream
    }

    // ------------------------------------------------------------------
    // Control-plane state
    // ------------------------------------------------------------------

    /// Current control-plane state
    pub fn state(&self) -> VsState {
        *self.state.lock()
    }

    fn transition(&self, f: impl FnOnce(VsState) -> Option<VsState>) -> bool {
        let mut state = self.state.lock();
        match f(*state) {
            Some(next) => {
                tracing::debug!("{}: {:?} -> {:?}", self.id, *state, next);
                *state = next;
                self.state_changed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Event loop: outbound connect completed
    pub fn mark_connected(&self) -> bool {
        self.transition(|s| (s == VsState::Active).then_some(VsState::UnhandledConnected))
    }

    /// Connecting thread: take ownership of a completed connection
    pub fn claim_connection(&self) -> bool {
        self.transition(|s| (s == VsState::UnhandledConnected).then_some(VsState::Active))
    }

    /// Application: ask the event loop to tear the PCB down.
    ///
    /// Returns `false` if teardown was already requested or completed.
    pub fn request_shutdown(&self) -> bool {
        self.transition(|s| match s {
            VsState::Active | VsState::UnhandledConnected => Some(VsState::ShouldShutdown),
            VsState::ShouldShutdown | VsState::Closed => None,
        })
    }

    /// Event loop: PCB released. Idempotent.
    pub fn mark_closed(&self) -> bool {
        self.transition(|s| (s != VsState::Closed).then_some(VsState::Closed))
    }

    /// Check if the socket reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.state() == VsState::Closed
    }

    /// Teardown requested or done
    pub fn is_shutting_down(&self) -> bool {
        matches!(self.state(), VsState::ShouldShutdown | VsState::Closed)
    }

    /// Block until `done` accepts the state or `timeout` elapses.
    ///
    /// Wakes on every state transition and additionally re-checks every
    /// `recheck`, so conditions that also depend on the protocol snapshot are
    /// observed even without a transition. Returns the last observed state.
    pub fn wait_until(
        &self,
        timeout: Option<Duration>,
        recheck: Duration,
        mut done: impl FnMut(VsState) -> bool,
    ) -> VsState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if done(*state) {
                return *state;
            }
            let mut wait = recheck;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return *state;
                }
                wait = wait.min(deadline - now);
            }
            self.state_changed.wait_for(&mut state, wait);
        }
    }

    /// Latest protocol-state snapshot
    pub fn protocol_state(&self) -> ProtocolState {
        ProtocolState::from_u8(self.protocol.load(Ordering::Acquire))
    }

    /// Event loop: publish the protocol state
    pub fn set_protocol_state(&self, next: ProtocolState) {
        let prev = self.protocol.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            // Waiters may be blocked on a condition involving the snapshot
            let _state = self.state.lock();
            self.state_changed.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    /// Lock the RX ring (event loop produces, application consumes)
    pub fn rx(&self) -> MutexGuard<'_, RingBuffer> {
        self.rx.lock()
    }

    /// Lock the TX stage (application produces, event loop consumes)
    pub fn tx(&self) -> MutexGuard<'_, TxStage> {
        self.tx.lock()
    }

    // ------------------------------------------------------------------
    // Asynchronous errors
    // ------------------------------------------------------------------

    /// Event loop: record an error for the next application call
    pub fn set_error(&self, kind: StackErrorKind) {
        tracing::debug!("{}: recorded error {}", self.id, kind);
        *self.pending_error.lock() = Some(kind);
    }

    /// Take the pending error, clearing it
    pub fn take_error(&self) -> Option<StackErrorKind> {
        self.pending_error.lock().take()
    }

    /// Pending error without clearing it
    pub fn pending_error(&self) -> Option<StackErrorKind> {
        *self.pending_error.lock()
    }

    // ------------------------------------------------------------------
    // Addressing and ownership
    // ------------------------------------------------------------------

    /// Bound local address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Set the bound local address
    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
    }

    /// Connected peer (default destination for datagrams)
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    /// Set the connected peer
    pub fn set_peer_addr(&self, addr: SocketAddr) {
        *self.peer_addr.lock() = Some(addr);
    }

    /// Application descriptor, `-1` until assigned
    pub fn fd(&self) -> Fd {
        self.fd.load(Ordering::Acquire)
    }

    /// Assign the application descriptor
    pub fn set_fd(&self, fd: Fd) {
        self.fd.store(fd, Ordering::Release);
    }

    /// Network of the owning Tap, if attached
    pub fn network(&self) -> Option<NetworkId> {
        self.network.get().copied()
    }

    /// Attach to a Tap. Returns `false` if already attached elsewhere.
    pub fn attach(&self, network: NetworkId) -> bool {
        *self.network.get_or_init(|| network) == network
    }

    // ------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------

    /// Turn this socket into a listener. Returns `false` if it already listens.
    pub fn start_listening(&self, backlog: usize) -> bool {
        self.accept_queue.set(AcceptQueue::new(backlog)).is_ok()
    }

    /// Accept queue, present only for listeners
    pub fn accept_queue(&self) -> Option<&AcceptQueue> {
        self.accept_queue.get()
    }

    /// Check if this socket is a listener
    pub fn is_listening(&self) -> bool {
        self.accept_queue.get().is_some()
    }

    // ------------------------------------------------------------------
    // Half-close and EOF
    // ------------------------------------------------------------------

    /// Application shut down its read side
    pub fn shutdown_read(&self) {
        self.read_shutdown.store(true, Ordering::Release);
    }

    /// Application shut down its write side
    pub fn shutdown_write(&self) {
        self.write_shutdown.store(true, Ordering::Release);
    }

    /// Read side shut down
    pub fn is_read_shutdown(&self) -> bool {
        self.read_shutdown.load(Ordering::Acquire)
    }

    /// Write side shut down
    pub fn is_write_shutdown(&self) -> bool {
        self.write_shutdown.load(Ordering::Acquire)
    }

    /// Event loop: the peer will send no more data
    pub fn mark_peer_closed(&self) {
        self.peer_closed.store(true, Ordering::Release);
    }

    /// Peer sent FIN
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Options mirrored on the socket
    // ------------------------------------------------------------------

    /// `TCP_NODELAY`
    pub fn nodelay(&self) -> bool {
        self.nodelay.load(Ordering::Relaxed)
    }

    /// Set `TCP_NODELAY`
    pub fn set_nodelay(&self, on: bool) {
        self.nodelay.store(on, Ordering::Relaxed);
    }

    /// `SO_LINGER`
    pub fn linger(&self) -> Option<Duration> {
        *self.linger.lock()
    }

    /// Set `SO_LINGER`
    pub fn set_linger(&self, linger: Option<Duration>) {
        *self.linger.lock() = linger;
    }

    /// `SO_KEEPALIVE` interval
    pub fn keepalive(&self) -> Option<Duration> {
        *self.keepalive.lock()
    }

    /// Set the keep-alive interval
    pub fn set_keepalive(&self, interval: Option<Duration>) {
        *self.keepalive.lock() = interval;
    }
}

impl fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("id", &self.id)
            .field("type", &self.socket_type)
            .field("family", &self.family)
            .field("state", &self.state())
            .field("protocol", &self.protocol_state())
            .field("fd", &self.fd())
            .finish_non_exhaustive()
    }
}
