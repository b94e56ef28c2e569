//! Interface multiplexer: one Tap per joined virtual network.
//!
//! A [`Tap`] owns the address bindings of one network and the dedicated
//! event-loop thread that runs the embedded stack. Application threads only
//! hold an `Arc<TapShared>`: the cross-thread half of the Tap, through which
//! they inject frames, manage addresses and post control requests.

use crate::addr::{IpCidr, Route};
use crate::device::{FrameSink, MacAddress, encode_frame};
use crate::event_loop::{EventLoop, TapCommand};
use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tapsock_core::{
    AddressFamily, MAX_MTU, NetworkId, ReadinessNotifier, SocketAccounting, SocketError, SocketId,
    SocketResult, StackConfig, VirtualSocket,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Smallest MTU a Tap accepts
pub const MIN_MTU: usize = 576;

/// Tap lifecycle errors
#[derive(Debug, Error)]
pub enum TapError {
    /// Configuration rejected
    #[error("invalid tap configuration: {0}")]
    InvalidConfig(&'static str),

    /// Event-loop thread could not be started
    #[error("failed to spawn event loop: {0}")]
    Spawn(#[from] std::io::Error),

    /// A Tap for this network already exists
    #[error("network {0} already attached")]
    AlreadyAttached(NetworkId),
}

/// Tap configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfig {
    /// Network this Tap joins
    pub network: NetworkId,

    /// Interface MAC address
    pub mac: MacAddress,

    /// IP-level MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Initially assigned addresses
    #[serde(default)]
    pub addresses: Vec<IpCidr>,

    /// Managed routes, in match order
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Accept inbound frames
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_mtu() -> usize {
    MAX_MTU
}

fn default_enabled() -> bool {
    true
}

impl TapConfig {
    /// Configuration with the default MTU and no addresses
    pub fn new(network: NetworkId, mac: MacAddress) -> Self {
        Self {
            network,
            mac,
            mtu: default_mtu(),
            addresses: Vec::new(),
            routes: Vec::new(),
            enabled: true,
        }
    }

    /// Add an initial address
    pub fn with_address(mut self, cidr: IpCidr) -> Self {
        self.addresses.push(cidr);
        self
    }

    /// Add an initial route
    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Override the MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns [`TapError::InvalidConfig`] for an out-of-range MTU or a
    /// multicast MAC.
    pub fn validate(&self) -> Result<(), TapError> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(TapError::InvalidConfig("mtu out of range"));
        }
        if self.mac.is_multicast() {
            return Err(TapError::InvalidConfig("mac must be unicast"));
        }
        Ok(())
    }
}

/// Per-Tap counters
#[derive(Debug, Default)]
pub struct TapStats {
    /// Frames injected into the stack
    pub frames_in: AtomicU64,
    /// Frames handed to the transport
    pub frames_out: AtomicU64,
    /// Frames dropped (disabled Tap or full queue)
    pub frames_dropped: AtomicU64,
    /// Application bytes delivered into RX buffers
    pub bytes_in: AtomicU64,
    /// Application bytes handed to the stack
    pub bytes_out: AtomicU64,
    /// Connections produced by the accept callback
    pub accepted: AtomicU64,
}

/// Point-in-time copy of [`TapStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TapStatsSnapshot {
    /// Frames injected into the stack
    pub frames_in: u64,
    /// Frames handed to the transport
    pub frames_out: u64,
    /// Frames dropped
    pub frames_dropped: u64,
    /// Application bytes received
    pub bytes_in: u64,
    /// Application bytes sent
    pub bytes_out: u64,
    /// Accepted connections
    pub accepted: u64,
}

impl TapStats {
    /// Take a snapshot with relaxed loads
    pub fn snapshot(&self) -> TapStatsSnapshot {
        TapStatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
        }
    }
}

/// Cross-thread half of a Tap
pub struct TapShared {
    network: NetworkId,
    mac: MacAddress,
    mtu: usize,
    stack: StackConfig,
    addresses: RwLock<BTreeSet<IpCidr>>,
    routes: RwLock<Vec<Route>>,
    /// Connection table; held while traversing cross-connection bookkeeping
    connections: Mutex<Vec<Arc<VirtualSocket>>>,
    commands: Sender<TapCommand>,
    running: AtomicBool,
    enabled: AtomicBool,
    pcb_count: AtomicUsize,
    stats: TapStats,
}

impl TapShared {
    /// Network id
    pub fn network(&self) -> NetworkId {
        self.network
    }

    /// Interface MAC
    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    /// IP-level MTU
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Stack configuration shared by this Tap's sockets
    pub fn stack_config(&self) -> &StackConfig {
        &self.stack
    }

    /// Event loop still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Inbound frames are accepted
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable frame ingress
    pub fn set_enabled(&self, enabled: bool) {
        info!("tap {}: {}", self.network, if enabled { "enabled" } else { "disabled" });
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Counters
    pub fn stats(&self) -> TapStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn counters(&self) -> &TapStats {
        &self.stats
    }

    /// Number of PCBs held by the embedded stack, including draining ones
    pub fn pcb_count(&self) -> usize {
        self.pcb_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pcb_count(&self, count: usize) {
        self.pcb_count.store(count, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Frame ingress
    // ------------------------------------------------------------------

    /// Hand an inbound Ethernet frame to the embedded stack.
    ///
    /// Never blocks: the frame is dropped if the Tap is disabled, stopped, or
    /// its queue is full. Returns whether the frame was queued.
    pub fn inject_frame(
        &self,
        src: MacAddress,
        dst: MacAddress,
        ether_type: u16,
        payload: &[u8],
    ) -> bool {
        self.inject_raw(encode_frame(src, dst, ether_type, payload))
    }

    /// Hand an already serialized inbound frame to the embedded stack
    pub fn inject_raw(&self, raw: Vec<u8>) -> bool {
        if !self.is_enabled() || !self.is_running() {
            trace!("tap {}: dropping frame, interface down", self.network);
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.commands.try_send(TapCommand::Frame(raw)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("tap {}: frame queue full, dropping frame", self.network);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Addresses and routes
    // ------------------------------------------------------------------

    /// Assign an address. Returns `false` if it was already assigned.
    pub fn add_address(&self, cidr: IpCidr) -> bool {
        if !self.addresses.write().insert(cidr) {
            return false;
        }
        info!("tap {}: added address {}", self.network, cidr);
        self.post(TapCommand::AddAddress(cidr));
        true
    }

    /// Remove an address. Returns `false` if it was not assigned.
    pub fn remove_address(&self, cidr: &IpCidr) -> bool {
        if !self.addresses.write().remove(cidr) {
            return false;
        }
        info!("tap {}: removed address {}", self.network, cidr);
        self.post(TapCommand::RemoveAddress(*cidr));
        true
    }

    /// Assigned addresses in sorted order
    pub fn addresses(&self) -> Vec<IpCidr> {
        self.addresses.read().iter().copied().collect()
    }

    /// First assigned address of `family` in sorted order
    pub fn first_address(&self, family: AddressFamily) -> Option<IpCidr> {
        self.addresses
            .read()
            .iter()
            .find(|cidr| family.matches(&cidr.addr()))
            .copied()
    }

    /// Check if an IPv6 address is assigned
    pub fn has_ipv6(&self) -> bool {
        self.addresses.read().iter().any(|c| c.is_ipv6())
    }

    /// Add a managed route. Returns `false` if an identical route exists.
    pub fn add_route(&self, route: Route) -> bool {
        {
            let mut routes = self.routes.write();
            if routes.contains(&route) {
                return false;
            }
            routes.push(route);
        }
        debug!("tap {}: added route {}", self.network, route);
        if route.default_gateway().is_some() {
            self.post(TapCommand::AddRoute(route));
        }
        true
    }

    /// Managed routes in match order
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().clone()
    }

    // ------------------------------------------------------------------
    // Connection table
    // ------------------------------------------------------------------

    /// Lock the connection table
    pub(crate) fn lock_connections(&self) -> MutexGuard<'_, Vec<Arc<VirtualSocket>>> {
        self.connections.lock()
    }

    pub(crate) fn register(&self, vs: &Arc<VirtualSocket>) {
        let mut conns = self.connections.lock();
        if !conns.iter().any(|c| c.id() == vs.id()) {
            conns.push(Arc::clone(vs));
        }
    }

    pub(crate) fn unregister(&self, id: SocketId) {
        self.connections.lock().retain(|c| c.id() != id);
    }

    /// Number of virtual sockets owned by this Tap
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    // ------------------------------------------------------------------
    // Control channel
    // ------------------------------------------------------------------

    /// Fire-and-forget control request; silently ignored once stopped
    pub(crate) fn post(&self, cmd: TapCommand) {
        let _ = self.commands.send_timeout(cmd, self.stack.control_timeout());
    }

    /// Ask the event loop to visit one socket soon
    pub(crate) fn nudge(&self, id: SocketId) {
        // A full queue is fine: the periodic sweep visits every PCB anyway
        let _ = self.commands.try_send(TapCommand::Poll(id));
    }

    /// Send a request and wait for its reply
    pub(crate) fn request<T>(
        &self,
        make: impl FnOnce(Sender<T>) -> TapCommand,
    ) -> SocketResult<T> {
        if !self.is_running() {
            return Err(SocketError::InterfaceDown);
        }
        let (reply_tx, reply_rx) = bounded(1);
        let timeout = self.stack.control_timeout();
        self.commands
            .send_timeout(make(reply_tx), timeout)
            .map_err(|e| {
                if e.is_timeout() {
                    SocketError::TimedOut
                } else {
                    SocketError::InterfaceDown
                }
            })?;
        reply_rx.recv_timeout(timeout).map_err(|e| {
            if e.is_timeout() {
                SocketError::TimedOut
            } else {
                SocketError::InterfaceDown
            }
        })
    }
}

impl std::fmt::Debug for TapShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapShared")
            .field("network", &self.network)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .field("running", &self.is_running())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// One joined virtual network and its event-loop thread
pub struct Tap {
    shared: Arc<TapShared>,
    handle: Option<JoinHandle<()>>,
}

impl Tap {
    /// Start the Tap's event loop
    ///
    /// # Errors
    ///
    /// Returns an error if either configuration is invalid or the thread
    /// cannot be spawned.
    pub fn start(
        config: TapConfig,
        stack: StackConfig,
        sink: Arc<dyn FrameSink>,
        notifier: Arc<dyn ReadinessNotifier>,
        accounting: Arc<SocketAccounting>,
    ) -> Result<Self, TapError> {
        config.validate()?;
        stack.validate().map_err(TapError::InvalidConfig)?;

        let (commands, command_rx) = bounded(stack.frame_queue_depth.max(1));
        let shared = Arc::new(TapShared {
            network: config.network,
            mac: config.mac,
            mtu: config.mtu,
            addresses: RwLock::new(config.addresses.iter().copied().collect()),
            routes: RwLock::new(Vec::new()),
            stack,
            connections: Mutex::new(Vec::new()),
            commands,
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(config.enabled),
            pcb_count: AtomicUsize::new(0),
            stats: TapStats::default(),
        });
        for route in &config.routes {
            shared.routes.write().push(*route);
        }

        // The interface and socket set are built on the loop thread and never leave it
        let loop_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("tap-{}", config.network))
            .spawn(move || {
                EventLoop::new(loop_shared, command_rx, sink, notifier, accounting).run();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shared.set_running(false);
                return Err(TapError::Spawn(e));
            }
        };

        info!(
            "tap {}: started (mac {}, mtu {})",
            config.network, config.mac, config.mtu
        );

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Cross-thread handle
    pub fn shared(&self) -> &Arc<TapShared> {
        &self.shared
    }

    /// Network id
    pub fn network(&self) -> NetworkId {
        self.shared.network
    }

    /// Stop the event loop and wait for it.
    ///
    /// Every socket still owned by the Tap is aborted and marked closed.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.shared.commands.send(TapCommand::Stop);
        if handle.join().is_err() {
            warn!("tap {}: event loop panicked", self.shared.network);
        }
        self.shared.set_running(false);
        info!("tap {}: stopped", self.shared.network);
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Tap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tap").field("shared", &self.shared).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullSink;
    use tapsock_core::NoopNotifier;

    fn start_tap(config: TapConfig) -> Tap {
        Tap::start(
            config,
            StackConfig::default(),
            Arc::new(NullSink),
            Arc::new(NoopNotifier),
            Arc::new(SocketAccounting::new(16)),
        )
        .unwrap()
    }

    fn mac() -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, 1])
    }

    #[test]
    fn test_config_validation() {
        let config = TapConfig::new(NetworkId(1), mac());
        assert!(config.validate().is_ok());
        assert!(config.clone().with_mtu(100).validate().is_err());
        assert!(config.clone().with_mtu(MAX_MTU + 1).validate().is_err());

        let multicast = TapConfig::new(NetworkId(1), MacAddress([0x01, 0, 0, 0, 0, 1]));
        assert!(multicast.validate().is_err());
    }

    #[test]
    fn test_addresses_sorted_and_deduplicated() {
        let tap = start_tap(
            TapConfig::new(NetworkId(1), mac())
                .with_address("10.0.0.2/24".parse().unwrap())
                .with_address("10.0.0.2/24".parse().unwrap()),
        );
        let shared = tap.shared();

        assert!(shared.add_address("fd00::2/64".parse().unwrap()));
        assert!(shared.add_address("10.0.0.1/24".parse().unwrap()));
        assert!(!shared.add_address("10.0.0.1/24".parse().unwrap()));

        let listed: Vec<String> = shared.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(listed, vec!["10.0.0.1/24", "10.0.0.2/24", "fd00::2/64"]);
        assert_eq!(
            shared.first_address(AddressFamily::Inet).unwrap().to_string(),
            "10.0.0.1/24"
        );
        assert_eq!(
            shared.first_address(AddressFamily::Inet6).unwrap().to_string(),
            "fd00::2/64"
        );
        assert!(shared.has_ipv6());

        assert!(shared.remove_address(&"10.0.0.1/24".parse().unwrap()));
        assert!(!shared.remove_address(&"10.0.0.1/24".parse().unwrap()));
    }

    #[test]
    fn test_routes_keep_insertion_order() {
        let tap = start_tap(TapConfig::new(NetworkId(2), mac()));
        let shared = tap.shared();
        assert!(shared.add_route("10.0.0.0/8".parse().unwrap()));
        assert!(shared.add_route("0.0.0.0/0 via 10.0.0.254".parse().unwrap()));
        assert!(!shared.add_route("10.0.0.0/8".parse().unwrap()));
        let routes: Vec<String> = shared.routes().iter().map(|r| r.to_string()).collect();
        assert_eq!(routes, vec!["10.0.0.0/8", "0.0.0.0/0 via 10.0.0.254"]);
    }

    #[test]
    fn test_disabled_tap_drops_frames() {
        let tap = start_tap(TapConfig::new(NetworkId(3), mac()));
        let shared = tap.shared();

        shared.set_enabled(false);
        assert!(!shared.inject_frame(mac(), MacAddress::BROADCAST, 0x0806, &[0u8; 28]));
        assert_eq!(shared.stats().frames_dropped, 1);

        shared.set_enabled(true);
        assert!(shared.inject_frame(mac(), MacAddress::BROADCAST, 0x0806, &[0u8; 28]));
    }

    #[test]
    fn test_stop_marks_not_running() {
        let mut tap = start_tap(TapConfig::new(NetworkId(4), mac()));
        let shared = Arc::clone(tap.shared());
        assert!(shared.is_running());
        tap.stop();
        assert!(!shared.is_running());
        assert!(!shared.inject_raw(vec![0u8; 60]));
        assert_eq!(
            shared.request(|reply| TapCommand::Probe(reply)).unwrap_err(),
            SocketError::InterfaceDown
        );
    }
}
