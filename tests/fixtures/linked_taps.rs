//! Two-node fixture: a pair of services whose Taps are wired back to back
//!
//! Every frame one Tap emits is injected into the other, giving a lossless
//! in-memory Ethernet segment between `10.0.0.1` (node A) and `10.0.0.2`
//! (node B).
//!
//! # Example
//!
//! ```no_run
//! use tapsock_core::{AddressFamily, SocketType};
//! use tapsock_integration_tests::fixtures::LinkedTaps;
//!
//! let net = LinkedTaps::new();
//! let fd = net.a.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
//! net.a.connect(fd, net.b_addr(9000)).unwrap();
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tapsock_core::{
    NetworkId, ReadinessNotifier, ReadinessTable, SocketError, SocketResult, StackConfig,
};
use tapsock_stack::{EthernetFrame, FrameSink, MacAddress, NetworkService, TapConfig, TapShared};

/// Network both Taps join
pub const NETWORK: NetworkId = NetworkId(0x00ab_cdef_0000_0001);

/// Address of node A
pub const ADDR_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

/// Address of node B
pub const ADDR_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

/// Sink delivering frames straight into the peer Tap
struct CrossSink {
    peer: OnceLock<Weak<TapShared>>,
}

impl FrameSink for CrossSink {
    fn send_frame(&self, _network: NetworkId, frame: &EthernetFrame) {
        if let Some(peer) = self.peer.get().and_then(Weak::upgrade) {
            peer.inject_raw(frame.to_bytes());
        }
    }
}

/// Stack configuration with small buffers and short timers
pub fn test_config() -> StackConfig {
    StackConfig {
        rx_buffer_size: 64 * 1024,
        tx_buffer_size: 64 * 1024,
        max_sockets: 64,
        poll_interval_ms: 20,
        close_poll_interval_ms: 10,
        connect_timeout_ms: 10_000,
        ..StackConfig::default()
    }
}

/// Two services on one in-memory segment
pub struct LinkedTaps {
    /// Node A
    pub a: Arc<NetworkService>,
    /// Node B
    pub b: Arc<NetworkService>,
    /// Node A's Tap
    pub tap_a: Arc<TapShared>,
    /// Node B's Tap
    pub tap_b: Arc<TapShared>,
    /// Readiness reported by node A
    pub ready_a: Arc<ReadinessTable>,
    /// Readiness reported by node B
    pub ready_b: Arc<ReadinessTable>,
}

impl LinkedTaps {
    /// Both nodes with [`test_config`]
    pub fn new() -> Self {
        Self::with_configs(test_config(), test_config())
    }

    /// Nodes with individual stack configurations
    pub fn with_configs(config_a: StackConfig, config_b: StackConfig) -> Self {
        let ready_a = Arc::new(ReadinessTable::new());
        let ready_b = Arc::new(ReadinessTable::new());
        let a = Arc::new(NetworkService::with_notifier(
            config_a,
            Arc::clone(&ready_a) as Arc<dyn ReadinessNotifier>,
        ));
        let b = Arc::new(NetworkService::with_notifier(
            config_b,
            Arc::clone(&ready_b) as Arc<dyn ReadinessNotifier>,
        ));

        let sink_a = Arc::new(CrossSink {
            peer: OnceLock::new(),
        });
        let sink_b = Arc::new(CrossSink {
            peer: OnceLock::new(),
        });

        let tap_a = a
            .attach_tap(
                TapConfig::new(NETWORK, MacAddress([0x02, 0, 0, 0, 0, 0x0a]))
                    .with_address(format!("{}/24", ADDR_A).parse().unwrap()),
                Arc::clone(&sink_a) as Arc<dyn FrameSink>,
            )
            .unwrap();
        let tap_b = b
            .attach_tap(
                TapConfig::new(NETWORK, MacAddress([0x02, 0, 0, 0, 0, 0x0b]))
                    .with_address(format!("{}/24", ADDR_B).parse().unwrap()),
                Arc::clone(&sink_b) as Arc<dyn FrameSink>,
            )
            .unwrap();

        let _ = sink_a.peer.set(Arc::downgrade(&tap_b));
        let _ = sink_b.peer.set(Arc::downgrade(&tap_a));

        Self {
            a,
            b,
            tap_a,
            tap_b,
            ready_a,
            ready_b,
        }
    }

    /// Endpoint on node A
    pub fn a_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(ADDR_A, port)
    }

    /// Endpoint on node B
    pub fn b_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(ADDR_B, port)
    }
}

impl Default for LinkedTaps {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry `op` while it would block, for at most `timeout`
pub fn retry<T>(timeout: Duration, mut op: impl FnMut() -> SocketResult<T>) -> SocketResult<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match op() {
            Err(SocketError::WouldBlock) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(2));
            }
            other => return other,
        }
    }
}

/// Wait until `check` holds, for at most `timeout`
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}
