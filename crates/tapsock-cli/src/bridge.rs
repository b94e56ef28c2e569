//! UDP bridge carrying Tap frames between nodes.
//!
//! Each datagram holds one Ethernet frame prefixed by the 8-byte big-endian
//! network id it belongs to. Outbound frames from the event loop are queued
//! without blocking and flushed to every configured peer.

use crate::config::BridgeConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tapsock_core::{ETHERNET_HEADER_SIZE, NetworkId};
use tapsock_stack::{EthernetFrame, FrameSink, NetworkService};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

/// Network id prefix on every bridge datagram
pub const NETWORK_ID_SIZE: usize = 8;

/// Largest datagram the bridge reads
const RECV_BUFFER_SIZE: usize = 65536;

/// Kernel socket buffer size requested for the bridge socket
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Wrap a frame for the wire
pub fn encode_datagram(network: NetworkId, frame: &EthernetFrame) -> Vec<u8> {
    let raw = frame.to_bytes();
    let mut out = Vec::with_capacity(NETWORK_ID_SIZE + raw.len());
    out.extend_from_slice(&network.0.to_be_bytes());
    out.extend_from_slice(&raw);
    out
}

/// Split a datagram into network id and raw frame; `None` for runts
pub fn decode_datagram(datagram: &[u8]) -> Option<(NetworkId, &[u8])> {
    if datagram.len() < NETWORK_ID_SIZE + ETHERNET_HEADER_SIZE {
        return None;
    }
    let (id, frame) = datagram.split_at(NETWORK_ID_SIZE);
    let id: [u8; NETWORK_ID_SIZE] = id.try_into().ok()?;
    Some((NetworkId(u64::from_be_bytes(id)), frame))
}

/// Bridge counters
#[derive(Debug, Default)]
pub struct BridgeStats {
    /// Frames queued for sending
    pub frames_out: AtomicU64,
    /// Frames dropped because the outbound queue was full
    pub frames_dropped: AtomicU64,
    /// Datagrams received
    pub datagrams_in: AtomicU64,
    /// Datagrams discarded as runts or for unknown networks
    pub datagrams_discarded: AtomicU64,
}

/// Frame sink feeding the bridge's outbound queue
pub struct BridgeSink {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<BridgeStats>,
}

impl FrameSink for BridgeSink {
    fn send_frame(&self, network: NetworkId, frame: &EthernetFrame) {
        match self.tx.try_send(encode_datagram(network, frame)) {
            Ok(()) => {
                self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                warn!("bridge queue full, dropping frame for {}", network);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// UDP transport between tapsock nodes
pub struct Bridge {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    /// Bind the bridge socket. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the socket cannot
    /// be created.
    pub fn bind(config: &BridgeConfig) -> anyhow::Result<Self> {
        let addr = config.listen_addr()?;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        Ok(Self {
            socket: Arc::new(socket),
            peers: config.peer_addrs()?,
            tx,
            rx,
            stats: Arc::new(BridgeStats::default()),
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sink to attach Taps with
    pub fn sink(&self) -> Arc<BridgeSink> {
        Arc::new(BridgeSink {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Counters shared with the sinks
    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Pump frames until the socket fails
    ///
    /// # Errors
    ///
    /// Returns an error if receiving from the socket fails.
    pub async fn run(self, service: Arc<NetworkService>) -> anyhow::Result<()> {
        let Self {
            socket,
            peers,
            tx,
            mut rx,
            stats,
        } = self;
        // The sinks hold their own senders
        drop(tx);

        info!(
            "bridge on {} with {} peer(s)",
            socket.local_addr()?,
            peers.len()
        );

        let sender = Arc::clone(&socket);
        let send_loop = tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                for peer in &peers {
                    if let Err(e) = sender.send_to(&datagram, peer).await {
                        warn!("bridge send to {} failed: {}", peer, e);
                    }
                }
            }
            debug!("bridge outbound queue closed");
        });

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let result = loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => break Err(e.into()),
            };
            stats.datagrams_in.fetch_add(1, Ordering::Relaxed);

            let Some((network, frame)) = decode_datagram(&buf[..n]) else {
                debug!("runt datagram ({} bytes) from {}", n, from);
                stats.datagrams_discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match service.tap(network) {
                Some(tap) => {
                    if !tap.inject_raw(frame.to_vec()) {
                        trace!("tap {} refused frame from {}", network, from);
                    }
                }
                None => {
                    trace!("no tap for network {} (from {})", network, from);
                    stats.datagrams_discarded.fetch_add(1, Ordering::Relaxed);
                }
            }
        };

        send_loop.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapsock_stack::{ETHERTYPE_IPV4, MacAddress};

    fn frame() -> EthernetFrame {
        EthernetFrame {
            dst: MacAddress::BROADCAST,
            src: MacAddress([0x02, 0, 0, 0, 0, 7]),
            ether_type: ETHERTYPE_IPV4,
            payload: vec![0x45, 0, 0, 20],
        }
    }

    #[test]
    fn test_datagram_layout() {
        let datagram = encode_datagram(NetworkId(0x0102_0304_0506_0708), &frame());
        assert_eq!(&datagram[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&datagram[8..14], &[0xFF; 6]);

        let (network, raw) = decode_datagram(&datagram).unwrap();
        assert_eq!(network, NetworkId(0x0102_0304_0506_0708));
        assert_eq!(EthernetFrame::parse(raw).unwrap(), frame());
    }

    #[test]
    fn test_runt_datagram_rejected() {
        assert!(decode_datagram(&[0u8; NETWORK_ID_SIZE + ETHERNET_HEADER_SIZE - 1]).is_none());
        assert!(decode_datagram(&[0u8; NETWORK_ID_SIZE + ETHERNET_HEADER_SIZE]).is_some());
    }

    #[tokio::test]
    async fn test_sink_drops_when_full() {
        let config = BridgeConfig {
            listen: "127.0.0.1:0".to_string(),
            peers: Vec::new(),
            queue_depth: 1,
        };
        let bridge = Bridge::bind(&config).unwrap();
        let sink = bridge.sink();

        sink.send_frame(NetworkId(1), &frame());
        sink.send_frame(NetworkId(1), &frame());

        let stats = bridge.stats();
        assert_eq!(stats.frames_out.load(Ordering::Relaxed), 1);
        assert_eq!(stats.frames_dropped.load(Ordering::Relaxed), 1);
    }
}
