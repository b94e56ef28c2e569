//! Link layer: Ethernet frames and the in-memory device the embedded stack polls.
//!
//! Inbound frames arrive from the external virtual-network transport through
//! the Tap's control channel and are queued on the [`TapDevice`]. Outbound
//! frames produced by the stack are collected on the same device and handed to
//! a [`FrameSink`] after every poll.

use serde::{Deserialize, Serialize};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tapsock_core::{ETHERNET_HEADER_SIZE, NetworkId};

/// EtherType of IPv4
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType of ARP
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType of IPv6
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// 48-bit Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast address
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Check if the group bit is set
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Derive a locally administered unicast MAC from a network id and a node id.
    ///
    /// The first octet has the local bit set and the group bit clear; the
    /// remaining octets mix the node id with the network id so the same node
    /// gets distinct MACs on distinct networks.
    pub fn from_network_and_node(network: NetworkId, node: u64) -> Self {
        let mut first = ((network.0 & 0xFE) as u8) | 0x02;
        if first == 0x52 {
            // Avoid a prefix commonly used by hypervisors
            first = 0x32;
        }
        let mixed = (node ^ (network.0 >> 8)) & 0xFF_FFFF_FFFF;
        let b = mixed.to_be_bytes();
        Self([first, b[3], b[4], b[5], b[6], b[7]])
    }

    /// Embedded stack representation
    pub fn to_stack(self) -> smoltcp::wire::EthernetAddress {
        smoltcp::wire::EthernetAddress(self.0)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut out {
            let part = parts.next().ok_or_else(|| format!("invalid MAC: {s}"))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| format!("invalid MAC: {s}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid MAC: {s}"));
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// One Ethernet frame split into its header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    /// Destination MAC
    pub dst: MacAddress,
    /// Source MAC
    pub src: MacAddress,
    /// EtherType
    pub ether_type: u16,
    /// Frame payload
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    /// Parse a raw frame; `None` if shorter than the header
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < ETHERNET_HEADER_SIZE {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&raw[0..6]);
        src.copy_from_slice(&raw[6..12]);
        Some(Self {
            dst: MacAddress(dst),
            src: MacAddress(src),
            ether_type: u16::from_be_bytes([raw[12], raw[13]]),
            payload: raw[ETHERNET_HEADER_SIZE..].to_vec(),
        })
    }

    /// Serialize into raw wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_frame(self.src, self.dst, self.ether_type, &self.payload)
    }
}

/// Build a raw frame from its parts
pub fn encode_frame(src: MacAddress, dst: MacAddress, ether_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
    raw.extend_from_slice(&dst.0);
    raw.extend_from_slice(&src.0);
    raw.extend_from_slice(&ether_type.to_be_bytes());
    raw.extend_from_slice(payload);
    raw
}

/// Outbound side of the external virtual-network transport
///
/// Called from the Tap event-loop thread. Implementations must never block;
/// queue or drop instead.
pub trait FrameSink: Send + Sync {
    /// Transmit one frame on `network`
    fn send_frame(&self, network: NetworkId, frame: &EthernetFrame);
}

/// Sink that discards every frame
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn send_frame(&self, _network: NetworkId, _frame: &EthernetFrame) {}
}

/// In-memory device backing one Tap's interface
#[derive(Debug)]
pub struct TapDevice {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: Vec<Vec<u8>>,
    mtu: usize,
}

impl TapDevice {
    /// Create a device with an IP-level MTU of `mtu`
    pub fn new(mtu: usize) -> Self {
        Self {
            rx_queue: VecDeque::new(),
            tx_queue: Vec::new(),
            mtu,
        }
    }

    /// Queue a raw inbound frame
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.rx_queue.push_back(frame);
    }

    /// Take every frame the stack transmitted since the last call
    pub fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx_queue)
    }

    /// Inbound frames not yet consumed by the stack
    pub fn rx_pending(&self) -> usize {
        self.rx_queue.len()
    }
}

impl Device for TapDevice {
    type RxToken<'a>
        = TapRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TapTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx_queue.pop_front()?;
        Some((
            TapRxToken(frame),
            TapTxToken {
                queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TapTxToken {
            queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu + ETHERNET_HEADER_SIZE;
        caps.medium = Medium::Ethernet;
        caps
    }
}

/// Receive token owning one inbound frame
pub struct TapRxToken(Vec<u8>);

impl RxToken for TapRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

/// Transmit token appending to the device's outbound queue
pub struct TapTxToken<'a> {
    queue: &'a mut Vec<Vec<u8>>,
}

impl TxToken for TapTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push(buffer);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parse_roundtrip() {
        let src = MacAddress([0x02, 0, 0, 0, 0, 1]);
        let dst = MacAddress::BROADCAST;
        let raw = encode_frame(src, dst, ETHERTYPE_ARP, &[1, 2, 3]);
        assert_eq!(raw.len(), ETHERNET_HEADER_SIZE + 3);

        let frame = EthernetFrame::parse(&raw).unwrap();
        assert_eq!(frame.src, src);
        assert!(frame.dst.is_broadcast());
        assert_eq!(frame.ether_type, ETHERTYPE_ARP);
        assert_eq!(frame.payload, vec![1, 2, 3]);
        assert_eq!(frame.to_bytes(), raw);
    }

    #[test]
    fn test_frame_parse_short() {
        assert!(EthernetFrame::parse(&[0u8; 13]).is_none());
    }

    #[test]
    fn test_mac_parse_display() {
        let mac: MacAddress = "32:aa:bb:cc:dd:0e".parse().unwrap();
        assert_eq!(mac.0, [0x32, 0xaa, 0xbb, 0xcc, 0xdd, 0x0e]);
        assert_eq!(mac.to_string(), "32:aa:bb:cc:dd:0e");
        assert!("32:aa:bb".parse::<MacAddress>().is_err());
        assert!("32:aa:bb:cc:dd:0e:ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_from_network_is_local_unicast() {
        let mac = MacAddress::from_network_and_node(NetworkId(0x8056_c2e2_1c00_0001), 0x12_3456_7890);
        assert_eq!(mac.0[0] & 0x02, 0x02);
        assert!(!mac.is_multicast());

        let other = MacAddress::from_network_and_node(NetworkId(0x1111_2222_3333_4400), 0x12_3456_7890);
        assert_ne!(mac, other);
    }

    #[test]
    fn test_device_queues() {
        let mut device = TapDevice::new(1500);
        assert_eq!(device.capabilities().max_transmission_unit, 1514);

        device.inject(vec![1, 2, 3]);
        assert_eq!(device.rx_pending(), 1);
        let (rx, _tx) = device.receive(Instant::from_millis(0)).unwrap();
        let seen = rx.consume(|buf| buf.to_vec());
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(device.receive(Instant::from_millis(0)).is_none());

        let tx = device.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(4, |buf| buf.copy_from_slice(b"abcd"));
        assert_eq!(device.drain_tx(), vec![b"abcd".to_vec()]);
        assert!(device.drain_tx().is_empty());
    }
}
