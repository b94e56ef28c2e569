//! Protocol control block table owned by a Tap's event loop.
//!
//! Maps each virtual socket to its handle(s) inside the embedded stack together
//! with the bookkeeping needed to synthesize stack callbacks. Nothing here is
//! shared with application threads.

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use smoltcp::wire::IpListenEndpoint;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tapsock_core::{EPHEMERAL_PORTS, ProtocolState, SocketError, SocketId, SocketResult, VirtualSocket};

/// Transport of a reserved port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Transport {
    Tcp,
    Udp,
}

/// Embedded stack side of one virtual socket
#[derive(Debug)]
pub(crate) enum PcbKind {
    /// Stream socket with a reserved local endpoint and no stack socket yet
    TcpBound { local: SocketAddr },
    /// Connecting or connected stream
    Tcp(TcpPcb),
    /// Listening stream; one stack socket per backlog slot
    Listener {
        endpoint: IpListenEndpoint,
        handles: Vec<SocketHandle>,
    },
    /// Bound datagram socket
    Udp { handle: SocketHandle },
}

/// Callback bookkeeping of a stream PCB
#[derive(Debug)]
pub(crate) struct TcpPcb {
    pub handle: SocketHandle,
    /// State seen at the previous dispatch
    pub last_state: tcp::State,
    /// Bytes the stack still held in its send queue after the last hand-off
    pub unacked: usize,
    /// `on_connected` already delivered (or not applicable)
    pub connected_reported: bool,
    /// FIN requested from the stack
    pub close_issued: bool,
    /// When deferred teardown started waiting for the TX ring to flush
    pub shutdown_since: Option<Instant>,
}

impl TcpPcb {
    pub fn new(handle: SocketHandle, state: tcp::State, connected: bool) -> Self {
        Self {
            handle,
            last_state: state,
            unacked: 0,
            connected_reported: connected,
            close_issued: false,
            shutdown_since: None,
        }
    }
}

/// One entry of the table
#[derive(Debug)]
pub(crate) struct Pcb {
    pub vs: Arc<VirtualSocket>,
    pub kind: PcbKind,
    /// Reserved local port, released when the PCB is reaped
    pub port: Option<(Transport, u16)>,
    /// Next scheduled `on_polled`
    pub next_poll: Instant,
}

/// Stack socket whose virtual socket already reached `Closed` but which still
/// finishes its close handshake inside the stack
#[derive(Debug)]
pub(crate) struct Draining {
    pub handle: SocketHandle,
    pub port: Option<(Transport, u16)>,
    pub since: Instant,
}

/// PCB table with the per-interface port reservations
#[derive(Debug, Default)]
pub(crate) struct PcbTable {
    pcbs: HashMap<SocketId, Pcb>,
    pub draining: Vec<Draining>,
    ports: HashSet<(Transport, u16)>,
    next_ephemeral: u16,
}

impl PcbTable {
    pub fn new() -> Self {
        Self {
            next_ephemeral: *EPHEMERAL_PORTS.start(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, pcb: Pcb) {
        self.pcbs.insert(pcb.vs.id(), pcb);
    }

    pub fn get(&self, id: SocketId) -> Option<&Pcb> {
        self.pcbs.get(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Pcb> {
        self.pcbs.get_mut(&id)
    }

    pub fn remove(&mut self, id: SocketId) -> Option<Pcb> {
        self.pcbs.remove(&id)
    }

    pub fn ids(&self) -> Vec<SocketId> {
        self.pcbs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pcbs.len()
    }

    /// Earliest scheduled `on_polled`
    pub fn next_poll_due(&self) -> Option<Instant> {
        self.pcbs.values().map(|p| p.next_poll).min()
    }

    /// PCBs whose poll is due, rescheduled `interval` from `now`
    pub fn take_due(&mut self, now: Instant, interval: Duration) -> Vec<SocketId> {
        self.pcbs
            .values_mut()
            .filter(|p| p.next_poll <= now)
            .map(|p| {
                p.next_poll = now + interval;
                p.vs.id()
            })
            .collect()
    }

    /// Reserve `port` for `transport`, allocating an ephemeral port for 0.
    pub fn reserve_port(&mut self, transport: Transport, port: u16) -> SocketResult<u16> {
        if port != 0 {
            if !self.ports.insert((transport, port)) {
                return Err(SocketError::AddressInUse(port));
            }
            return Ok(port);
        }

        let range = EPHEMERAL_PORTS;
        let span = usize::from(range.end() - range.start()) + 1;
        for _ in 0..span {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == *range.end() {
                *range.start()
            } else {
                candidate + 1
            };
            if self.ports.insert((transport, candidate)) {
                return Ok(candidate);
            }
        }
        Err(SocketError::NoBufferSpace)
    }

    pub fn release_port(&mut self, port: Option<(Transport, u16)>) {
        if let Some(key) = port {
            self.ports.remove(&key);
        }
    }
}

/// Map the embedded stack's TCP state onto the published snapshot
pub(crate) fn protocol_state(state: tcp::State) -> ProtocolState {
    match state {
        tcp::State::Closed => ProtocolState::Closed,
        tcp::State::Listen => ProtocolState::Listen,
        tcp::State::SynSent => ProtocolState::SynSent,
        tcp::State::SynReceived => ProtocolState::SynReceived,
        tcp::State::Established => ProtocolState::Established,
        tcp::State::FinWait1 => ProtocolState::FinWait1,
        tcp::State::FinWait2 => ProtocolState::FinWait2,
        tcp::State::CloseWait => ProtocolState::CloseWait,
        tcp::State::Closing => ProtocolState::Closing,
        tcp::State::LastAck => ProtocolState::LastAck,
        tcp::State::TimeWait => ProtocolState::TimeWait,
    }
}

/// States in which the remote side has already sent its FIN
pub(crate) fn peer_finished(state: tcp::State) -> bool {
    matches!(
        state,
        tcp::State::CloseWait | tcp::State::LastAck | tcp::State::Closing | tcp::State::TimeWait
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_explicit_port() {
        let mut table = PcbTable::new();
        assert_eq!(table.reserve_port(Transport::Tcp, 9000), Ok(9000));
        assert_eq!(
            table.reserve_port(Transport::Tcp, 9000),
            Err(SocketError::AddressInUse(9000))
        );
        // Same number on the other transport is independent
        assert_eq!(table.reserve_port(Transport::Udp, 9000), Ok(9000));

        table.release_port(Some((Transport::Tcp, 9000)));
        assert_eq!(table.reserve_port(Transport::Tcp, 9000), Ok(9000));
    }

    #[test]
    fn test_ephemeral_allocation_skips_used() {
        let mut table = PcbTable::new();
        let start = *EPHEMERAL_PORTS.start();
        table.reserve_port(Transport::Tcp, start).unwrap();

        let port = table.reserve_port(Transport::Tcp, 0).unwrap();
        assert_eq!(port, start + 1);
        let next = table.reserve_port(Transport::Tcp, 0).unwrap();
        assert_eq!(next, start + 2);
        assert!(EPHEMERAL_PORTS.contains(&next));
    }

    #[test]
    fn test_poll_schedule() {
        use tapsock_core::{AddressFamily, SocketType, StackConfig};

        let mut table = PcbTable::new();
        let now = Instant::now();
        let interval = Duration::from_millis(100);
        for (id, offset) in [(1, 0), (2, 500)] {
            table.insert(Pcb {
                vs: Arc::new(VirtualSocket::new(
                    SocketId(id),
                    SocketType::Stream,
                    AddressFamily::Inet,
                    &StackConfig::default(),
                )),
                kind: PcbKind::TcpBound {
                    local: "10.0.0.1:80".parse().unwrap(),
                },
                port: None,
                next_poll: now + Duration::from_millis(offset),
            });
        }

        assert_eq!(table.next_poll_due(), Some(now));
        assert_eq!(table.take_due(now, interval), vec![SocketId(1)]);
        assert_eq!(table.next_poll_due(), Some(now + interval));
        assert!(table.take_due(now, interval).is_empty());
    }

    #[test]
    fn test_protocol_state_mapping() {
        assert_eq!(protocol_state(tcp::State::Established), ProtocolState::Established);
        assert!(protocol_state(tcp::State::TimeWait).is_terminal());
        assert!(peer_finished(tcp::State::CloseWait));
        assert!(!peer_finished(tcp::State::FinWait2));
    }
}
