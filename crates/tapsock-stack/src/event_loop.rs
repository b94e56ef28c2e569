//! Tap event loop: the single thread that owns a Tap's embedded stack.
//!
//! Application threads never touch the interface or its sockets. They post
//! [`TapCommand`]s on the Tap's channel; the loop applies them between polls,
//! synthesizes the stack callbacks (see `callbacks.rs`) and flushes outbound
//! frames to the [`FrameSink`].

use crate::addr::{IpCidr, Route, to_endpoint, to_listen_endpoint, to_stack_addr};
use crate::device::{EthernetFrame, FrameSink, TapDevice};
use crate::pcb::{Draining, Pcb, PcbKind, PcbTable, TcpPcb, Transport};
use crate::tap::TapShared;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use smoltcp::iface::{Config, Interface, PollResult, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::wire::{HardwareAddress, IpAddress, IpListenEndpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tapsock_core::{
    ProtocolState, ReadinessNotifier, SocketAccounting, SocketError, SocketId, SocketResult,
    SocketType, StackConfig, VirtualSocket,
};
use tracing::{debug, info, trace, warn};

/// Commands drained per loop turn before the stack is polled again
const MAX_COMMANDS_PER_TURN: usize = 1024;

/// Poll rounds per turn while the stack keeps reporting progress
const MAX_POLL_ROUNDS: usize = 8;

/// Upper bound on how long a closed socket may linger in the stack
pub(crate) const DRAIN_LIMIT: Duration = Duration::from_secs(60);

/// Requests posted to a Tap's event loop
pub(crate) enum TapCommand {
    /// Raw inbound Ethernet frame
    Frame(Vec<u8>),
    /// Reserve a local endpoint for a socket
    Bind {
        vs: Arc<VirtualSocket>,
        addr: SocketAddr,
        reply: Sender<SocketResult<SocketAddr>>,
    },
    /// Turn a bound stream socket into a listener
    Listen {
        id: SocketId,
        backlog: usize,
        reply: Sender<SocketResult<()>>,
    },
    /// Start an outbound stream connection
    Connect {
        vs: Arc<VirtualSocket>,
        addr: SocketAddr,
        reply: Sender<SocketResult<()>>,
    },
    /// Tear a listener down together with its unaccepted connections
    CloseListener { id: SocketId, reply: Sender<()> },
    /// Push the socket's option values into its stack sockets
    ApplyOptions(SocketId),
    /// Address assigned on the Tap
    AddAddress(IpCidr),
    /// Address removed from the Tap
    RemoveAddress(IpCidr),
    /// Default gateway added on the Tap
    AddRoute(Route),
    /// Run `on_polled` for one socket on the next turn
    Poll(SocketId),
    /// Reply once the command has been reached
    Probe(Sender<()>),
    /// Abort every socket and exit
    Stop,
}

/// Event-loop state; lives on the Tap thread only
pub(crate) struct EventLoop {
    pub(crate) shared: Arc<TapShared>,
    commands: Receiver<TapCommand>,
    sink: Arc<dyn FrameSink>,
    pub(crate) notifier: Arc<dyn ReadinessNotifier>,
    pub(crate) accounting: Arc<SocketAccounting>,
    pub(crate) config: StackConfig,
    device: TapDevice,
    iface: Interface,
    pub(crate) sockets: SocketSet<'static>,
    pub(crate) pcbs: PcbTable,
    nudged: Vec<SocketId>,
}

/// Current time in the embedded stack's clock
pub(crate) fn stack_now() -> smoltcp::time::Instant {
    smoltcp::time::Instant::now()
}

/// Convert a standard duration into the embedded stack's
pub(crate) fn to_stack_duration(d: Duration) -> smoltcp::time::Duration {
    smoltcp::time::Duration::from_millis(d.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Stream socket with the window sizes and options of `vs`
pub(crate) fn new_tcp_socket(config: &StackConfig, vs: &VirtualSocket) -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0u8; config.stack_rx_window]);
    let tx = tcp::SocketBuffer::new(vec![0u8; config.stack_tx_window]);
    let mut sock = tcp::Socket::new(rx, tx);
    sock.set_nagle_enabled(!vs.nodelay());
    sock.set_keep_alive(vs.keepalive().map(to_stack_duration));
    sock
}

fn new_udp_socket(config: &StackConfig) -> udp::Socket<'static> {
    let rx = udp::PacketBuffer::new(
        vec![udp::PacketMetadata::EMPTY; config.udp_packet_slots],
        vec![0u8; config.udp_buffer_size],
    );
    let tx = udp::PacketBuffer::new(
        vec![udp::PacketMetadata::EMPTY; config.udp_packet_slots],
        vec![0u8; config.udp_buffer_size],
    );
    udp::Socket::new(rx, tx)
}

impl EventLoop {
    /// Build the interface for `shared`; must run on the loop thread
    pub(crate) fn new(
        shared: Arc<TapShared>,
        commands: Receiver<TapCommand>,
        sink: Arc<dyn FrameSink>,
        notifier: Arc<dyn ReadinessNotifier>,
        accounting: Arc<SocketAccounting>,
    ) -> Self {
        let mut device = TapDevice::new(shared.mtu());

        let mut iface_config = Config::new(HardwareAddress::Ethernet(shared.mac().to_stack()));
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        iface_config.random_seed = seed ^ shared.network().0;
        let iface = Interface::new(iface_config, &mut device, stack_now());

        let mut event_loop = Self {
            config: shared.stack_config().clone(),
            shared,
            commands,
            sink,
            notifier,
            accounting,
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            pcbs: PcbTable::new(),
            nudged: Vec::new(),
        };
        for cidr in event_loop.shared.addresses() {
            event_loop.add_address(cidr);
        }
        for route in event_loop.shared.routes() {
            event_loop.add_route(route);
        }
        event_loop
    }

    /// Run until [`TapCommand::Stop`] or until every sender is gone
    pub(crate) fn run(mut self) {
        let network = self.shared.network();
        debug!("tap {}: event loop running", network);

        let poll_interval = self.config.poll_interval();
        let mut next_housekeeping = Instant::now() + self.housekeeping_interval();

        'outer: loop {
            let timeout = self.next_timeout(next_housekeeping);
            match self.commands.recv_timeout(timeout) {
                Ok(cmd) => {
                    if !self.handle_command(cmd) {
                        break 'outer;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("tap {}: command channel closed", network);
                    break 'outer;
                }
            }
            for _ in 0..MAX_COMMANDS_PER_TURN {
                let Ok(cmd) = self.commands.try_recv() else {
                    break;
                };
                if !self.handle_command(cmd) {
                    break 'outer;
                }
            }

            self.poll_stack();

            let now = Instant::now();
            let mut polled = self.pcbs.take_due(now, poll_interval);
            for id in self.nudged.drain(..) {
                if !polled.contains(&id) {
                    polled.push(id);
                }
            }
            if !polled.is_empty() {
                for id in polled {
                    self.on_polled(id);
                }
                self.poll_stack();
            }

            if now >= next_housekeeping {
                self.housekeeping();
                next_housekeeping = now + self.housekeeping_interval();
            }
            self.shared
                .set_pcb_count(self.pcbs.len() + self.pcbs.draining.len());
        }

        self.shutdown_all();
        self.shared.set_running(false);
        info!("tap {}: event loop exited", network);
    }

    fn housekeeping_interval(&self) -> Duration {
        self.config.discovery_interval(self.shared.has_ipv6())
    }

    /// Sleep until the earliest of the stack's own deadline, the protocol
    /// timer, the next due poll and housekeeping
    fn next_timeout(&mut self, next_housekeeping: Instant) -> Duration {
        let now = Instant::now();
        let mut timeout = self
            .config
            .protocol_timer()
            .min(next_housekeeping.saturating_duration_since(now));
        if let Some(due) = self.pcbs.next_poll_due() {
            timeout = timeout.min(due.saturating_duration_since(now));
        }
        if let Some(delay) = self.iface.poll_delay(stack_now(), &self.sockets) {
            timeout = timeout.min(Duration::from_micros(delay.total_micros()));
        }
        timeout
    }

    /// Apply one command; `false` stops the loop
    fn handle_command(&mut self, cmd: TapCommand) -> bool {
        match cmd {
            TapCommand::Frame(raw) => {
                let counters = self.shared.counters();
                counters.frames_in.fetch_add(1, Ordering::Relaxed);
                self.device.inject(raw);
            }
            TapCommand::Bind { vs, addr, reply } => {
                let _ = reply.send(self.bind(&vs, addr));
            }
            TapCommand::Listen { id, backlog, reply } => {
                let _ = reply.send(self.listen(id, backlog));
            }
            TapCommand::Connect { vs, addr, reply } => {
                let _ = reply.send(self.connect(&vs, addr));
            }
            TapCommand::CloseListener { id, reply } => {
                self.close_listener(id);
                let _ = reply.send(());
            }
            TapCommand::ApplyOptions(id) => self.apply_options(id),
            TapCommand::AddAddress(cidr) => self.add_address(cidr),
            TapCommand::RemoveAddress(cidr) => self.remove_address(cidr),
            TapCommand::AddRoute(route) => self.add_route(route),
            TapCommand::Poll(id) => self.nudged.push(id),
            TapCommand::Probe(reply) => {
                let _ = reply.send(());
            }
            TapCommand::Stop => return false,
        }
        true
    }

    // ------------------------------------------------------------------
    // Stack polling
    // ------------------------------------------------------------------

    /// Poll the interface, flush egress and dispatch callbacks until the
    /// stack stops making progress
    fn poll_stack(&mut self) {
        for _ in 0..MAX_POLL_ROUNDS {
            let result = self
                .iface
                .poll(stack_now(), &mut self.device, &mut self.sockets);
            self.flush_egress();
            let moved = self.dispatch();
            if result == PollResult::None && !moved && self.device.rx_pending() == 0 {
                break;
            }
        }
        self.flush_egress();
    }

    fn flush_egress(&mut self) {
        let network = self.shared.network();
        for raw in self.device.drain_tx() {
            let Some(frame) = EthernetFrame::parse(&raw) else {
                continue;
            };
            trace!(
                "tap {}: egress {} -> {} type {:#06x} ({} bytes)",
                network,
                frame.src,
                frame.dst,
                frame.ether_type,
                frame.payload.len()
            );
            self.shared
                .counters()
                .frames_out
                .fetch_add(1, Ordering::Relaxed);
            self.sink.send_frame(network, &frame);
        }
    }

    // ------------------------------------------------------------------
    // Control requests
    // ------------------------------------------------------------------

    fn bind(&mut self, vs: &Arc<VirtualSocket>, addr: SocketAddr) -> SocketResult<SocketAddr> {
        if self.pcbs.get(vs.id()).is_some() {
            return Err(SocketError::InvalidArgument("socket already bound"));
        }

        let (kind, transport) = match vs.socket_type() {
            SocketType::Stream => {
                let port = self.pcbs.reserve_port(Transport::Tcp, addr.port())?;
                let local = SocketAddr::new(addr.ip(), port);
                (PcbKind::TcpBound { local }, (Transport::Tcp, port))
            }
            SocketType::Datagram => {
                let port = self.pcbs.reserve_port(Transport::Udp, addr.port())?;
                let local = SocketAddr::new(addr.ip(), port);
                let mut sock = new_udp_socket(&self.config);
                if let Err(e) = sock.bind(to_listen_endpoint(local)) {
                    self.pcbs.release_port(Some((Transport::Udp, port)));
                    warn!("{}: datagram bind to {} rejected: {:?}", vs.id(), local, e);
                    return Err(SocketError::InvalidArgument("bind rejected by stack"));
                }
                let handle = self.sockets.add(sock);
                (PcbKind::Udp { handle }, (Transport::Udp, port))
            }
        };

        let local = SocketAddr::new(addr.ip(), transport.1);
        self.pcbs.insert(Pcb {
            vs: Arc::clone(vs),
            kind,
            port: Some(transport),
            next_poll: Instant::now() + self.config.poll_interval(),
        });
        vs.set_local_addr(local);
        vs.set_protocol_state(ProtocolState::Bound);
        debug!("{}: bound to {}", vs.id(), local);
        Ok(local)
    }

    fn listen(&mut self, id: SocketId, backlog: usize) -> SocketResult<()> {
        let Some(pcb) = self.pcbs.get_mut(id) else {
            return Err(SocketError::InvalidArgument("listen on unbound socket"));
        };
        let local = match &pcb.kind {
            PcbKind::TcpBound { local } => *local,
            PcbKind::Listener { .. } => return Ok(()),
            _ => return Err(SocketError::InvalidArgument("socket cannot listen")),
        };

        let endpoint = to_listen_endpoint(local);
        let mut handles = Vec::with_capacity(backlog);
        for _ in 0..backlog.max(1) {
            let mut sock = new_tcp_socket(&self.config, &pcb.vs);
            if let Err(e) = sock.listen(endpoint) {
                warn!("{}: listen on {} rejected: {:?}", id, local, e);
                for handle in handles {
                    self.sockets.remove(handle);
                }
                return Err(SocketError::InvalidArgument("listen rejected by stack"));
            }
            handles.push(self.sockets.add(sock));
        }

        pcb.kind = PcbKind::Listener { endpoint, handles };
        pcb.vs.set_protocol_state(ProtocolState::Listen);
        debug!("{}: listening on {} (backlog {})", id, local, backlog);
        Ok(())
    }

    /// Stream socket listening on `endpoint` with the options of `vs`
    pub(crate) fn new_listen_socket(
        &mut self,
        vs: &VirtualSocket,
        endpoint: IpListenEndpoint,
    ) -> Option<smoltcp::iface::SocketHandle> {
        let mut sock = new_tcp_socket(&self.config, vs);
        match sock.listen(endpoint) {
            Ok(()) => Some(self.sockets.add(sock)),
            Err(e) => {
                warn!("{}: cannot re-arm listener: {:?}", vs.id(), e);
                None
            }
        }
    }

    fn connect(&mut self, vs: &Arc<VirtualSocket>, addr: SocketAddr) -> SocketResult<()> {
        if !vs.family().matches(&addr.ip()) {
            return Err(SocketError::FamilyMismatch);
        }

        let bound = match self.pcbs.get(vs.id()) {
            None => None,
            Some(Pcb {
                kind: PcbKind::TcpBound { local },
                port: Some(port),
                ..
            }) => {
                let ip = (!local.ip().is_unspecified()).then(|| to_stack_addr(local.ip()));
                Some((ip, *port))
            }
            Some(Pcb {
                kind: PcbKind::Tcp(_),
                ..
            }) => return Err(SocketError::AlreadyConnected),
            Some(Pcb {
                kind: PcbKind::Listener { .. },
                ..
            }) => {
                return Err(SocketError::InvalidArgument("listening socket cannot connect"));
            }
            Some(_) => return Err(SocketError::WrongSocketType("stream")),
        };
        let (local_ip, port, reserved) = match bound {
            Some((ip, port)) => (ip, port, false),
            None => {
                let port = self.pcbs.reserve_port(Transport::Tcp, 0)?;
                (None, (Transport::Tcp, port), true)
            }
        };

        let mut sock = new_tcp_socket(&self.config, vs);
        let local = IpListenEndpoint {
            addr: local_ip,
            port: port.1,
        };
        if let Err(e) = sock.connect(self.iface.context(), to_endpoint(addr), local) {
            if reserved {
                self.pcbs.release_port(Some(port));
            }
            debug!("{}: connect to {} rejected: {:?}", vs.id(), addr, e);
            return Err(match e {
                tcp::ConnectError::InvalidState => SocketError::AlreadyConnected,
                tcp::ConnectError::Unaddressable => SocketError::NoRoute(addr.ip()),
            });
        }

        let handle = self.sockets.add(sock);
        self.pcbs.insert(Pcb {
            vs: Arc::clone(vs),
            kind: PcbKind::Tcp(TcpPcb::new(handle, tcp::State::SynSent, false)),
            port: Some(port),
            next_poll: Instant::now() + self.config.poll_interval(),
        });
        vs.set_peer_addr(addr);
        vs.set_protocol_state(ProtocolState::SynSent);
        debug!("{}: connecting to {}", vs.id(), addr);
        Ok(())
    }

    fn close_listener(&mut self, id: SocketId) {
        let Some(pcb) = self.pcbs.remove(id) else {
            return;
        };
        if let PcbKind::Listener { handles, .. } = pcb.kind {
            for handle in handles {
                self.sockets.remove(handle);
            }
        }
        self.pcbs.release_port(pcb.port);

        // Connections nobody accepted go down with their listener
        if let Some(queue) = pcb.vs.accept_queue() {
            for pending in queue.drain() {
                self.abort(pending.id());
                self.finish(&pending);
            }
        }
        self.finish(&pcb.vs);
        debug!("{}: listener closed", id);
    }

    /// Abort the stack side of a socket, leaving the RST to be flushed
    pub(crate) fn abort(&mut self, id: SocketId) {
        let Some(pcb) = self.pcbs.remove(id) else {
            return;
        };
        match pcb.kind {
            PcbKind::Tcp(stream) => {
                self.sockets.get_mut::<tcp::Socket>(stream.handle).abort();
                self.pcbs.draining.push(Draining {
                    handle: stream.handle,
                    port: pcb.port,
                    since: Instant::now(),
                });
            }
            PcbKind::Listener { handles, .. } => {
                for handle in handles {
                    self.sockets.remove(handle);
                }
                self.pcbs.release_port(pcb.port);
            }
            PcbKind::Udp { handle } => {
                self.sockets.remove(handle);
                self.pcbs.release_port(pcb.port);
            }
            PcbKind::TcpBound { .. } => self.pcbs.release_port(pcb.port),
        }
    }

    /// Mark `vs` closed and drop it from the Tap
    pub(crate) fn finish(&self, vs: &VirtualSocket) {
        vs.set_protocol_state(ProtocolState::Closed);
        if vs.mark_closed() {
            self.accounting.release();
        }
        self.shared.unregister(vs.id());
    }

    fn apply_options(&mut self, id: SocketId) {
        let Some(pcb) = self.pcbs.get(id) else {
            return;
        };
        let handles = match &pcb.kind {
            PcbKind::Tcp(stream) => vec![stream.handle],
            PcbKind::Listener { handles, .. } => handles.clone(),
            _ => return,
        };
        let nagle = !pcb.vs.nodelay();
        let keepalive = pcb.vs.keepalive().map(to_stack_duration);
        for handle in handles {
            let sock = self.sockets.get_mut::<tcp::Socket>(handle);
            sock.set_nagle_enabled(nagle);
            sock.set_keep_alive(keepalive);
        }
        trace!("{}: options applied", id);
    }

    // ------------------------------------------------------------------
    // Interface configuration
    // ------------------------------------------------------------------

    fn add_address(&mut self, cidr: IpCidr) {
        let stack_cidr = cidr.to_stack();
        let mut full = false;
        self.iface.update_ip_addrs(|addrs| {
            if !addrs.contains(&stack_cidr) && addrs.push(stack_cidr).is_err() {
                full = true;
            }
        });
        if full {
            warn!(
                "tap {}: address table full, {} not installed",
                self.shared.network(),
                cidr
            );
        }
    }

    fn remove_address(&mut self, cidr: IpCidr) {
        let stack_cidr = cidr.to_stack();
        self.iface
            .update_ip_addrs(|addrs| addrs.retain(|a| *a != stack_cidr));
    }

    fn add_route(&mut self, route: Route) {
        let Some(gateway) = route.default_gateway() else {
            return;
        };
        let installed = match to_stack_addr(gateway) {
            IpAddress::Ipv4(v4) => self.iface.routes_mut().add_default_ipv4_route(v4).is_ok(),
            IpAddress::Ipv6(v6) => self.iface.routes_mut().add_default_ipv6_route(v6).is_ok(),
        };
        if !installed {
            warn!(
                "tap {}: route table full, {} not installed",
                self.shared.network(),
                route
            );
        }
    }

    // ------------------------------------------------------------------
    // Housekeeping and teardown
    // ------------------------------------------------------------------

    fn housekeeping(&mut self) {
        let now = Instant::now();
        let mut kept = Vec::with_capacity(self.pcbs.draining.len());
        for entry in std::mem::take(&mut self.pcbs.draining) {
            let sock = self.sockets.get_mut::<tcp::Socket>(entry.handle);
            let expired = now.duration_since(entry.since) >= DRAIN_LIMIT;
            if sock.state() == tcp::State::Closed || expired {
                if expired {
                    sock.abort();
                }
                self.sockets.remove(entry.handle);
                self.pcbs.release_port(entry.port);
            } else {
                kept.push(entry);
            }
        }
        self.pcbs.draining = kept;

        let stats = self.shared.stats();
        trace!(
            "tap {}: {} pcbs, {} draining, frames in/out/dropped {}/{}/{}",
            self.shared.network(),
            self.pcbs.len(),
            self.pcbs.draining.len(),
            stats.frames_in,
            stats.frames_out,
            stats.frames_dropped
        );
    }

    fn shutdown_all(&mut self) {
        for id in self.pcbs.ids() {
            if let Some(pcb) = self.pcbs.get(id) {
                let vs = Arc::clone(&pcb.vs);
                self.abort(id);
                self.finish(&vs);
            }
        }
        // Flush the resets
        let _ = self
            .iface
            .poll(stack_now(), &mut self.device, &mut self.sockets);
        self.flush_egress();

        let orphans: Vec<Arc<VirtualSocket>> = self.shared.lock_connections().clone();
        for vs in orphans {
            if let Some(queue) = vs.accept_queue() {
                for pending in queue.drain() {
                    self.finish(&pending);
                }
            }
            self.finish(&vs);
        }
        self.shared.set_pcb_count(0);
    }
}
