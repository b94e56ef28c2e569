//! Stack driver callbacks.
//!
//! The embedded stack is polled rather than callback driven, so after every
//! poll the event loop compares each PCB with what it saw last time and
//! derives the classic callbacks from the difference:
//!
//! | callback       | derived from                                           |
//! |----------------|--------------------------------------------------------|
//! | `on_connected` | a connecting socket reaching a synchronized state      |
//! | `on_received`  | data (or a FIN) waiting in the stack's receive queue   |
//! | `on_sent`      | the stack's send queue shrinking                       |
//! | `on_error`     | an unexpected transition to `Closed`                   |
//! | `on_accepted`  | a listening slot leaving `Listen`/`SynReceived`        |
//! | `on_polled`    | the per-connection timer or an explicit nudge          |

use crate::addr::{from_endpoint, to_endpoint};
use crate::event_loop::{DRAIN_LIMIT, EventLoop, to_stack_duration};
use crate::pcb::{Draining, Pcb, PcbKind, TcpPcb, peer_finished, protocol_state};
use crate::tap::TapShared;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::{tcp, udp};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tapsock_core::framing::{self, HEADER_SIZE};
use tapsock_core::{
    AddressFamily, ReadinessNotifier, SocketId, SocketType, StackErrorKind, VirtualSocket, VsState,
};
use tracing::{debug, trace, warn};

/// What the loop does with a PCB after servicing it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    /// Release the PCB; `drain` keeps the stack socket until its close
    /// handshake finishes
    Reap {
        handle: Option<SocketHandle>,
        drain: bool,
    },
}

/// Shared context borrowed from the loop while a PCB is serviced
struct Callbacks<'a> {
    shared: &'a TapShared,
    notifier: &'a dyn ReadinessNotifier,
}

impl Callbacks<'_> {
    fn notify_readable(&self, vs: &VirtualSocket) {
        let fd = vs.fd();
        if fd >= 0 {
            self.notifier.set_readable(fd, true);
        }
    }

    fn notify_writable(&self, vs: &VirtualSocket) {
        let fd = vs.fd();
        if fd >= 0 {
            self.notifier.set_writable(fd, true);
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    fn service_stream(
        &self,
        vs: &VirtualSocket,
        pcb: &mut TcpPcb,
        sock: &mut tcp::Socket<'static>,
        polled: bool,
    ) -> (bool, Disposition) {
        let state = sock.state();
        let prev = pcb.last_state;
        pcb.last_state = state;

        if !pcb.connected_reported
            && !matches!(
                state,
                tcp::State::Closed | tcp::State::Listen | tcp::State::SynSent | tcp::State::SynReceived
            )
        {
            pcb.connected_reported = true;
            self.on_connected(vs, sock);
        }

        let mut moved = self.on_received(vs, sock);

        if peer_finished(state) && !sock.can_recv() && !vs.is_peer_closed() {
            debug!("{}: peer closed its side", vs.id());
            vs.mark_peer_closed();
            self.notify_readable(vs);
        }

        let queued = sock.send_queue();
        if pcb.unacked > queued {
            self.on_sent(vs, pcb.unacked - queued);
        }
        pcb.unacked = queued;

        moved |= self.hand_off_stream(vs, pcb, sock);

        if state == tcp::State::Closed && prev != tcp::State::Closed {
            self.on_error(vs, prev, pcb.close_issued);
        }
        // Published after the error so waiters never see Closed without it
        vs.set_protocol_state(protocol_state(state));

        if vs.is_write_shutdown()
            && !pcb.close_issued
            && vs.tx().pending() == 0
            && sock.may_send()
        {
            debug!("{}: write side shut down, sending FIN", vs.id());
            sock.close();
            pcb.close_issued = true;
            moved = true;
        }

        let disposition = if polled && vs.state() == VsState::ShouldShutdown {
            self.deferred_shutdown(vs, pcb, sock)
        } else {
            Disposition::Keep
        };
        (moved, disposition)
    }

    fn on_connected(&self, vs: &VirtualSocket, sock: &tcp::Socket<'static>) {
        if let Some(local) = sock.local_endpoint() {
            vs.set_local_addr(from_endpoint(local));
        }
        if vs.mark_connected() {
            debug!(
                "{}: connected {:?} -> {:?}",
                vs.id(),
                vs.local_addr(),
                vs.peer_addr()
            );
        }
        self.notify_writable(vs);
    }

    /// Move stack data into the RX ring as far as the ring has room. What does
    /// not fit stays in the stack, whose window then closes.
    fn on_received(&self, vs: &VirtualSocket, sock: &mut tcp::Socket<'static>) -> bool {
        if !sock.can_recv() {
            return false;
        }
        if vs.is_read_shutdown() {
            let discarded = sock.recv(|buf| (buf.len(), buf.len())).unwrap_or(0);
            trace!("{}: read side shut down, discarded {} bytes", vs.id(), discarded);
            return discarded > 0;
        }

        let mut total = 0;
        {
            let mut rx = vs.rx();
            while rx.free() > 0 && sock.can_recv() {
                let n = match sock.recv(|buf| {
                    let n = rx.produce(buf);
                    (n, n)
                }) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if n == 0 {
                    break;
                }
                total += n;
            }
            if rx.is_full() && sock.can_recv() {
                trace!(
                    "{}: rx ring full, {} bytes held back",
                    vs.id(),
                    sock.recv_queue()
                );
            }
        }

        if total > 0 {
            trace!("{}: received {} bytes", vs.id(), total);
            self.shared
                .counters()
                .bytes_in
                .fetch_add(total as u64, Ordering::Relaxed);
            self.notify_readable(vs);
        }
        total > 0
    }

    fn on_sent(&self, vs: &VirtualSocket, acked: usize) {
        let released = vs.tx().acknowledged(acked);
        trace!("{}: {} bytes acknowledged ({} released)", vs.id(), acked, released);
        self.notify_writable(vs);
    }

    /// Hand pending TX bytes to the stack
    fn hand_off_stream(
        &self,
        vs: &VirtualSocket,
        pcb: &mut TcpPcb,
        sock: &mut tcp::Socket<'static>,
    ) -> bool {
        if pcb.close_issued || !sock.may_send() {
            return false;
        }
        let mut tx = vs.tx();
        if tx.pending() == 0 {
            return false;
        }

        let sent = {
            let (first, second) = tx.pending_slices();
            let mut sent = sock.send_slice(first).unwrap_or(0);
            if sent == first.len() && !second.is_empty() {
                sent += sock.send_slice(second).unwrap_or(0);
            }
            sent
        };
        if sent == 0 {
            return false;
        }

        tx.handed_off(sent);
        let has_room = tx.free() > 0;
        drop(tx);

        pcb.unacked = sock.send_queue();
        self.shared
            .counters()
            .bytes_out
            .fetch_add(sent as u64, Ordering::Relaxed);
        trace!("{}: handed {} bytes to the stack", vs.id(), sent);
        if has_room {
            self.notify_writable(vs);
        }
        true
    }

    fn on_error(&self, vs: &VirtualSocket, prev: tcp::State, close_issued: bool) {
        let kind = match prev {
            tcp::State::SynSent | tcp::State::SynReceived => Some(StackErrorKind::Refused),
            _ if close_issued || vs.is_shutting_down() => None,
            tcp::State::TimeWait | tcp::State::LastAck => None,
            _ => Some(StackErrorKind::Reset),
        };
        match kind {
            Some(kind) => {
                debug!("{}: connection failed: {}", vs.id(), kind);
                vs.set_error(kind);
            }
            None => trace!("{}: connection closed", vs.id()),
        }
        vs.mark_peer_closed();
        // Wake anything waiting so the failure is observed
        self.notify_readable(vs);
        self.notify_writable(vs);
    }

    /// Second half of `close`: flush, send FIN (or RST) and release the PCB
    fn deferred_shutdown(
        &self,
        vs: &VirtualSocket,
        pcb: &mut TcpPcb,
        sock: &mut tcp::Socket<'static>,
    ) -> Disposition {
        let handle = Some(pcb.handle);
        let state = sock.state();
        if state == tcp::State::Closed {
            return Disposition::Reap { handle, drain: false };
        }
        if state == tcp::State::TimeWait {
            return Disposition::Reap { handle, drain: true };
        }

        let linger = vs.linger();
        if linger == Some(Duration::ZERO) {
            debug!("{}: zero linger, aborting", vs.id());
            sock.abort();
            return Disposition::Reap { handle, drain: true };
        }

        if !pcb.close_issued {
            let since = *pcb.shutdown_since.get_or_insert_with(Instant::now);
            let pending = vs.tx().pending();
            if pending > 0 && sock.may_send() {
                // A peer that stops reading must not hold close forever
                let limit =
                    linger.unwrap_or_else(|| self.shared.stack_config().close_flush_timeout());
                if since.elapsed() >= limit {
                    debug!("{}: close gave up with {} bytes unsent", vs.id(), pending);
                    sock.abort();
                    return Disposition::Reap { handle, drain: true };
                }
                trace!("{}: close waiting on {} unsent bytes", vs.id(), pending);
                return Disposition::Keep;
            }
            sock.close();
            pcb.close_issued = true;
        }
        sock.set_timeout(Some(to_stack_duration(DRAIN_LIMIT)));
        Disposition::Reap { handle, drain: true }
    }

    // ------------------------------------------------------------------
    // Datagrams
    // ------------------------------------------------------------------

    fn service_datagram(
        &self,
        vs: &VirtualSocket,
        handle: SocketHandle,
        sock: &mut udp::Socket<'static>,
        polled: bool,
    ) -> (bool, Disposition) {
        if polled && vs.state() == VsState::ShouldShutdown {
            sock.close();
            return (
                false,
                Disposition::Reap {
                    handle: Some(handle),
                    drain: false,
                },
            );
        }
        let received = self.on_datagram_received(vs, sock);
        let sent = self.hand_off_datagrams(vs, sock);
        (received || sent, Disposition::Keep)
    }

    /// Deliver whole datagrams while they fit; the rest wait in the stack
    fn on_datagram_received(&self, vs: &VirtualSocket, sock: &mut udp::Socket<'static>) -> bool {
        let mut delivered = 0usize;
        let mut bytes = 0usize;
        {
            let mut rx = vs.rx();
            loop {
                let (len, from) = match sock.peek() {
                    Ok((payload, meta)) => (payload.len(), from_endpoint(meta.endpoint)),
                    Err(_) => break,
                };
                if vs.is_read_shutdown() {
                    let _ = sock.recv();
                    continue;
                }
                if rx.free() < framing::framed_len(len) {
                    trace!("{}: rx ring full, datagram from {} stays queued", vs.id(), from);
                    break;
                }
                match sock.recv() {
                    Ok((payload, _)) => {
                        if framing::push_datagram(&mut rx, &from, payload) {
                            delivered += 1;
                            bytes += len;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
        if delivered > 0 {
            trace!("{}: received {} datagrams", vs.id(), delivered);
            self.shared
                .counters()
                .bytes_in
                .fetch_add(bytes as u64, Ordering::Relaxed);
            self.notify_readable(vs);
        }
        delivered > 0
    }

    fn hand_off_datagrams(&self, vs: &VirtualSocket, sock: &mut udp::Socket<'static>) -> bool {
        let mut tx = vs.tx();
        let mut sent = 0usize;
        loop {
            let (len, dest) = match framing::peek_datagram(tx.ring_mut()) {
                Ok(Some(unit)) => unit,
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: corrupt datagram staging, dropping it: {}", vs.id(), e);
                    tx.clear();
                    break;
                }
            };
            let mut payload = vec![0u8; len];
            tx.ring_mut().peek_into(HEADER_SIZE, &mut payload);
            match sock.send_slice(&payload, to_endpoint(dest)) {
                Ok(()) => {
                    tx.ring_mut().consume(framing::framed_len(len));
                    sent += 1;
                    self.shared
                        .counters()
                        .bytes_out
                        .fetch_add(len as u64, Ordering::Relaxed);
                }
                Err(udp::SendError::BufferFull) => break,
                Err(udp::SendError::Unaddressable) => {
                    debug!("{}: no route for datagram to {}", vs.id(), dest);
                    tx.ring_mut().consume(framing::framed_len(len));
                    vs.set_error(StackErrorKind::Route);
                }
            }
        }
        drop(tx);
        if sent > 0 {
            trace!("{}: handed {} datagrams to the stack", vs.id(), sent);
            self.notify_writable(vs);
        }
        sent > 0
    }
}

impl EventLoop {
    /// Derive callbacks for every PCB; returns whether any data moved
    pub(crate) fn dispatch(&mut self) -> bool {
        let mut moved = false;
        for id in self.pcbs.ids() {
            moved |= self.service(id, false);
        }
        moved
    }

    /// Per-connection poll: retry buffered outbound data and carry out a
    /// requested shutdown
    pub(crate) fn on_polled(&mut self, id: SocketId) {
        self.service(id, true);
    }

    fn service(&mut self, id: SocketId, polled: bool) -> bool {
        if matches!(
            self.pcbs.get(id).map(|p| &p.kind),
            Some(PcbKind::Listener { .. })
        ) {
            return self.service_listener(id);
        }

        let callbacks = Callbacks {
            shared: &self.shared,
            notifier: &*self.notifier,
        };
        let Some(pcb) = self.pcbs.get_mut(id) else {
            return false;
        };
        let vs = Arc::clone(&pcb.vs);
        let (moved, disposition) = match &mut pcb.kind {
            PcbKind::TcpBound { .. } => {
                let reap = polled && vs.state() == VsState::ShouldShutdown;
                let disposition = if reap {
                    Disposition::Reap {
                        handle: None,
                        drain: false,
                    }
                } else {
                    Disposition::Keep
                };
                (false, disposition)
            }
            PcbKind::Tcp(stream) => {
                let sock = self.sockets.get_mut::<tcp::Socket>(stream.handle);
                callbacks.service_stream(&vs, stream, sock, polled)
            }
            PcbKind::Udp { handle } => {
                let handle = *handle;
                let sock = self.sockets.get_mut::<udp::Socket>(handle);
                callbacks.service_datagram(&vs, handle, sock, polled)
            }
            PcbKind::Listener { .. } => (false, Disposition::Keep),
        };

        if let Disposition::Reap { handle, drain } = disposition {
            self.reap(id, handle, drain);
        }
        moved
    }

    fn reap(&mut self, id: SocketId, handle: Option<SocketHandle>, drain: bool) {
        let Some(pcb) = self.pcbs.remove(id) else {
            return;
        };
        match handle {
            Some(handle) if drain => self.pcbs.draining.push(Draining {
                handle,
                port: pcb.port,
                since: Instant::now(),
            }),
            Some(handle) => {
                self.sockets.remove(handle);
                self.pcbs.release_port(pcb.port);
            }
            None => self.pcbs.release_port(pcb.port),
        }
        self.finish(&pcb.vs);
        debug!("{}: released", id);
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    fn service_listener(&mut self, id: SocketId) -> bool {
        let (vs, endpoint, handles) = match self.pcbs.get(id) {
            Some(Pcb {
                vs,
                kind: PcbKind::Listener { endpoint, handles },
                ..
            }) => (Arc::clone(vs), *endpoint, handles.clone()),
            _ => return false,
        };

        let mut moved = false;
        let mut slots = Vec::with_capacity(handles.len());
        for handle in handles {
            let state = self.sockets.get::<tcp::Socket>(handle).state();
            match state {
                tcp::State::Listen | tcp::State::SynReceived => slots.push(handle),
                tcp::State::Closed => {
                    // Handshake failed; put the slot back to listening
                    let sock = self.sockets.get_mut::<tcp::Socket>(handle);
                    if sock.listen(endpoint).is_ok() {
                        slots.push(handle);
                    } else {
                        self.sockets.remove(handle);
                        slots.extend(self.new_listen_socket(&vs, endpoint));
                    }
                }
                _ => {
                    self.on_accepted(&vs, handle);
                    slots.extend(self.new_listen_socket(&vs, endpoint));
                    moved = true;
                }
            }
        }

        if let Some(Pcb {
            kind: PcbKind::Listener { handles, .. },
            ..
        }) = self.pcbs.get_mut(id)
        {
            *handles = slots;
        }
        moved
    }

    /// A handshake completed on one of `listener`'s slots
    fn on_accepted(&mut self, listener: &Arc<VirtualSocket>, handle: SocketHandle) {
        let Some(queue) = listener.accept_queue() else {
            self.reject(handle);
            return;
        };
        if queue.is_full() {
            warn!("{}: accept queue full, rejecting connection", listener.id());
            self.reject(handle);
            return;
        }
        let id = match self.accounting.provision() {
            Ok(id) => id,
            Err(e) => {
                warn!("{}: rejecting connection: {}", listener.id(), e);
                self.reject(handle);
                return;
            }
        };

        let sock = self.sockets.get_mut::<tcp::Socket>(handle);
        let (Some(local), Some(remote)) = (sock.local_endpoint(), sock.remote_endpoint()) else {
            self.accounting.release();
            self.reject(handle);
            return;
        };
        let state = sock.state();
        let local = from_endpoint(local);
        let remote = from_endpoint(remote);

        let vs = Arc::new(VirtualSocket::new(
            id,
            SocketType::Stream,
            AddressFamily::of(&local.ip()),
            &self.config,
        ));
        vs.attach(self.shared.network());
        vs.set_local_addr(local);
        vs.set_peer_addr(remote);
        vs.set_nodelay(listener.nodelay());
        vs.set_keepalive(listener.keepalive());
        vs.set_linger(listener.linger());
        vs.set_protocol_state(protocol_state(state));

        {
            let mut conns = self.shared.lock_connections();
            if let Err(vs) = queue.push(Arc::clone(&vs)) {
                drop(conns);
                warn!("{}: accept queue full, rejecting {}", listener.id(), vs.id());
                vs.mark_closed();
                self.accounting.release();
                self.reject(handle);
                return;
            }
            conns.push(Arc::clone(&vs));
        }

        self.pcbs.insert(Pcb {
            vs: Arc::clone(&vs),
            kind: PcbKind::Tcp(TcpPcb::new(handle, state, true)),
            port: None,
            next_poll: Instant::now() + self.config.poll_interval(),
        });
        self.shared
            .counters()
            .accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!("{}: accepted {} from {}", listener.id(), vs.id(), remote);

        let fd = listener.fd();
        if fd >= 0 {
            self.notifier.set_readable(fd, true);
        }
    }

    /// Reset a connection nobody will accept
    fn reject(&mut self, handle: SocketHandle) {
        self.sockets.get_mut::<tcp::Socket>(handle).abort();
        self.pcbs.draining.push(Draining {
            handle,
            port: None,
            since: Instant::now(),
        });
    }
}
