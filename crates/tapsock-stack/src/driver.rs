//! Stack driver: application-side halves of the socket operations.
//!
//! Everything here runs on application threads. PCB work is delegated to the
//! owning Tap's event loop through [`TapCommand`]s; data moves through the
//! socket's RX/TX rings under the connection-table and buffer locks.

use crate::event_loop::TapCommand;
use crate::tap::TapShared;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tapsock_core::framing;
use tapsock_core::{
    AddressFamily, ProtocolState, ReadinessNotifier, ShutdownHow, SocketAccounting, SocketError,
    SocketResult, StackErrorKind, VirtualSocket, VsState,
};
use tracing::{debug, trace, warn};

/// IPv4 header without options
const IPV4_HEADER_SIZE: usize = 20;
/// Fixed IPv6 header
const IPV6_HEADER_SIZE: usize = 40;
/// UDP header
const UDP_HEADER_SIZE: usize = 8;

/// Unspecified address of `family`, port 0
pub(crate) fn any_addr(family: AddressFamily) -> SocketAddr {
    match family {
        AddressFamily::Inet => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        AddressFamily::Inet6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Largest datagram payload that fits one packet on a link of `mtu`
pub fn max_datagram_payload(mtu: usize, family: AddressFamily) -> usize {
    let ip = match family {
        AddressFamily::Inet => IPV4_HEADER_SIZE,
        AddressFamily::Inet6 => IPV6_HEADER_SIZE,
    };
    mtu.saturating_sub(ip + UDP_HEADER_SIZE)
}

/// Operations on sockets attached to one Tap
pub(crate) struct Driver<'a> {
    pub tap: &'a TapShared,
    pub notifier: &'a dyn ReadinessNotifier,
    pub accounting: &'a SocketAccounting,
}

impl Driver<'_> {
    fn pending_error(vs: &VirtualSocket) -> SocketResult<()> {
        match vs.take_error() {
            Some(kind) => Err(SocketError::Stack(kind)),
            None => Ok(()),
        }
    }

    /// Mark closed from an application thread when the loop can no longer do it
    fn close_locally(&self, vs: &VirtualSocket) {
        if vs.mark_closed() {
            self.accounting.release();
        }
        self.tap.unregister(vs.id());
    }

    // ------------------------------------------------------------------
    // Endpoint setup
    // ------------------------------------------------------------------

    pub fn bind(&self, vs: &Arc<VirtualSocket>, addr: SocketAddr) -> SocketResult<SocketAddr> {
        self.tap.register(vs);
        let local = self.tap.request(|reply| TapCommand::Bind {
            vs: Arc::clone(vs),
            addr,
            reply,
        })??;
        debug!("{}: bound {} on tap {}", vs.id(), local, self.tap.network());
        Ok(local)
    }

    pub fn listen(&self, vs: &VirtualSocket, backlog: usize) -> SocketResult<()> {
        if vs.local_addr().is_none() {
            return Err(SocketError::InvalidArgument("listen requires a bound socket"));
        }
        // Queue first, so connections completing right away have somewhere to go
        vs.start_listening(backlog);
        self.tap.request(|reply| TapCommand::Listen {
            id: vs.id(),
            backlog,
            reply,
        })?
    }

    pub fn connect(&self, vs: &Arc<VirtualSocket>, addr: SocketAddr) -> SocketResult<()> {
        if !vs.is_stream() {
            vs.set_peer_addr(addr);
            if vs.local_addr().is_none() {
                self.bind(vs, any_addr(vs.family()))?;
            }
            debug!("{}: default peer {}", vs.id(), addr);
            return Ok(());
        }

        if vs.is_listening() {
            return Err(SocketError::InvalidArgument("listening socket cannot connect"));
        }
        if vs.protocol_state().is_connected() {
            return Err(SocketError::AlreadyConnected);
        }

        self.tap.register(vs);
        self.tap.request(|reply| TapCommand::Connect {
            vs: Arc::clone(vs),
            addr,
            reply,
        })??;

        let config = self.tap.stack_config();
        let state = vs.wait_until(
            Some(config.connect_timeout()),
            config.close_poll_interval(),
            |state| {
                state != VsState::Active
                    || vs.protocol_state() == ProtocolState::Closed
                    || !self.tap.is_running()
            },
        );

        match state {
            VsState::UnhandledConnected => {
                vs.claim_connection();
                Ok(())
            }
            VsState::ShouldShutdown | VsState::Closed => {
                Err(SocketError::Stack(StackErrorKind::Abort))
            }
            VsState::Active => {
                Self::pending_error(vs)?;
                if !self.tap.is_running() {
                    return Err(SocketError::InterfaceDown);
                }
                if vs.protocol_state() == ProtocolState::Closed {
                    return Err(SocketError::Stack(StackErrorKind::Refused));
                }
                debug!("{}: connect to {} timed out", vs.id(), addr);
                vs.request_shutdown();
                self.tap.nudge(vs.id());
                Err(SocketError::TimedOut)
            }
        }
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    pub fn read(&self, vs: &VirtualSocket, buf: &mut [u8]) -> SocketResult<usize> {
        if !vs.is_stream() {
            return self.recv_from(vs, buf).map(|(n, _)| n);
        }
        if vs.is_listening() {
            return Err(SocketError::InvalidArgument("read on listening socket"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let (n, drained) = {
            let _conns = self.tap.lock_connections();
            let mut rx = vs.rx();
            let n = rx.read(buf);
            (n, rx.is_empty())
        };
        let fd = vs.fd();
        if drained && fd >= 0 {
            self.notifier.set_readable(fd, false);
        }
        if n > 0 {
            trace!("{}: read {} bytes", vs.id(), n);
            // Pull whatever the stack held back and reopen the window
            self.tap.nudge(vs.id());
            return Ok(n);
        }

        Self::pending_error(vs)?;
        if vs.is_peer_closed() || vs.is_read_shutdown() || vs.protocol_state().is_terminal() {
            return Ok(0);
        }
        Err(SocketError::WouldBlock)
    }

    pub fn write(&self, vs: &Arc<VirtualSocket>, data: &[u8]) -> SocketResult<usize> {
        if !vs.is_stream() {
            let peer = vs.peer_addr().ok_or(SocketError::DestinationRequired)?;
            return self.send_to(vs, data, peer);
        }
        Self::pending_error(vs)?;
        if vs.is_write_shutdown() || vs.is_shutting_down() {
            return Err(SocketError::ShuttingDown);
        }
        if !vs.protocol_state().is_connected() {
            return Err(SocketError::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let (n, full) = {
            let mut tx = vs.tx();
            let n = tx.stage(data);
            (n, tx.free() == 0)
        };
        let fd = vs.fd();
        if full && fd >= 0 {
            self.notifier.set_writable(fd, false);
        }
        if n == 0 {
            return Err(SocketError::WouldBlock);
        }
        trace!("{}: staged {} bytes", vs.id(), n);
        self.tap.nudge(vs.id());
        Ok(n)
    }

    pub fn send_to(
        &self,
        vs: &Arc<VirtualSocket>,
        data: &[u8],
        addr: SocketAddr,
    ) -> SocketResult<usize> {
        if vs.is_stream() {
            return self.write(vs, data);
        }
        Self::pending_error(vs)?;
        if vs.is_write_shutdown() || vs.is_shutting_down() {
            return Err(SocketError::ShuttingDown);
        }
        if !vs.family().matches(&addr.ip()) {
            return Err(SocketError::FamilyMismatch);
        }
        if vs.local_addr().is_none() {
            self.bind(vs, any_addr(vs.family()))?;
        }

        let limit = max_datagram_payload(self.tap.mtu(), vs.family());
        let payload = &data[..data.len().min(limit)];
        if payload.len() < data.len() {
            debug!(
                "{}: datagram truncated from {} to {} bytes",
                vs.id(),
                data.len(),
                payload.len()
            );
        }

        let queued = {
            let mut tx = vs.tx();
            framing::push_datagram(tx.ring_mut(), &addr, payload)
        };
        if !queued {
            let fd = vs.fd();
            if fd >= 0 {
                self.notifier.set_writable(fd, false);
            }
            return Err(SocketError::WouldBlock);
        }
        trace!("{}: queued {} byte datagram for {}", vs.id(), payload.len(), addr);
        self.tap.nudge(vs.id());
        Ok(payload.len())
    }

    pub fn recv_from(
        &self,
        vs: &VirtualSocket,
        buf: &mut [u8],
    ) -> SocketResult<(usize, SocketAddr)> {
        if vs.is_stream() {
            let peer = vs.peer_addr().ok_or(SocketError::NotConnected)?;
            return self.read(vs, buf).map(|n| (n, peer));
        }

        let (front, drained) = {
            let _conns = self.tap.lock_connections();
            let mut rx = vs.rx();
            let front = framing::pop_datagram(&mut rx, buf);
            (front, rx.is_empty())
        };
        let fd = vs.fd();
        if drained && fd >= 0 {
            self.notifier.set_readable(fd, false);
        }

        match front {
            Ok(Some((n, from))) => {
                trace!("{}: read {} byte datagram from {}", vs.id(), n, from);
                self.tap.nudge(vs.id());
                Ok((n, from))
            }
            Ok(None) => {
                Self::pending_error(vs)?;
                Err(SocketError::WouldBlock)
            }
            Err(e) => {
                warn!("{}: discarding corrupt rx staging: {}", vs.id(), e);
                Err(SocketError::Stack(StackErrorKind::Buf))
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    pub fn shutdown(&self, vs: &VirtualSocket, how: ShutdownHow) -> SocketResult<()> {
        if vs.is_stream() && !vs.protocol_state().is_connected() && !vs.is_peer_closed() {
            return Err(SocketError::NotConnected);
        }
        if how.read() {
            vs.shutdown_read();
            vs.rx().clear();
        }
        if how.write() {
            vs.shutdown_write();
        }
        debug!("{}: shutdown {:?}", vs.id(), how);
        self.tap.nudge(vs.id());
        Ok(())
    }

    pub fn close(&self, vs: &VirtualSocket) -> SocketResult<()> {
        if vs.is_closed() {
            return Ok(());
        }
        if !self.tap.is_running() {
            self.close_locally(vs);
            return Ok(());
        }

        if vs.is_listening() {
            let id = vs.id();
            if self
                .tap
                .request(|reply| TapCommand::CloseListener { id, reply })
                .is_err()
            {
                self.close_locally(vs);
            }
            return Ok(());
        }

        if vs.protocol_state() == ProtocolState::Unbound {
            // Registered but the loop never created a PCB for it
            self.close_locally(vs);
            return Ok(());
        }
        if !vs.request_shutdown() {
            return Ok(());
        }
        self.tap.nudge(vs.id());
        if !vs.is_stream() {
            return Ok(());
        }

        let recheck = self.tap.stack_config().close_poll_interval();
        let state = vs.wait_until(None, recheck, |state| {
            state == VsState::Closed || !self.tap.is_running()
        });
        if state != VsState::Closed {
            self.close_locally(vs);
        }
        debug!("{}: closed", vs.id());
        Ok(())
    }
}
