//! Service registry: the top-level context owning every Tap and descriptor.
//!
//! There is no process-wide state. Each [`NetworkService`] owns its Taps, its
//! descriptor table and the socket accounting shared with its event loops;
//! sockets refer back to their Tap by [`NetworkId`] and are resolved through
//! the registry on every call.

use crate::device::FrameSink;
use crate::driver::{Driver, any_addr};
use crate::event_loop::TapCommand;
use crate::options::{OptionName, OptionValue, SocketOption};
use crate::select::{select_bind_tap, select_tap};
use crate::tap::{Tap, TapConfig, TapError, TapShared};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tapsock_core::{
    AddressFamily, Fd, NetworkId, NoopNotifier, ReadinessNotifier, ShutdownHow,
    SocketAccounting, SocketError, SocketResult, SocketType, StackConfig, VirtualSocket,
};
use tracing::{debug, info};

/// First descriptor handed out; 0-2 are left to the standard streams
const FIRST_FD: Fd = 3;

/// How many closed descriptors are remembered for a repeated close
const CLOSED_DESCRIPTOR_MEMORY: usize = 64;

/// Most recently closed descriptors, oldest first.
///
/// A repeated close of one of these succeeds immediately; the allocator
/// skips them so a late close cannot hit a fresh socket.
#[derive(Debug, Default)]
struct ClosedDescriptors {
    recent: VecDeque<Fd>,
}

impl ClosedDescriptors {
    fn contains(&self, fd: Fd) -> bool {
        self.recent.contains(&fd)
    }

    fn remember(&mut self, fd: Fd) {
        if self.recent.len() == CLOSED_DESCRIPTOR_MEMORY {
            self.recent.pop_front();
        }
        self.recent.push_back(fd);
    }

    fn len(&self) -> usize {
        self.recent.len()
    }
}

/// Socket API over every joined virtual network
pub struct NetworkService {
    config: StackConfig,
    taps: RwLock<Vec<Tap>>,
    descriptors: DashMap<Fd, Arc<VirtualSocket>>,
    closed: Mutex<ClosedDescriptors>,
    next_fd: AtomicI32,
    accounting: Arc<SocketAccounting>,
    notifier: Arc<dyn ReadinessNotifier>,
}

impl NetworkService {
    /// Service without a readiness collaborator
    pub fn new(config: StackConfig) -> Self {
        Self::with_notifier(config, Arc::new(NoopNotifier))
    }

    /// Service reporting descriptor readiness to `notifier`
    pub fn with_notifier(config: StackConfig, notifier: Arc<dyn ReadinessNotifier>) -> Self {
        Self {
            accounting: Arc::new(SocketAccounting::new(config.max_sockets)),
            config,
            taps: RwLock::new(Vec::new()),
            descriptors: DashMap::new(),
            closed: Mutex::new(ClosedDescriptors::default()),
            next_fd: AtomicI32::new(FIRST_FD),
            notifier,
        }
    }

    /// Stack configuration applied to new Taps and sockets
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Live virtual sockets, including accepted ones not yet claimed
    pub fn socket_count(&self) -> usize {
        self.accounting.live()
    }

    // ------------------------------------------------------------------
    // Taps
    // ------------------------------------------------------------------

    /// Join a network: start a Tap whose egress goes to `sink`
    ///
    /// # Errors
    ///
    /// Returns an error if the network is already joined or the Tap fails to
    /// start.
    pub fn attach_tap(
        &self,
        config: TapConfig,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<TapShared>, TapError> {
        let mut taps = self.taps.write();
        if taps.iter().any(|t| t.network() == config.network) {
            return Err(TapError::AlreadyAttached(config.network));
        }
        let tap = Tap::start(
            config,
            self.config.clone(),
            sink,
            Arc::clone(&self.notifier),
            Arc::clone(&self.accounting),
        )?;
        let shared = Arc::clone(tap.shared());
        taps.push(tap);
        Ok(shared)
    }

    /// Leave a network, aborting its sockets. Returns `false` if not joined.
    pub fn detach_tap(&self, network: NetworkId) -> bool {
        let tap = {
            let mut taps = self.taps.write();
            let Some(index) = taps.iter().position(|t| t.network() == network) else {
                return false;
            };
            taps.remove(index)
        };
        info!("detaching tap {}", network);
        drop(tap);
        true
    }

    /// Tap of `network`
    pub fn tap(&self, network: NetworkId) -> Option<Arc<TapShared>> {
        self.taps
            .read()
            .iter()
            .find(|t| t.network() == network)
            .map(|t| Arc::clone(t.shared()))
    }

    /// Every joined Tap in attach order
    pub fn taps(&self) -> Vec<Arc<TapShared>> {
        self.taps.read().iter().map(|t| Arc::clone(t.shared())).collect()
    }

    // ------------------------------------------------------------------
    // Descriptor plumbing
    // ------------------------------------------------------------------

    /// Virtual socket behind `fd`
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::BadDescriptor`] for unknown or closed descriptors.
    pub fn virtual_socket(&self, fd: Fd) -> SocketResult<Arc<VirtualSocket>> {
        self.descriptors
            .get(&fd)
            .map(|vs| Arc::clone(vs.value()))
            .ok_or(SocketError::BadDescriptor(fd))
    }

    /// Number of open descriptors
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Next candidate descriptor, wrapping back to [`FIRST_FD`] after `Fd::MAX`
    fn next_candidate(&self) -> Fd {
        let step = |fd: Fd| Some(if fd == Fd::MAX { FIRST_FD } else { fd + 1 });
        match self.next_fd.fetch_update(Ordering::Relaxed, Ordering::Relaxed, step) {
            Ok(fd) | Err(fd) => fd,
        }
    }

    fn install(&self, vs: Arc<VirtualSocket>) -> Fd {
        loop {
            let fd = self.next_candidate();
            let closed = self.closed.lock();
            if closed.contains(fd) {
                continue;
            }
            if let Entry::Vacant(slot) = self.descriptors.entry(fd) {
                vs.set_fd(fd);
                slot.insert(vs);
                return fd;
            }
        }
    }

    fn attached_tap(&self, vs: &VirtualSocket) -> Option<Arc<TapShared>> {
        vs.network().and_then(|network| self.tap(network))
    }

    fn driver<'a>(&'a self, tap: &'a TapShared) -> Driver<'a> {
        Driver {
            tap,
            notifier: &*self.notifier,
            accounting: &self.accounting,
        }
    }

    /// Attach `vs` to `tap`, failing if it already belongs to another network
    fn attach(vs: &VirtualSocket, tap: &TapShared) -> SocketResult<()> {
        if vs.attach(tap.network()) {
            Ok(())
        } else {
            Err(SocketError::InvalidArgument("socket belongs to another network"))
        }
    }

    // ------------------------------------------------------------------
    // Socket API
    // ------------------------------------------------------------------

    /// Create a socket
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::SocketLimit`] once `max_sockets` are live.
    pub fn socket(&self, family: AddressFamily, socket_type: SocketType) -> SocketResult<Fd> {
        let id = self.accounting.provision()?;
        let vs = Arc::new(VirtualSocket::new(id, socket_type, family, &self.config));
        let fd = self.install(vs);
        debug!("fd {}: {} socket {} created", fd, socket_type.as_str(), id);
        Ok(fd)
    }

    /// Bind to a local address on the Tap owning it
    ///
    /// # Errors
    ///
    /// Returns an error for a family mismatch, a second bind, an address no
    /// Tap owns, or a port already in use.
    pub fn bind(&self, fd: Fd, addr: SocketAddr) -> SocketResult<()> {
        let vs = self.virtual_socket(fd)?;
        if !vs.family().matches(&addr.ip()) {
            return Err(SocketError::FamilyMismatch);
        }
        if vs.local_addr().is_some() {
            return Err(SocketError::InvalidArgument("socket already bound"));
        }

        let tap = match self.attached_tap(&vs) {
            Some(tap) => tap,
            None => select_bind_tap(&self.taps(), vs.family(), &addr.ip())
                .ok_or(SocketError::AddressNotAvailable(addr.ip()))?,
        };
        Self::attach(&vs, &tap)?;
        self.driver(&tap).bind(&vs, addr)?;
        Ok(())
    }

    /// Connect a stream, or set the default peer of a datagram socket.
    ///
    /// Blocks until the handshake completes, fails, or the connect timeout
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns an error when no Tap routes `addr`, the peer refuses, or the
    /// attempt times out.
    pub fn connect(&self, fd: Fd, addr: SocketAddr) -> SocketResult<()> {
        let vs = self.virtual_socket(fd)?;
        if !vs.family().matches(&addr.ip()) {
            return Err(SocketError::FamilyMismatch);
        }
        let tap = match self.attached_tap(&vs) {
            Some(tap) => tap,
            None => select_tap(&self.taps(), &addr.ip()).ok_or(SocketError::NoRoute(addr.ip()))?,
        };
        Self::attach(&vs, &tap)?;
        self.driver(&tap).connect(&vs, addr)
    }

    /// Start listening; a `backlog` of 0 selects the configured default
    ///
    /// # Errors
    ///
    /// Returns an error for datagram or unbound sockets.
    pub fn listen(&self, fd: Fd, backlog: usize) -> SocketResult<()> {
        let vs = self.virtual_socket(fd)?;
        if !vs.is_stream() {
            return Err(SocketError::WrongSocketType("stream"));
        }
        let tap = self
            .attached_tap(&vs)
            .ok_or(SocketError::InvalidArgument("listen requires a bound socket"))?;
        let backlog = if backlog == 0 {
            self.config.default_backlog
        } else {
            backlog
        };
        self.driver(&tap).listen(&vs, backlog)
    }

    /// Take the oldest pending connection. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WouldBlock`] when nothing is pending and
    /// [`SocketError::NotListening`] for a socket that is not listening.
    pub fn accept(&self, fd: Fd) -> SocketResult<(Fd, SocketAddr)> {
        let listener = self.virtual_socket(fd)?;
        let queue = listener.accept_queue().ok_or(SocketError::NotListening)?;
        let tap = self
            .attached_tap(&listener)
            .ok_or(SocketError::InterfaceDown)?;

        let (accepted, drained) = {
            let _conns = tap.lock_connections();
            let accepted = queue.pop();
            (accepted, queue.is_empty())
        };
        if drained {
            self.notifier.set_readable(fd, false);
        }
        let Some(vs) = accepted else {
            if let Some(kind) = listener.take_error() {
                return Err(SocketError::Stack(kind));
            }
            return Err(SocketError::WouldBlock);
        };

        let peer = vs.peer_addr().unwrap_or_else(|| any_addr(vs.family()));
        let has_data = !vs.rx().is_empty();
        let new_fd = self.install(Arc::clone(&vs));
        self.notifier.set_writable(new_fd, true);
        if has_data || vs.is_peer_closed() {
            self.notifier.set_readable(new_fd, true);
        }
        // Data may have been held back while nobody could be notified
        tap.nudge(vs.id());
        debug!("fd {}: accepted fd {} from {}", fd, new_fd, peer);
        Ok((new_fd, peer))
    }

    /// Read from a stream, or the payload of the next datagram
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WouldBlock`] when nothing is buffered, or the
    /// pending asynchronous error. End of stream reads as `Ok(0)`.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> SocketResult<usize> {
        let vs = self.virtual_socket(fd)?;
        match self.attached_tap(&vs) {
            Some(tap) => self.driver(&tap).read(&vs, buf),
            None if vs.is_stream() => Err(SocketError::NotConnected),
            None => Err(SocketError::WouldBlock),
        }
    }

    /// Write to a stream, or send one datagram to the default peer.
    ///
    /// Short writes are normal.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WouldBlock`] when the TX ring is full, or a state
    /// error for unconnected or shut down sockets.
    pub fn write(&self, fd: Fd, data: &[u8]) -> SocketResult<usize> {
        let vs = self.virtual_socket(fd)?;
        match self.attached_tap(&vs) {
            Some(tap) => self.driver(&tap).write(&vs, data),
            None if vs.is_stream() => Err(SocketError::NotConnected),
            None => Err(SocketError::DestinationRequired),
        }
    }

    /// Receive one datagram together with its sender
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WouldBlock`] when nothing is buffered.
    pub fn recv_from(&self, fd: Fd, buf: &mut [u8]) -> SocketResult<(usize, SocketAddr)> {
        let vs = self.virtual_socket(fd)?;
        match self.attached_tap(&vs) {
            Some(tap) => self.driver(&tap).recv_from(&vs, buf),
            None if vs.is_stream() => Err(SocketError::NotConnected),
            None => Err(SocketError::WouldBlock),
        }
    }

    /// Send one datagram to `addr`, binding an ephemeral port first if needed.
    ///
    /// Payloads beyond one packet are truncated.
    ///
    /// # Errors
    ///
    /// Returns an error when no Tap routes `addr` or the TX ring is full.
    pub fn send_to(&self, fd: Fd, data: &[u8], addr: SocketAddr) -> SocketResult<usize> {
        let vs = self.virtual_socket(fd)?;
        let tap = match self.attached_tap(&vs) {
            Some(tap) => tap,
            None if vs.is_stream() => return Err(SocketError::NotConnected),
            None => {
                select_tap(&self.taps(), &addr.ip()).ok_or(SocketError::NoRoute(addr.ip()))?
            }
        };
        Self::attach(&vs, &tap)?;
        self.driver(&tap).send_to(&vs, data, addr)
    }

    /// Half-close a connection
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotConnected`] for streams without a connection.
    pub fn shutdown(&self, fd: Fd, how: ShutdownHow) -> SocketResult<()> {
        let vs = self.virtual_socket(fd)?;
        let tap = self
            .attached_tap(&vs)
            .ok_or(SocketError::NotConnected)?;
        self.driver(&tap).shutdown(&vs, how)
    }

    /// Close a descriptor.
    ///
    /// Stream sockets block until the event loop has released the PCB.
    /// Closing a recently closed descriptor returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::BadDescriptor`] for descriptors never issued
    /// or closed too long ago to be remembered.
    pub fn close(&self, fd: Fd) -> SocketResult<()> {
        let vs = {
            let mut closed = self.closed.lock();
            match self.descriptors.remove(&fd) {
                Some((_, vs)) => {
                    closed.remember(fd);
                    vs
                }
                None if closed.contains(fd) => return Ok(()),
                None => return Err(SocketError::BadDescriptor(fd)),
            }
        };

        self.notifier.set_readable(fd, false);
        self.notifier.set_writable(fd, false);
        match self.attached_tap(&vs) {
            Some(tap) => self.driver(&tap).close(&vs)?,
            None => {
                if vs.mark_closed() {
                    self.accounting.release();
                }
            }
        }
        debug!("fd {}: closed", fd);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Options and names
    // ------------------------------------------------------------------

    /// Set a socket option
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WrongSocketType`] for stream-only options on
    /// datagram sockets.
    pub fn set_option(&self, fd: Fd, option: SocketOption) -> SocketResult<()> {
        let vs = self.virtual_socket(fd)?;
        let forwarded = match option {
            SocketOption::NoDelay(on) => {
                if !vs.is_stream() {
                    return Err(SocketError::WrongSocketType("stream"));
                }
                vs.set_nodelay(on);
                true
            }
            SocketOption::KeepAlive(interval) => {
                if !vs.is_stream() {
                    return Err(SocketError::WrongSocketType("stream"));
                }
                vs.set_keepalive(interval);
                true
            }
            SocketOption::Linger(linger) => {
                vs.set_linger(linger);
                false
            }
        };
        if forwarded {
            if let Some(tap) = self.attached_tap(&vs) {
                tap.post(TapCommand::ApplyOptions(vs.id()));
            }
        }
        debug!("fd {}: set {:?}", fd, option);
        Ok(())
    }

    /// Read a socket option. `Error` takes the pending error.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::WrongSocketType`] for stream-only options on
    /// datagram sockets.
    pub fn get_option(&self, fd: Fd, name: OptionName) -> SocketResult<OptionValue> {
        let vs = self.virtual_socket(fd)?;
        Ok(match name {
            OptionName::NoDelay => {
                if !vs.is_stream() {
                    return Err(SocketError::WrongSocketType("stream"));
                }
                OptionValue::Flag(vs.nodelay())
            }
            OptionName::KeepAlive => OptionValue::Flag(vs.keepalive().is_some()),
            OptionName::Linger => OptionValue::Linger(vs.linger()),
            OptionName::Error => OptionValue::Error(vs.take_error().map_or(0, |k| k.errno())),
            OptionName::Type => OptionValue::Type(vs.socket_type()),
        })
    }

    /// Connected peer
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotConnected`] if there is none.
    pub fn peer_addr(&self, fd: Fd) -> SocketResult<SocketAddr> {
        self.virtual_socket(fd)?
            .peer_addr()
            .ok_or(SocketError::NotConnected)
    }

    /// Local address; the unspecified address before `bind`
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::BadDescriptor`] for unknown descriptors.
    pub fn local_addr(&self, fd: Fd) -> SocketResult<SocketAddr> {
        let vs = self.virtual_socket(fd)?;
        Ok(vs.local_addr().unwrap_or_else(|| any_addr(vs.family())))
    }
}

impl std::fmt::Debug for NetworkService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkService")
            .field("taps", &self.taps.read().len())
            .field("descriptors", &self.descriptors.len())
            .field("live", &self.accounting.live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MacAddress, NullSink};

    fn service_with_tap() -> NetworkService {
        let service = NetworkService::new(StackConfig {
            max_sockets: 4,
            ..StackConfig::default()
        });
        let config = TapConfig::new(NetworkId(0x10), MacAddress([0x02, 0, 0, 0, 0, 0x10]))
            .with_address("10.9.0.1/24".parse().unwrap());
        service.attach_tap(config, Arc::new(NullSink)).unwrap();
        service
    }

    #[test]
    fn test_socket_limit() {
        let service = service_with_tap();
        let fds: Vec<Fd> = (0..4)
            .map(|_| service.socket(AddressFamily::Inet, SocketType::Stream).unwrap())
            .collect();
        assert_eq!(fds, vec![3, 4, 5, 6]);
        assert_eq!(service.socket_count(), 4);
        assert!(matches!(
            service.socket(AddressFamily::Inet, SocketType::Stream),
            Err(SocketError::SocketLimit { limit: 4 })
        ));

        service.close(fds[0]).unwrap();
        assert_eq!(service.socket_count(), 3);
        assert!(service.socket(AddressFamily::Inet, SocketType::Datagram).is_ok());
    }

    #[test]
    fn test_close_twice_and_bad_descriptor() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let vs = service.virtual_socket(fd).unwrap();

        service.close(fd).unwrap();
        assert!(vs.is_closed());
        service.close(fd).unwrap();
        assert_eq!(service.socket_count(), 0);

        assert_eq!(service.read(fd, &mut [0u8; 4]), Err(SocketError::BadDescriptor(fd)));
        assert_eq!(service.close(99), Err(SocketError::BadDescriptor(99)));
    }

    #[test]
    fn test_descriptor_table_stays_bounded() {
        let service = service_with_tap();
        let mut last = 0;
        for _ in 0..10_000 {
            last = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
            service.close(last).unwrap();
        }
        assert_eq!(service.socket_count(), 0);
        assert_eq!(service.descriptor_count(), 0);
        assert_eq!(service.closed.lock().len(), CLOSED_DESCRIPTOR_MEMORY);

        // Recent descriptors still close cleanly, forgotten ones do not
        service.close(last).unwrap();
        assert_eq!(service.close(FIRST_FD), Err(SocketError::BadDescriptor(FIRST_FD)));
    }

    #[test]
    fn test_descriptor_allocation_wraps_and_skips_used() {
        let service = service_with_tap();
        let kept = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let closed = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        service.close(closed).unwrap();
        assert_eq!((kept, closed), (FIRST_FD, FIRST_FD + 1));

        service.next_fd.store(Fd::MAX, Ordering::Relaxed);
        let high = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert_eq!(high, Fd::MAX);

        // Open and recently closed descriptors are both skipped
        let wrapped = service.socket(AddressFamily::Inet, SocketType::Datagram).unwrap();
        assert_eq!(wrapped, FIRST_FD + 2);
        assert!(service.virtual_socket(kept).unwrap().is_stream());
        assert!(!service.virtual_socket(wrapped).unwrap().is_stream());
    }

    #[test]
    fn test_bind_selects_owning_tap() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        service.bind(fd, "10.9.0.1:7000".parse().unwrap()).unwrap();
        assert_eq!(service.local_addr(fd).unwrap(), "10.9.0.1:7000".parse().unwrap());
        assert_eq!(
            service.bind(fd, "10.9.0.1:7001".parse().unwrap()),
            Err(SocketError::InvalidArgument("socket already bound"))
        );

        let other = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert_eq!(
            service.bind(other, "10.9.0.1:7000".parse().unwrap()),
            Err(SocketError::AddressInUse(7000))
        );

        let stray = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let ip: std::net::IpAddr = "192.168.0.1".parse().unwrap();
        assert_eq!(
            service.bind(stray, SocketAddr::new(ip, 80)),
            Err(SocketError::AddressNotAvailable(ip))
        );
    }

    #[test]
    fn test_ephemeral_bind_and_family_mismatch() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Datagram).unwrap();
        assert_eq!(
            service.bind(fd, "[::]:0".parse().unwrap()),
            Err(SocketError::FamilyMismatch)
        );
        service.bind(fd, "0.0.0.0:0".parse().unwrap()).unwrap();
        let local = service.local_addr(fd).unwrap();
        assert!(tapsock_core::EPHEMERAL_PORTS.contains(&local.port()));
    }

    #[test]
    fn test_listen_and_accept_empty() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert!(service.listen(fd, 4).is_err());
        assert_eq!(service.accept(fd), Err(SocketError::NotListening));

        service.bind(fd, "10.9.0.1:9000".parse().unwrap()).unwrap();
        service.listen(fd, 0).unwrap();
        assert_eq!(service.accept(fd), Err(SocketError::WouldBlock));
        service.close(fd).unwrap();
        assert_eq!(service.socket_count(), 0);
    }

    #[test]
    fn test_unconnected_stream_errors() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        assert_eq!(service.write(fd, b"x"), Err(SocketError::NotConnected));
        assert_eq!(service.read(fd, &mut [0u8; 1]), Err(SocketError::NotConnected));
        assert_eq!(service.peer_addr(fd), Err(SocketError::NotConnected));
        assert_eq!(
            service.local_addr(fd).unwrap(),
            "0.0.0.0:0".parse().unwrap()
        );
    }

    #[test]
    fn test_options() {
        let service = service_with_tap();
        let stream = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let dgram = service.socket(AddressFamily::Inet, SocketType::Datagram).unwrap();

        assert_eq!(
            service.get_option(stream, OptionName::NoDelay),
            Ok(OptionValue::Flag(true))
        );
        service.set_option(stream, SocketOption::NoDelay(false)).unwrap();
        assert_eq!(
            service.get_option(stream, OptionName::NoDelay),
            Ok(OptionValue::Flag(false))
        );
        assert_eq!(
            service.set_option(dgram, SocketOption::NoDelay(true)),
            Err(SocketError::WrongSocketType("stream"))
        );
        assert_eq!(
            service.get_option(dgram, OptionName::Type),
            Ok(OptionValue::Type(SocketType::Datagram))
        );
        assert_eq!(service.get_option(stream, OptionName::Error), Ok(OptionValue::Error(0)));
    }

    #[test]
    fn test_connect_without_route() {
        let service = service_with_tap();
        let fd = service.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        let ip: std::net::IpAddr = "172.20.0.1".parse().unwrap();
        assert_eq!(
            service.connect(fd, SocketAddr::new(ip, 80)),
            Err(SocketError::NoRoute(ip))
        );
    }

    #[test]
    fn test_attach_same_network_twice() {
        let service = service_with_tap();
        let config = TapConfig::new(NetworkId(0x10), MacAddress([0x02, 0, 0, 0, 0, 0x11]));
        assert!(matches!(
            service.attach_tap(config, Arc::new(NullSink)),
            Err(TapError::AlreadyAttached(NetworkId(0x10)))
        ));
        assert!(service.detach_tap(NetworkId(0x10)));
        assert!(!service.detach_tap(NetworkId(0x10)));
        assert!(service.taps().is_empty());
    }
}
