//! POSIX-convention wrappers over [`NetworkService`].
//!
//! Every function takes raw integer arguments, returns a non-negative value on
//! success and `-1` on failure, with the error code left in a thread-local
//! read by [`errno`].

use crate::options::{OptionName, SocketOption};
use crate::service::NetworkService;
use std::cell::Cell;
use std::net::SocketAddr;
use tapsock_core::{AddressFamily, Fd, ShutdownHow, SocketError, SocketResult, SocketType};

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Error code of the last failed call on this thread
pub fn errno() -> i32 {
    ERRNO.with(Cell::get)
}

fn set_errno(code: i32) {
    ERRNO.with(|e| e.set(code));
}

fn status(result: SocketResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => fail(&e) as i32,
    }
}

fn length(result: SocketResult<usize>) -> isize {
    match result {
        Ok(n) => n as isize,
        Err(e) => fail(&e),
    }
}

fn fail(e: &SocketError) -> isize {
    tracing::trace!("call failed: {}", e);
    set_errno(e.errno());
    -1
}

fn parse_socket(domain: i32, ty: i32, protocol: i32) -> SocketResult<(AddressFamily, SocketType)> {
    let family =
        AddressFamily::from_raw(domain).ok_or(SocketError::AddressFamilyNotSupported(domain))?;
    let socket_type = SocketType::from_raw(ty).ok_or(SocketError::SocketTypeNotSupported(ty))?;
    let expected = match socket_type {
        SocketType::Stream => libc::IPPROTO_TCP,
        SocketType::Datagram => libc::IPPROTO_UDP,
    };
    if protocol != 0 && protocol != expected {
        return Err(SocketError::ProtocolNotSupported(protocol));
    }
    Ok((family, socket_type))
}

/// `socket(2)`
pub fn socket(service: &NetworkService, domain: i32, ty: i32, protocol: i32) -> Fd {
    match parse_socket(domain, ty, protocol).and_then(|(f, t)| service.socket(f, t)) {
        Ok(fd) => fd,
        Err(e) => fail(&e) as i32,
    }
}

/// `bind(2)`
pub fn bind(service: &NetworkService, fd: Fd, addr: &SocketAddr) -> i32 {
    status(service.bind(fd, *addr))
}

/// `connect(2)`; blocks until the handshake completes or fails
pub fn connect(service: &NetworkService, fd: Fd, addr: &SocketAddr) -> i32 {
    status(service.connect(fd, *addr))
}

/// `listen(2)`; a non-positive backlog selects the default
pub fn listen(service: &NetworkService, fd: Fd, backlog: i32) -> i32 {
    status(service.listen(fd, backlog.max(0) as usize))
}

/// `accept(2)`; never blocks
pub fn accept(service: &NetworkService, fd: Fd, peer: Option<&mut SocketAddr>) -> Fd {
    match service.accept(fd) {
        Ok((new_fd, addr)) => {
            if let Some(out) = peer {
                *out = addr;
            }
            new_fd
        }
        Err(e) => fail(&e) as i32,
    }
}

/// `read(2)`
pub fn read(service: &NetworkService, fd: Fd, buf: &mut [u8]) -> isize {
    length(service.read(fd, buf))
}

/// `write(2)`
pub fn write(service: &NetworkService, fd: Fd, buf: &[u8]) -> isize {
    length(service.write(fd, buf))
}

/// `recvfrom(2)`
pub fn recvfrom(
    service: &NetworkService,
    fd: Fd,
    buf: &mut [u8],
    from: Option<&mut SocketAddr>,
) -> isize {
    length(service.recv_from(fd, buf).map(|(n, addr)| {
        if let Some(out) = from {
            *out = addr;
        }
        n
    }))
}

/// `sendto(2)`
pub fn sendto(service: &NetworkService, fd: Fd, buf: &[u8], to: &SocketAddr) -> isize {
    length(service.send_to(fd, buf, *to))
}

/// `shutdown(2)` with `SHUT_RD`, `SHUT_WR` or `SHUT_RDWR`
pub fn shutdown(service: &NetworkService, fd: Fd, how: i32) -> i32 {
    let how = ShutdownHow::from_raw(how).ok_or(SocketError::InvalidArgument("bad shutdown mode"));
    status(how.and_then(|how| service.shutdown(fd, how)))
}

/// `close(2)`
pub fn close(service: &NetworkService, fd: Fd) -> i32 {
    status(service.close(fd))
}

/// `setsockopt(2)`
pub fn setsockopt(service: &NetworkService, fd: Fd, level: i32, name: i32, value: &[u8]) -> i32 {
    status(
        SocketOption::from_raw(level, name, value).and_then(|opt| service.set_option(fd, opt)),
    )
}

/// `getsockopt(2)`; copies at most `value.len()` bytes and stores the full
/// length in `len`
pub fn getsockopt(
    service: &NetworkService,
    fd: Fd,
    level: i32,
    name: i32,
    value: &mut [u8],
    len: &mut usize,
) -> i32 {
    let result = OptionName::from_raw(level, name)
        .and_then(|name| service.get_option(fd, name))
        .map(|v| {
            let bytes = v.to_bytes();
            let n = bytes.len().min(value.len());
            value[..n].copy_from_slice(&bytes[..n]);
            *len = bytes.len();
        });
    status(result)
}

/// `getpeername(2)`
pub fn getpeername(service: &NetworkService, fd: Fd, out: &mut SocketAddr) -> i32 {
    status(service.peer_addr(fd).map(|addr| *out = addr))
}

/// `getsockname(2)`
pub fn getsockname(service: &NetworkService, fd: Fd, out: &mut SocketAddr) -> i32 {
    status(service.local_addr(fd).map(|addr| *out = addr))
}
