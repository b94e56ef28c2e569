//! Blocking socket demos run against a [`NetworkService`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tapsock_core::{AddressFamily, Fd, SocketResult, SocketType};
use tapsock_stack::NetworkService;
use tracing::{debug, info, warn};

/// Sleep between retries of an operation that would block
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Retry `op` while it would block, until `deadline`
fn retry<T>(deadline: Option<Instant>, mut op: impl FnMut() -> SocketResult<T>) -> anyhow::Result<T> {
    loop {
        match op() {
            Err(e) if e.is_transient() => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    anyhow::bail!("timed out waiting for socket");
                }
                thread::sleep(RETRY_INTERVAL);
            }
            other => return other.map_err(Into::into),
        }
    }
}

fn unspecified(family: AddressFamily, port: u16) -> SocketAddr {
    match family {
        AddressFamily::Inet => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        AddressFamily::Inet6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Echo every stream connection accepted on `port`
///
/// # Errors
///
/// Returns an error if the listening socket cannot be set up.
pub fn echo_server(
    service: Arc<NetworkService>,
    family: AddressFamily,
    port: u16,
) -> anyhow::Result<()> {
    let listener = service.socket(family, SocketType::Stream)?;
    service.bind(listener, unspecified(family, port))?;
    service.listen(listener, 0)?;
    println!("Echo server listening on port {}", port);

    loop {
        let (fd, peer) = retry(None, || service.accept(listener))?;
        info!("accepted {} as fd {}", peer, fd);
        let service = Arc::clone(&service);
        thread::Builder::new()
            .name(format!("echo-{}", fd))
            .spawn(move || {
                if let Err(e) = echo_connection(&service, fd) {
                    warn!("echo fd {}: {}", fd, e);
                }
                if let Err(e) = service.close(fd) {
                    warn!("close fd {}: {}", fd, e);
                }
            })?;
    }
}

fn echo_connection(service: &NetworkService, fd: Fd) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = retry(None, || service.read(fd, &mut buf))?;
        if n == 0 {
            debug!("fd {}: peer finished", fd);
            return Ok(());
        }
        write_all(service, fd, &buf[..n], None)?;
    }
}

fn write_all(
    service: &NetworkService,
    fd: Fd,
    mut data: &[u8],
    deadline: Option<Instant>,
) -> anyhow::Result<()> {
    while !data.is_empty() {
        let n = retry(deadline, || service.write(fd, data))?;
        data = &data[n..];
    }
    Ok(())
}

/// Connect to `target`, send `message` and print the echoed reply
///
/// # Errors
///
/// Returns an error if the connection fails or no full reply arrives
/// within `timeout`.
pub fn client(
    service: &NetworkService,
    target: SocketAddr,
    message: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let fd = service.socket(AddressFamily::of(&target.ip()), SocketType::Stream)?;
    service.connect(fd, target)?;
    println!(
        "Connected {} -> {}",
        service.local_addr(fd)?,
        service.peer_addr(fd)?
    );

    let deadline = Some(Instant::now() + timeout);
    write_all(service, fd, message.as_bytes(), deadline)?;

    let mut reply = Vec::with_capacity(message.len());
    let mut buf = vec![0u8; 4096];
    while reply.len() < message.len() {
        let n = retry(deadline, || service.read(fd, &mut buf))?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    println!("Reply: {}", String::from_utf8_lossy(&reply));

    service.close(fd)?;
    Ok(())
}

/// Answer every datagram received on `port` with the same payload
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub fn datagram_responder(
    service: &NetworkService,
    family: AddressFamily,
    port: u16,
) -> anyhow::Result<()> {
    let fd = service.socket(family, SocketType::Datagram)?;
    service.bind(fd, unspecified(family, port))?;
    println!("Datagram responder on port {}", port);

    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = retry(None, || service.recv_from(fd, &mut buf))?;
        println!("{} bytes from {}: {}", n, from, hex::encode(&buf[..n]));
        retry(None, || service.send_to(fd, &buf[..n], from))?;
    }
}

/// Send one datagram to `target` and print the reply
///
/// # Errors
///
/// Returns an error if sending fails or no reply arrives within `timeout`.
pub fn datagram_ping(
    service: &NetworkService,
    target: SocketAddr,
    message: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let fd = service.socket(AddressFamily::of(&target.ip()), SocketType::Datagram)?;
    let deadline = Some(Instant::now() + timeout);
    let sent = retry(deadline, || service.send_to(fd, message.as_bytes(), target))?;
    println!("Sent {} bytes to {}", sent, target);

    let mut buf = vec![0u8; 65536];
    let (n, from) = retry(deadline, || service.recv_from(fd, &mut buf))?;
    println!("Reply from {}: {}", from, String::from_utf8_lossy(&buf[..n]));

    service.close(fd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapsock_core::SocketError;

    #[test]
    fn test_retry_gives_up_at_deadline() {
        let start = Instant::now();
        let result: anyhow::Result<()> =
            retry(Some(start + Duration::from_millis(20)), || Err(SocketError::WouldBlock));
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_retry_passes_through_hard_errors() {
        let mut calls = 0;
        let result: anyhow::Result<()> = retry(None, || {
            calls += 1;
            Err(SocketError::NotConnected)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_unspecified_matches_family() {
        assert!(unspecified(AddressFamily::Inet, 7).is_ipv4());
        assert!(unspecified(AddressFamily::Inet6, 7).is_ipv6());
    }
}
