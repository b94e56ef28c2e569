//! Datagram framing for the application channel.
//!
//! Each datagram is stored and delivered as one unit:
//!
//! ```text
//! +----------------+---------------------------+-------------------+
//! | length (u32 LE)| address structure (24 B)  | payload           |
//! +----------------+---------------------------+-------------------+
//!                   \______ covered by length field _______________/
//! ```
//!
//! The address structure is fixed-size regardless of family:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 2    | family (`AF_INET`/`AF_INET6`, LE)       |
//! | 2      | 2    | port (network order)                    |
//! | 4      | 16   | address (IPv4 uses the first 4 bytes)   |
//! | 20     | 4    | IPv6 scope id (LE), zero for IPv4       |
//!
//! Units are written into a [`RingBuffer`] only when the whole unit fits, so
//! adjacent datagrams are never merged or split.

use crate::ring_buffer::RingBuffer;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use thiserror::Error;

/// Size of the length prefix
pub const LEN_PREFIX_SIZE: usize = 4;

/// Size of the fixed address structure
pub const ADDR_STRUCT_SIZE: usize = 24;

/// Bytes preceding the payload in every unit
pub const HEADER_SIZE: usize = LEN_PREFIX_SIZE + ADDR_STRUCT_SIZE;

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Fewer bytes than the header requires
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Length field smaller than the address structure
    #[error("invalid length field: {0}")]
    InvalidLength(u32),

    /// Unknown address family
    #[error("unknown address family: {0}")]
    UnknownFamily(u16),
}

/// Total unit size for a payload of `payload_len` bytes
pub fn framed_len(payload_len: usize) -> usize {
    HEADER_SIZE + payload_len
}

/// Encode a socket address into the fixed address structure
pub fn encode_addr(addr: &SocketAddr) -> [u8; ADDR_STRUCT_SIZE] {
    let mut out = [0u8; ADDR_STRUCT_SIZE];
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    match addr {
        SocketAddr::V4(v4) => {
            out[0..2].copy_from_slice(&(libc::AF_INET as u16).to_le_bytes());
            out[4..8].copy_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            out[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_le_bytes());
            out[4..20].copy_from_slice(&v6.ip().octets());
            out[20..24].copy_from_slice(&v6.scope_id().to_le_bytes());
        }
    }
    out
}

/// Decode the fixed address structure
///
/// # Errors
///
/// Returns [`FramingError::Truncated`] for short input and
/// [`FramingError::UnknownFamily`] for a family other than IPv4/IPv6.
pub fn decode_addr(bytes: &[u8]) -> Result<SocketAddr, FramingError> {
    if bytes.len() < ADDR_STRUCT_SIZE {
        return Err(FramingError::Truncated {
            needed: ADDR_STRUCT_SIZE,
            available: bytes.len(),
        });
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]);
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);

    if family == libc::AF_INET as u16 {
        let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    } else if family == libc::AF_INET6 as u16 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[4..20]);
        let scope_id = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Ok(SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from(octets),
            port,
            0,
            scope_id,
        )))
    } else {
        Err(FramingError::UnknownFamily(family))
    }
}

/// Encode a complete unit into a fresh buffer
pub fn encode_frame(addr: &SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(framed_len(payload.len()));
    let len = (ADDR_STRUCT_SIZE + payload.len()) as u32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&encode_addr(addr));
    out.extend_from_slice(payload);
    out
}

/// Decode one unit from the front of `bytes`.
///
/// Returns the sender address, the payload, and the total number of bytes the
/// unit occupied.
///
/// # Errors
///
/// Returns an error if the unit is incomplete or the header is malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<(SocketAddr, &[u8], usize), FramingError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FramingError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if (len as usize) < ADDR_STRUCT_SIZE {
        return Err(FramingError::InvalidLength(len));
    }
    let total = LEN_PREFIX_SIZE + len as usize;
    if bytes.len() < total {
        return Err(FramingError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let addr = decode_addr(&bytes[LEN_PREFIX_SIZE..HEADER_SIZE])?;
    Ok((addr, &bytes[HEADER_SIZE..total], total))
}

/// Append one unit to `ring` if it fits entirely.
///
/// Returns `false` without writing anything when there is not enough room.
pub fn push_datagram(ring: &mut RingBuffer, addr: &SocketAddr, payload: &[u8]) -> bool {
    if ring.free() < framed_len(payload.len()) {
        return false;
    }
    let len = (ADDR_STRUCT_SIZE + payload.len()) as u32;
    ring.produce(&len.to_le_bytes());
    ring.produce(&encode_addr(addr));
    ring.produce(payload);
    true
}

/// Payload length and sender of the unit at the front of `ring`
///
/// # Errors
///
/// Returns an error if the buffered header is malformed.
pub fn peek_datagram(ring: &RingBuffer) -> Result<Option<(usize, SocketAddr)>, FramingError> {
    if ring.count() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_SIZE];
    ring.peek_into(0, &mut header);
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len < ADDR_STRUCT_SIZE {
        return Err(FramingError::InvalidLength(len as u32));
    }
    let addr = decode_addr(&header[LEN_PREFIX_SIZE..])?;
    Ok(Some((len - ADDR_STRUCT_SIZE, addr)))
}

/// Remove the unit at the front of `ring`, copying its payload into `out`.
///
/// A payload longer than `out` is truncated and the rest of the unit is
/// discarded, matching datagram receive semantics. Returns the number of bytes
/// copied and the sender.
///
/// # Errors
///
/// Returns an error if the buffered header is malformed. The ring is cleared
/// in that case since unit boundaries can no longer be recovered.
pub fn pop_datagram(
    ring: &mut RingBuffer,
    out: &mut [u8],
) -> Result<Option<(usize, SocketAddr)>, FramingError> {
    let (payload_len, addr) = match peek_datagram(ring) {
        Ok(Some(front)) => front,
        Ok(None) => return Ok(None),
        Err(e) => {
            ring.clear();
            return Err(e);
        }
    };
    let copy = payload_len.min(out.len());
    ring.peek_into(HEADER_SIZE, &mut out[..copy]);
    ring.consume(framed_len(payload_len));
    Ok(Some((copy, addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), port)
    }

    #[test]
    fn test_addr_layout_v4() {
        let bytes = encode_addr(&v4(9000));
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), libc::AF_INET as u16);
        assert_eq!(&bytes[2..4], &9000u16.to_be_bytes());
        assert_eq!(&bytes[4..8], &[10, 1, 2, 3]);
        assert!(bytes[8..].iter().all(|&b| b == 0));
        assert_eq!(decode_addr(&bytes).unwrap(), v4(9000));
    }

    #[test]
    fn test_addr_v6_scope() {
        let addr = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 53, 0, 7));
        let decoded = decode_addr(&encode_addr(&addr)).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_decode_unknown_family() {
        let mut bytes = encode_addr(&v4(1));
        bytes[0] = 0xFF;
        bytes[1] = 0x7F;
        assert_eq!(
            decode_addr(&bytes),
            Err(FramingError::UnknownFamily(0x7FFF))
        );
    }

    #[test]
    fn test_length_field_covers_addr_and_payload() {
        let frame = encode_frame(&v4(1), b"abc");
        assert_eq!(frame.len(), HEADER_SIZE + 3);
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, ADDR_STRUCT_SIZE + 3);

        let (addr, payload, used) = decode_frame(&frame).unwrap();
        assert_eq!(addr, v4(1));
        assert_eq!(payload, b"abc");
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_decode_frame_truncated() {
        let frame = encode_frame(&v4(1), b"abcdef");
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FramingError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ring_units_stay_separate() {
        let mut ring = RingBuffer::new(1024);
        assert!(push_datagram(&mut ring, &v4(1), &[1u8; 10]));
        assert!(push_datagram(&mut ring, &v4(2), &[]));
        assert!(push_datagram(&mut ring, &v4(3), &[3u8; 50]));

        let mut out = [0u8; 128];
        assert_eq!(pop_datagram(&mut ring, &mut out).unwrap(), Some((10, v4(1))));
        assert_eq!(pop_datagram(&mut ring, &mut out).unwrap(), Some((0, v4(2))));
        assert_eq!(pop_datagram(&mut ring, &mut out).unwrap(), Some((50, v4(3))));
        assert_eq!(pop_datagram(&mut ring, &mut out).unwrap(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_push_rejects_partial_unit() {
        let mut ring = RingBuffer::new(HEADER_SIZE + 4);
        assert!(!push_datagram(&mut ring, &v4(1), b"12345"));
        assert!(ring.is_empty());
        assert!(push_datagram(&mut ring, &v4(1), b"1234"));
        assert!(ring.is_full());
    }

    #[test]
    fn test_pop_truncates_to_output() {
        let mut ring = RingBuffer::new(256);
        push_datagram(&mut ring, &v4(1), b"0123456789");
        push_datagram(&mut ring, &v4(2), b"next");

        let mut small = [0u8; 4];
        assert_eq!(pop_datagram(&mut ring, &mut small).unwrap(), Some((4, v4(1))));
        assert_eq!(&small, b"0123");

        // Remainder of the first unit is discarded
        assert_eq!(pop_datagram(&mut ring, &mut small).unwrap(), Some((4, v4(2))));
        assert_eq!(&small, b"next");
    }
}
