//! Property-based tests for tapsock
//!
//! Uses proptest to verify buffer and framing invariants across large input
//! spaces.

use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tapsock_core::RingBuffer;
use tapsock_core::framing::{self, HEADER_SIZE};

fn sender(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), port)
}

// ============================================================================
// Ring Buffer Properties
// ============================================================================

mod ring_buffer_properties {
    use super::*;

    proptest! {
        /// Bytes come out in the order they went in, however writes and
        /// reads are split
        #[test]
        fn fifo_under_arbitrary_splits(
            capacity in 1usize..512,
            data in prop::collection::vec(any::<u8>(), 0..4096),
            write_chunks in prop::collection::vec(1usize..300, 1..64),
            read_chunks in prop::collection::vec(1usize..300, 1..64),
        ) {
            let mut ring = RingBuffer::new(capacity);
            let mut written = 0;
            let mut out = Vec::with_capacity(data.len());
            let mut step = 0;

            while out.len() < data.len() {
                let w = write_chunks[step % write_chunks.len()];
                let end = (written + w).min(data.len());
                written += ring.produce(&data[written..end]);

                let r = read_chunks[step % read_chunks.len()];
                let mut buf = vec![0u8; r];
                let n = ring.read(&mut buf);
                out.extend_from_slice(&buf[..n]);
                step += 1;
            }

            prop_assert_eq!(out, data);
            prop_assert!(ring.is_empty());
        }

        /// count + free always equals capacity and produce never exceeds free
        #[test]
        fn capacity_invariant(
            capacity in 1usize..256,
            ops in prop::collection::vec((any::<bool>(), 0usize..300), 1..200),
        ) {
            let mut ring = RingBuffer::new(capacity);
            for (is_write, len) in ops {
                if is_write {
                    let free = ring.free();
                    let n = ring.produce(&vec![0xAB; len]);
                    prop_assert_eq!(n, len.min(free));
                } else {
                    let count = ring.count();
                    let n = ring.consume(len);
                    prop_assert_eq!(n, len.min(count));
                }
                prop_assert_eq!(ring.count() + ring.free(), ring.capacity());
                prop_assert!(ring.readable_region().len() <= ring.count());
            }
        }

        /// Offsets into the buffered data see the same bytes a read would
        #[test]
        fn slices_from_matches_contents(
            capacity in 8usize..128,
            prefix in 0usize..128,
            data in prop::collection::vec(any::<u8>(), 1..128),
            offset in 0usize..128,
        ) {
            let mut ring = RingBuffer::new(capacity);
            // Move the cursors so the data can wrap
            let skipped = ring.produce(&vec![0; prefix.min(capacity - 1)]);
            ring.consume(skipped.saturating_sub(1));

            let stored = ring.produce(&data);
            let mut expected: Vec<u8> = Vec::new();
            if skipped > 0 {
                expected.push(0);
            }
            expected.extend_from_slice(&data[..stored]);

            let (first, second) = ring.slices_from(offset);
            let mut seen = first.to_vec();
            seen.extend_from_slice(second);
            let start = offset.min(expected.len());
            prop_assert_eq!(&seen[..], &expected[start..]);
        }
    }
}

// ============================================================================
// Cross-Thread Stress
// ============================================================================

mod concurrency {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn producer_consumer_preserves_order() {
        const OPERATIONS: usize = 10_000;

        let ring = Arc::new(Mutex::new(RingBuffer::new(97)));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = 0usize;
                let mut ops = 0;
                while ops < OPERATIONS {
                    let chunk: Vec<u8> = (next..next + 1 + ops % 13).map(|i| i as u8).collect();
                    let n = ring.lock().produce(&chunk);
                    next += n;
                    ops += 1;
                    if n == 0 {
                        thread::yield_now();
                    }
                }
                next
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut received = Vec::new();
                let mut buf = [0u8; 17];
                for _ in 0..OPERATIONS {
                    let n = ring.lock().read(&mut buf);
                    received.extend_from_slice(&buf[..n]);
                    if n == 0 {
                        thread::yield_now();
                    }
                }
                received
            })
        };

        let produced = producer.join().unwrap();
        let mut received = consumer.join().unwrap();

        // Drain whatever the consumer left behind
        let mut rest = vec![0u8; 97];
        let n = ring.lock().read(&mut rest);
        received.extend_from_slice(&rest[..n]);

        assert_eq!(received.len(), produced);
        for (i, byte) in received.iter().enumerate() {
            assert_eq!(*byte, i as u8, "out of order at {}", i);
        }
    }
}

// ============================================================================
// End-to-End Stream Properties
// ============================================================================

mod stream_properties {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tapsock_core::{AddressFamily, Fd, MAX_MTU, SocketType};
    use tapsock_integration_tests::fixtures::{LinkedTaps, retry};
    use tapsock_stack::NetworkService;

    const TIMEOUT: Duration = Duration::from_secs(10);
    const PORT: u16 = 7000;

    /// Client on node A connected to an accepted socket on node B
    fn connected(net: &LinkedTaps) -> (Fd, Fd) {
        let server = net.b.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        net.b.bind(server, net.b_addr(PORT)).unwrap();
        net.b.listen(server, 1).unwrap();

        let client = net.a.socket(AddressFamily::Inet, SocketType::Stream).unwrap();
        net.a.connect(client, net.b_addr(PORT)).unwrap();
        let (conn, _) = retry(TIMEOUT, || net.b.accept(server)).unwrap();
        (client, conn)
    }

    fn write_all(service: &NetworkService, fd: Fd, mut data: &[u8]) {
        while !data.is_empty() {
            let n = retry(TIMEOUT, || service.write(fd, data)).unwrap();
            data = &data[n..];
        }
    }

    /// Read with buffer sizes taken in turn from `sizes` until `len` bytes
    /// arrived, checking the RX ring accounting after every read
    fn read_in_steps(service: &NetworkService, fd: Fd, len: usize, sizes: &[usize]) -> Vec<u8> {
        let vs = service.virtual_socket(fd).unwrap();
        let mut out = Vec::with_capacity(len);
        let mut step = 0;
        while out.len() < len {
            let mut buf = vec![0u8; sizes[step % sizes.len()]];
            let n = retry(TIMEOUT, || service.read(fd, &mut buf)).unwrap();
            assert!(n > 0, "stream ended after {} of {} bytes", out.len(), len);
            out.extend_from_slice(&buf[..n]);
            {
                let rx = vs.rx();
                assert_eq!(rx.count() + rx.free(), rx.capacity());
            }
            step += 1;
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        /// The peer reads exactly the written bytes, in order, however the
        /// writes are split into chunks of 1 to MTU bytes
        #[test]
        fn stream_order_survives_any_chunking(
            data in prop::collection::vec(any::<u8>(), 1..32_768),
            chunks in prop::collection::vec(1usize..=MAX_MTU, 1..32),
        ) {
            let net = LinkedTaps::new();
            let (client, conn) = connected(&net);
            let mtu = net.tap_a.mtu();

            let mut offset = 0;
            let mut step = 0;
            while offset < data.len() {
                let size = chunks[step % chunks.len()].min(mtu);
                let end = (offset + size).min(data.len());
                write_all(&net.a, client, &data[offset..end]);
                offset = end;
                step += 1;
            }

            let received = read_in_steps(&net.b, conn, data.len(), &[4096]);
            prop_assert_eq!(received, data);
            net.a.close(client).unwrap();
            net.b.close(conn).unwrap();
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(4))]

        /// Reads racing the event loop's RX fills never lose, duplicate or
        /// reorder bytes over 10,000 writes
        #[test]
        fn concurrent_reads_against_inbound_traffic(
            write_sizes in prop::collection::vec(1usize..64, 10_000),
            read_sizes in prop::collection::vec(1usize..512, 1..64),
        ) {
            let net = LinkedTaps::new();
            let (client, conn) = connected(&net);
            let total: usize = write_sizes.iter().sum();

            let reader = {
                let service = Arc::clone(&net.b);
                thread::spawn(move || read_in_steps(&service, conn, total, &read_sizes))
            };

            let mut next = 0usize;
            for size in write_sizes {
                let chunk: Vec<u8> = (next..next + size).map(|i| i as u8).collect();
                write_all(&net.a, client, &chunk);
                next += size;
            }

            let received = reader.join().unwrap();
            prop_assert_eq!(received.len(), total);
            for (i, byte) in received.iter().enumerate() {
                prop_assert_eq!(*byte, i as u8, "out of order at {}", i);
            }
            net.a.close(client).unwrap();
            net.b.close(conn).unwrap();
        }
    }
}

// ============================================================================
// Datagram Framing Properties
// ============================================================================

mod framing_properties {
    use super::*;

    proptest! {
        /// A unit is stored whole or not at all, and pops in push order
        #[test]
        fn units_are_atomic(
            capacity in HEADER_SIZE..1024,
            sizes in prop::collection::vec(0usize..256, 1..32),
        ) {
            let mut ring = RingBuffer::new(capacity);
            let mut accepted = Vec::new();

            for (i, size) in sizes.iter().enumerate() {
                let before = ring.count();
                let payload = vec![i as u8; *size];
                if framing::push_datagram(&mut ring, &sender(i as u16), &payload) {
                    prop_assert_eq!(ring.count(), before + framing::framed_len(*size));
                    accepted.push((i, *size));
                } else {
                    prop_assert_eq!(ring.count(), before);
                    prop_assert!(ring.free() < framing::framed_len(*size));
                }
            }

            let mut buf = vec![0u8; 256];
            for (i, size) in accepted {
                let (n, from) = framing::pop_datagram(&mut ring, &mut buf).unwrap().unwrap();
                prop_assert_eq!(n, size);
                prop_assert_eq!(from, sender(i as u16));
                prop_assert!(buf[..n].iter().all(|&b| b == i as u8));
            }
            prop_assert!(framing::pop_datagram(&mut ring, &mut buf).unwrap().is_none());
            prop_assert!(ring.is_empty());
        }

        /// Reading into a short buffer truncates and drops the remainder,
        /// leaving the next unit intact
        #[test]
        fn truncation_discards_remainder(
            first in 1usize..200,
            out_len in 0usize..200,
            second in 0usize..200,
        ) {
            let mut ring = RingBuffer::new(1024);
            prop_assert!(framing::push_datagram(&mut ring, &sender(1), &vec![1; first]));
            prop_assert!(framing::push_datagram(&mut ring, &sender(2), &vec![2; second]));

            let mut out = vec![0u8; out_len];
            let (n, _) = framing::pop_datagram(&mut ring, &mut out).unwrap().unwrap();
            prop_assert_eq!(n, first.min(out_len));

            let mut buf = vec![0u8; 200];
            let (n, from) = framing::pop_datagram(&mut ring, &mut buf).unwrap().unwrap();
            prop_assert_eq!(n, second);
            prop_assert_eq!(from, sender(2));
            prop_assert!(buf[..n].iter().all(|&b| b == 2));
        }

        /// Encoded units report the length they occupy
        #[test]
        fn encoded_length_matches(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            trailing in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut bytes = framing::encode_frame(&sender(9), &payload);
            prop_assert_eq!(bytes.len(), framing::framed_len(payload.len()));
            bytes.extend_from_slice(&trailing);

            let (from, decoded, used) = framing::decode_frame(&bytes).unwrap();
            prop_assert_eq!(from, sender(9));
            prop_assert_eq!(decoded, &payload[..]);
            prop_assert_eq!(used, framing::framed_len(payload.len()));
        }

        /// Any strict prefix of a unit is reported as incomplete
        #[test]
        fn prefixes_are_incomplete(
            payload in prop::collection::vec(any::<u8>(), 0..128),
            cut in any::<prop::sample::Index>(),
        ) {
            let bytes = framing::encode_frame(&sender(3), &payload);
            let len = cut.index(bytes.len());
            prop_assert!(framing::decode_frame(&bytes[..len]).is_err());
        }
    }
}
