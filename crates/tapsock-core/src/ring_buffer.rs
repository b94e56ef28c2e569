//! Fixed-capacity byte ring buffers for RX/TX staging.
//!
//! Every virtual socket owns two of these: the RX buffer is filled by the Tap
//! event-loop thread and drained by the application, the TX buffer the other way
//! round.
//!
//! # Design
//!
//! - **Fixed capacity**: the backing storage is allocated once and never grows
//! - **Truncating produce**: writes beyond the free space are cut short, callers
//!   check the returned count
//! - **Contiguous regions**: direct slice access to the readable and writable
//!   spans so data can be copied straight into or out of the embedded stack
//! - **Not synchronized**: the owning socket wraps each buffer in its own lock and
//!   designates exactly one producer and one consumer role at a time

/// Fixed-capacity FIFO byte queue
///
/// # Invariants
///
/// `count() + free() == capacity()` after every operation.
///
/// # Example
///
/// ```
/// use tapsock_core::ring_buffer::RingBuffer;
///
/// let mut ring = RingBuffer::new(8);
/// assert_eq!(ring.produce(b"hello world"), 8);
/// assert!(ring.is_full());
///
/// let mut out = [0u8; 5];
/// assert_eq!(ring.read(&mut out), 5);
/// assert_eq!(&out, b"hello");
/// assert_eq!(ring.count(), 3);
/// ```
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    /// Read cursor (consumer side)
    read_pos: usize,
    /// Write cursor (producer side)
    write_pos: usize,
    /// Bytes currently buffered, disambiguates full from empty
    count: usize,
}

impl RingBuffer {
    /// Create a new ring buffer holding exactly `capacity` bytes
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be greater than 0");

        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            count: 0,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of buffered (readable) bytes
    pub fn count(&self) -> usize {
        self.count
    }

    /// Remaining space in bytes
    pub fn free(&self) -> usize {
        self.capacity() - self.count
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if buffer is full
    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Append as much of `data` as fits, returning the number of bytes written.
    pub fn produce(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let region = self.writable_region();
            if region.is_empty() {
                break;
            }
            let n = region.len().min(data.len() - written);
            region[..n].copy_from_slice(&data[written..written + n]);
            self.commit(n);
            written += n;
        }
        written
    }

    /// Mark `n` bytes of the writable region as filled.
    ///
    /// Returns the number of bytes actually committed, clamped to the free space.
    pub fn commit(&mut self, n: usize) -> usize {
        let n = n.min(self.free());
        self.write_pos = (self.write_pos + n) % self.capacity();
        self.count += n;
        n
    }

    /// Discard up to `n` bytes from the front, returning the number discarded.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.count);
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.count -= n;
        if self.count == 0 {
            // Re-align so the next produce gets the largest contiguous span
            self.read_pos = 0;
            self.write_pos = 0;
        }
        n
    }

    /// Contiguous readable span starting at the read cursor.
    ///
    /// May be shorter than `count()` when the data wraps.
    pub fn readable_region(&self) -> &[u8] {
        let end = (self.read_pos + self.count).min(self.capacity());
        &self.storage[self.read_pos..end]
    }

    /// Contiguous writable span starting at the write cursor.
    ///
    /// May be shorter than `free()` when the free space wraps.
    pub fn writable_region(&mut self) -> &mut [u8] {
        if self.is_full() {
            return &mut [];
        }
        let end = if self.write_pos >= self.read_pos {
            self.capacity()
        } else {
            self.read_pos
        };
        &mut self.storage[self.write_pos..end]
    }

    /// Readable bytes after skipping the first `offset`, as at most two slices.
    ///
    /// Used by the no-copy write path, which keeps handed-off bytes at the front
    /// of the buffer until the peer acknowledges them.
    pub fn slices_from(&self, offset: usize) -> (&[u8], &[u8]) {
        if offset >= self.count {
            return (&[], &[]);
        }
        let start = (self.read_pos + offset) % self.capacity();
        let len = self.count - offset;
        let first_len = len.min(self.capacity() - start);
        let first = &self.storage[start..start + first_len];
        let second = &self.storage[..len - first_len];
        (first, second)
    }

    /// Copy buffered bytes starting at `offset` into `out` without consuming them.
    pub fn peek_into(&self, offset: usize, out: &mut [u8]) -> usize {
        let (first, second) = self.slices_from(offset);
        let n1 = first.len().min(out.len());
        out[..n1].copy_from_slice(&first[..n1]);
        let n2 = second.len().min(out.len() - n1);
        out[n1..n1 + n2].copy_from_slice(&second[..n2]);
        n1 + n2
    }

    /// Copy up to `out.len()` bytes out of the buffer and consume them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek_into(0, out);
        self.consume(n)
    }

    /// Drop all buffered bytes
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_basic() {
        let mut ring = RingBuffer::new(16);

        assert!(ring.is_empty());
        assert!(!ring.is_full());
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.capacity(), 16);

        assert_eq!(ring.produce(b"abcd"), 4);
        assert_eq!(ring.count(), 4);
        assert_eq!(ring.free(), 12);
        assert_eq!(ring.readable_region(), b"abcd");

        assert_eq!(ring.consume(2), 2);
        assert_eq!(ring.readable_region(), b"cd");
    }

    #[test]
    fn test_ring_produce_truncates_at_capacity() {
        let mut ring = RingBuffer::new(4);

        assert_eq!(ring.produce(b"123456"), 4);
        assert!(ring.is_full());
        assert_eq!(ring.produce(b"7"), 0);
        assert_eq!(ring.count() + ring.free(), ring.capacity());
    }

    #[test]
    fn test_ring_wraparound() {
        let mut ring = RingBuffer::new(8);

        ring.produce(b"012345");
        ring.consume(4);
        // Data now sits at positions 4..6, free space wraps
        assert_eq!(ring.produce(b"abcdef"), 6);
        assert!(ring.is_full());

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out, b"45abcdef");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_ring_regions_split_on_wrap() {
        let mut ring = RingBuffer::new(8);

        ring.produce(b"xxxxxx");
        ring.consume(5);
        ring.produce(b"ABCDE");

        // Readable: "x" at 5, "ABCDE" wrapping from 6
        assert_eq!(ring.readable_region(), b"xAB");
        let (first, second) = ring.slices_from(0);
        assert_eq!(first, b"xAB");
        assert_eq!(second, b"CDE");
    }

    #[test]
    fn test_ring_writable_region_and_commit() {
        let mut ring = RingBuffer::new(8);

        let region = ring.writable_region();
        assert_eq!(region.len(), 8);
        region[..3].copy_from_slice(b"xyz");
        assert_eq!(ring.commit(3), 3);
        assert_eq!(ring.readable_region(), b"xyz");

        // Commit cannot exceed free space
        assert_eq!(ring.commit(100), 5);
        assert!(ring.is_full());
        assert!(ring.writable_region().is_empty());
    }

    #[test]
    fn test_ring_slices_from_offset() {
        let mut ring = RingBuffer::new(8);
        ring.produce(b"hello");

        let (first, second) = ring.slices_from(2);
        assert_eq!(first, b"llo");
        assert!(second.is_empty());

        let (first, second) = ring.slices_from(5);
        assert!(first.is_empty() && second.is_empty());
    }

    #[test]
    fn test_ring_peek_does_not_consume() {
        let mut ring = RingBuffer::new(8);
        ring.produce(b"peek");

        let mut out = [0u8; 2];
        assert_eq!(ring.peek_into(1, &mut out), 2);
        assert_eq!(&out, b"ee");
        assert_eq!(ring.count(), 4);
    }

    #[test]
    fn test_ring_consume_clamps() {
        let mut ring = RingBuffer::new(8);
        ring.produce(b"abc");

        assert_eq!(ring.consume(10), 3);
        assert!(ring.is_empty());
        assert_eq!(ring.consume(1), 0);
    }

    #[test]
    fn test_ring_clear() {
        let mut ring = RingBuffer::new(4);
        ring.produce(b"abcd");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), 4);
    }

    #[test]
    #[should_panic(expected = "Capacity must be greater than 0")]
    fn test_zero_capacity_panics() {
        let _ring = RingBuffer::new(0);
    }
}
