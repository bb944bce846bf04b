//! Growable double-cursor byte buffer.
//!
//! ```text
//! 0          out             in              capacity
//! | garbage  |  used (live)  |  spare        |
//! ```
//!
//! Bytes are appended at `in` and consumed from `out`. Compaction moves the
//! live bytes back to offset zero; growth doubles the storage (or jumps
//! straight to the required size).

/// Capacity used by [`ByteBuffer::default`].
pub const DEFAULT_CAPACITY: usize = 4096;

/// Receive or transmit buffer of one connection.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    /// Backing storage; its length is the capacity.
    raw: Vec<u8>,
    /// Write cursor.
    in_pos: usize,
    /// Read cursor, `out_pos <= in_pos`.
    out_pos: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ByteBuffer {
    /// Creates a buffer with `capacity` bytes of storage (the default
    /// capacity if zero).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        Self {
            raw: vec![0; capacity],
            in_pos: 0,
            out_pos: 0,
        }
    }

    /// Total storage.
    pub fn capacity(&self) -> usize {
        self.raw.len()
    }

    /// Consumed bytes still occupying the front of the storage.
    pub const fn garbage(&self) -> usize {
        self.out_pos
    }

    /// Unread bytes.
    pub const fn used(&self) -> usize {
        self.in_pos - self.out_pos
    }

    /// Room left after the write cursor.
    pub fn spare(&self) -> usize {
        self.raw.len() - self.in_pos
    }

    /// `true` if there is nothing to read.
    pub const fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Unread bytes, without consuming them.
    pub fn readable(&self) -> &[u8] {
        &self.raw[self.out_pos..self.in_pos]
    }

    /// Spare storage for zero-copy fills; follow with
    /// [`write_advance`](Self::write_advance).
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.raw[self.in_pos..]
    }

    /// Consumes up to `n` unread bytes. Returns the bytes left unread.
    pub fn read_advance(&mut self, n: usize) -> usize {
        self.out_pos = (self.out_pos + n).min(self.in_pos);
        self.used()
    }

    /// Marks up to `n` spare bytes as written. Returns the spare left.
    pub fn write_advance(&mut self, n: usize) -> usize {
        self.in_pos = (self.in_pos + n).min(self.raw.len());
        self.spare()
    }

    /// Moves live bytes to the front when spare is low or garbage is high.
    /// Returns the resulting spare.
    pub fn tidy(&mut self) -> usize {
        let quarter = self.raw.len() >> 2;
        if self.used() == 0 {
            self.in_pos = 0;
            self.out_pos = 0;
        } else if self.spare() < quarter || self.garbage() > quarter {
            self.raw.copy_within(self.out_pos..self.in_pos, 0);
            self.in_pos -= self.out_pos;
            self.out_pos = 0;
        }
        self.spare()
    }

    /// Ensures at least `n` spare bytes, tidying first and growing if that
    /// is not enough.
    pub fn reserve(&mut self, n: usize) {
        if n <= self.spare() {
            return;
        }
        self.tidy();
        if n <= self.spare() {
            return;
        }
        let cap = self.raw.len();
        let grown = if cap > n { cap << 1 } else { n << 1 };
        self.raw.resize(grown, 0);
    }

    /// Appends `bytes`, growing as needed. Returns `bytes.len()`.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.reserve(bytes.len());
        let end = self.in_pos + bytes.len();
        self.raw[self.in_pos..end].copy_from_slice(bytes);
        self.write_advance(bytes.len());
        bytes.len()
    }

    /// Copies up to `into.len()` unread bytes without consuming them.
    pub fn peek(&self, into: &mut [u8]) -> usize {
        let n = into.len().min(self.used());
        into[..n].copy_from_slice(&self.raw[self.out_pos..self.out_pos + n]);
        n
    }

    /// Copies and consumes up to `into.len()` unread bytes.
    pub fn read(&mut self, into: &mut [u8]) -> usize {
        let n = self.peek(into);
        self.read_advance(n);
        n
    }

    /// Drops every unread byte.
    pub fn clear(&mut self) {
        self.in_pos = 0;
        self.out_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &[u8] = b"hello buffer\0";

    #[test]
    fn write_then_read() {
        let mut buf = ByteBuffer::with_capacity(DEFAULT_CAPACITY);
        assert_eq!(buf.capacity(), DEFAULT_CAPACITY);
        assert_eq!(buf.garbage(), 0);
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.spare(), DEFAULT_CAPACITY);

        let writes = DEFAULT_CAPACITY / HELLO.len() / 3 * 2;
        let reads = writes / 2;
        for _ in 0..writes {
            assert_eq!(buf.write(HELLO), HELLO.len());
        }
        assert_eq!(buf.capacity(), DEFAULT_CAPACITY);
        assert_eq!(buf.used(), HELLO.len() * writes);
        assert_eq!(buf.spare(), DEFAULT_CAPACITY - HELLO.len() * writes);

        let mut msg = [0u8; 64];
        let mut n = 0;
        for _ in 0..reads {
            n = buf.read(&mut msg[..HELLO.len()]);
        }
        assert_eq!(&msg[..n], HELLO);
        assert_eq!(buf.garbage(), HELLO.len() * reads);
        assert_eq!(buf.used(), HELLO.len() * (writes - reads));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = ByteBuffer::default();
        buf.write(b"abc");
        let mut out = [0u8; 8];
        assert_eq!(buf.peek(&mut out), 3);
        assert_eq!(buf.used(), 3);
        assert_eq!(buf.read(&mut out[..2]), 2);
        assert_eq!(buf.readable(), b"c");
    }

    #[test]
    fn tidy_compacts_live_bytes() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.write(b"0123456789");
        buf.read_advance(6);
        assert_eq!(buf.garbage(), 6);
        buf.tidy();
        assert_eq!(buf.garbage(), 0);
        assert_eq!(buf.readable(), b"6789");
        assert_eq!(buf.spare(), 12);
    }

    #[test]
    fn tidy_resets_when_drained() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.write(b"abc");
        buf.read_advance(3);
        assert_eq!(buf.tidy(), 16);
    }

    #[test]
    fn grows_past_capacity() {
        let mut buf = ByteBuffer::with_capacity(8);
        let data = [7u8; 20];
        assert_eq!(buf.write(&data), 20);
        assert!(buf.capacity() >= 20);
        assert_eq!(buf.readable(), &data[..]);
    }

    #[test]
    fn zero_copy_fill() {
        let mut buf = ByteBuffer::with_capacity(8);
        buf.reserve(4);
        buf.writable()[..4].copy_from_slice(b"wxyz");
        buf.write_advance(4);
        assert_eq!(buf.readable(), b"wxyz");
        assert_eq!(buf.read_advance(10), 0);
    }
}
