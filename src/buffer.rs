use crate::error::Error;
use bytes::{Buf, BytesMut};

/// Byte staging buffer with a hard size cap and a reserve/commit protocol.
///
/// The receive path reserves space, reads from the socket into it and
/// commits however many bytes arrived; the send path reserves an upper
/// bound for a frame (compressed output length is bounded but not known up
/// front) and commits the exact final size. Consumed bytes are released
/// from the front, and the unread region is always a single contiguous
/// slice, which is the contract the frame parser relies on.
pub(crate) struct IoBuffer {
    buf: BytesMut,
    reserved: usize,
    max_size: usize,
}

impl IoBuffer {
    pub fn new(initial: usize, max_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial),
            reserved: 0,
            max_size,
        }
    }

    /// Bytes committed and not yet consumed.
    pub fn used(&self) -> usize {
        self.buf.len() - self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// The contiguous unread region.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.buf.len() - self.reserved]
    }

    /// Reserve `n` writable bytes past the committed region. A previous
    /// reservation that was never committed (e.g. a socket read that was
    /// cancelled mid-await) is discarded first.
    pub fn reserve(&mut self, n: usize) -> Result<&mut [u8], Error> {
        if self.reserved > 0 {
            let committed = self.buf.len() - self.reserved;
            self.buf.truncate(committed);
            self.reserved = 0;
        }

        if self.used() + n > self.max_size {
            return Err(Error::BufferLimitExceeded {
                needed: self.used() + n,
                cap: self.max_size,
            });
        }

        let start = self.buf.len();
        self.buf.resize(start + n, 0);
        self.reserved = n;
        Ok(&mut self.buf[start..])
    }

    /// Commit `written` bytes of the current reservation and release the
    /// rest.
    pub fn commit(&mut self, written: usize) {
        debug_assert!(written <= self.reserved);
        let len = self.buf.len();
        self.buf.truncate(len - self.reserved + written);
        self.reserved = 0;
    }

    /// Release `n` consumed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.reserved == 0);
        debug_assert!(n <= self.buf.len());
        self.buf.advance(n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.reserved = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_consume() {
        let mut buf = IoBuffer::new(16, 1024);
        assert!(buf.is_empty());

        let region = buf.reserve(8).unwrap();
        region[..3].copy_from_slice(b"abc");
        buf.commit(3);
        assert_eq!(buf.used(), 3);
        assert_eq!(buf.as_slice(), b"abc");

        let region = buf.reserve(3).unwrap();
        region.copy_from_slice(b"def");
        buf.commit(3);
        assert_eq!(buf.as_slice(), b"abcdef");

        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cdef");

        buf.consume(4);
        assert!(buf.is_empty());
    }

    fn fill(buf: &mut IoBuffer, data: &[u8]) {
        let region = buf.reserve(data.len()).unwrap();
        region.copy_from_slice(data);
        buf.commit(data.len());
    }

    #[test]
    fn test_stale_reservation_is_discarded() {
        let mut buf = IoBuffer::new(16, 1024);
        fill(&mut buf, b"xy");

        // reserve but never commit, as a cancelled read would
        let _ = buf.reserve(8).unwrap();
        assert_eq!(buf.as_slice(), b"xy");

        fill(&mut buf, b"1234");
        assert_eq!(buf.as_slice(), b"xy1234");
    }

    #[test]
    fn test_cap_is_enforced() {
        let mut buf = IoBuffer::new(4, 8);
        fill(&mut buf, b"123456");
        assert!(matches!(
            buf.reserve(3),
            Err(Error::BufferLimitExceeded { .. })
        ));
        // freeing space makes room again
        buf.consume(6);
        fill(&mut buf, b"12345678");
        assert_eq!(buf.used(), 8);
    }

    #[test]
    fn test_commit_less_than_reserved() {
        let mut buf = IoBuffer::new(16, 1024);
        let region = buf.reserve(10).unwrap();
        region[..2].copy_from_slice(b"ok");
        buf.commit(2);
        assert_eq!(buf.as_slice(), b"ok");
    }
}
