//! Growable inbound buffer with a fixed baseline.
//!
//! A connection reads into a buffer of `baseline` bytes. Frames larger than
//! that grow it (at least doubling, at least to the size the codec asks
//! for); once every buffered byte has been consumed the buffer drops back
//! to the baseline allocation. Unread bytes are never discarded by a
//! resize.

/// Inbound byte buffer with read/write cursors.
#[derive(Debug)]
pub struct InboundBuffer {
    data: Vec<u8>,
    /// First unread byte.
    start: usize,
    /// One past the last buffered byte.
    end: usize,
    baseline: usize,
}

impl InboundBuffer {
    pub fn new(baseline: usize) -> Self {
        let baseline = baseline.max(1);
        Self {
            data: vec![0; baseline],
            start: 0,
            end: 0,
            baseline,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Number of buffered, unread bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Buffered bytes not yet consumed.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Free space after the buffered bytes, never empty.
    ///
    /// When the tail is exhausted the unread bytes are moved to the front;
    /// if that frees nothing the buffer doubles.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        if self.end == self.data.len() {
            if self.start > 0 {
                self.compact();
            } else {
                let doubled = self.data.len() * 2;
                self.resize(doubled);
            }
        }
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes written into [`writable_mut`](Self::writable_mut) as buffered.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len(), "commit past capacity");
        self.end = (self.end + n).min(self.data.len());
    }

    /// Drop `n` bytes from the front of the readable region.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consume past buffered data");
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Make room for a frame of `required` bytes starting at the first
    /// unread byte.
    pub fn reserve_frame(&mut self, required: usize) {
        if self.start + required <= self.data.len() {
            return;
        }
        if required <= self.data.len() {
            self.compact();
            return;
        }
        let target = required.max(self.data.len() * 2);
        self.resize(target);
    }

    /// Return to the baseline allocation if nothing is buffered.
    ///
    /// Returns `true` when the buffer actually shrank.
    pub fn reset_if_drained(&mut self) -> bool {
        if !self.is_empty() || self.data.len() == self.baseline {
            return false;
        }
        self.data = vec![0; self.baseline];
        self.start = 0;
        self.end = 0;
        true
    }

    fn compact(&mut self) {
        self.data.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    fn resize(&mut self, capacity: usize) {
        let mut data = vec![0; capacity];
        let len = self.len();
        data[..len].copy_from_slice(self.readable());
        self.data = data;
        self.start = 0;
        self.end = len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buf: &mut InboundBuffer, bytes: &[u8]) {
        let mut written = 0;
        while written < bytes.len() {
            let spare = buf.writable_mut();
            let n = spare.len().min(bytes.len() - written);
            spare[..n].copy_from_slice(&bytes[written..written + n]);
            buf.commit(n);
            written += n;
        }
    }

    #[test]
    fn starts_at_baseline_and_empty() {
        let buf = InboundBuffer::new(64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.baseline(), 64);
        assert!(buf.is_empty());
        assert!(buf.readable().is_empty());
    }

    #[test]
    fn zero_baseline_is_clamped() {
        let mut buf = InboundBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        assert!(!buf.writable_mut().is_empty());
    }

    #[test]
    fn commit_and_consume_track_cursors() {
        let mut buf = InboundBuffer::new(16);
        fill(&mut buf, b"abcdef");
        assert_eq!(buf.readable(), b"abcdef");

        buf.consume(2);
        assert_eq!(buf.readable(), b"cdef");
        assert_eq!(buf.len(), 4);

        buf.consume(4);
        assert!(buf.is_empty());
        // Both cursors rewind once everything is consumed.
        assert_eq!(buf.writable_mut().len(), 16);
    }

    #[test]
    fn full_tail_compacts_before_growing() {
        let mut buf = InboundBuffer::new(8);
        fill(&mut buf, b"12345678");
        buf.consume(6);

        let spare = buf.writable_mut().len();
        assert_eq!(buf.capacity(), 8);
        assert_eq!(spare, 6);
        assert_eq!(buf.readable(), b"78");
    }

    #[test]
    fn full_buffer_doubles_on_write() {
        let mut buf = InboundBuffer::new(8);
        fill(&mut buf, b"12345678");
        assert_eq!(buf.writable_mut().len(), 8);
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable(), b"12345678");
    }

    #[test]
    fn reserve_frame_grows_at_least_double() {
        let mut buf = InboundBuffer::new(100);
        fill(&mut buf, b"header");
        buf.reserve_frame(120);
        assert_eq!(buf.capacity(), 200);
        assert_eq!(buf.readable(), b"header");
    }

    #[test]
    fn reserve_frame_grows_to_required_when_larger() {
        let mut buf = InboundBuffer::new(100);
        fill(&mut buf, b"header");
        buf.reserve_frame(1000);
        assert_eq!(buf.capacity(), 1000);
        assert_eq!(buf.readable(), b"header");
    }

    #[test]
    fn reserve_frame_compacts_when_frame_fits() {
        let mut buf = InboundBuffer::new(10);
        fill(&mut buf, b"xxxxxxxab");
        buf.consume(7);
        buf.reserve_frame(8);
        assert_eq!(buf.capacity(), 10);
        assert_eq!(buf.readable(), b"ab");
        assert_eq!(buf.writable_mut().len(), 8);
    }

    #[test]
    fn shrinks_to_baseline_only_when_drained() {
        let mut buf = InboundBuffer::new(32);
        let frame = vec![7u8; 320];
        buf.reserve_frame(frame.len());
        fill(&mut buf, &frame);
        assert!(buf.capacity() >= 320);

        buf.consume(100);
        assert!(!buf.reset_if_drained(), "must not shrink mid-frame");
        assert_eq!(buf.len(), 220);

        buf.consume(220);
        assert!(buf.reset_if_drained());
        assert_eq!(buf.capacity(), 32);
        assert!(!buf.reset_if_drained());
    }
}
