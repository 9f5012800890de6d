//! Fixed-capacity ring buffer staging raw socket bytes.
//!
//! Read and write sides each expose at most two contiguous segments so the
//! transport can use vectored I/O without copying. Overflow on `write`
//! surfaces as a short write, never an error.

/// Bounded FIFO byte buffer.
pub struct ByteBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl ByteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes available to read.
    pub fn rleft(&self) -> usize {
        self.len
    }

    /// Bytes of space available to write.
    pub fn wleft(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy from `src`, returning how many bytes were accepted.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut copied = 0;
        {
            let (first, second) = self.write_bufs();
            let n = src.len().min(first.len());
            first[..n].copy_from_slice(&src[..n]);
            copied += n;
            let m = (src.len() - n).min(second.len());
            second[..m].copy_from_slice(&src[n..n + m]);
            copied += m;
        }
        self.fill(copied);
        copied
    }

    /// Commit `n` bytes produced through `write_bufs`.
    pub fn fill(&mut self, n: usize) {
        debug_assert!(n <= self.wleft());
        self.len += n;
    }

    /// Advance the read cursor by `n` bytes.
    pub fn drain(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.start = (self.start + n) % self.buf.len();
        self.len -= n;
    }

    /// Restore maximum contiguous capacity once fully drained.
    pub fn reset(&mut self) {
        if self.len == 0 {
            self.start = 0;
        }
    }

    /// Readable region as up to two contiguous segments.
    pub fn read_bufs(&self) -> (&[u8], &[u8]) {
        let cap = self.buf.len();
        let first_len = self.len.min(cap - self.start);
        let second_len = self.len - first_len;
        let (wrapped, tail) = self.buf.split_at(self.start);
        (&tail[..first_len], &wrapped[..second_len])
    }

    /// Writable region as up to two contiguous segments. Pair with `fill`.
    pub fn write_bufs(&mut self) -> (&mut [u8], &mut [u8]) {
        let cap = self.buf.len();
        let end = (self.start + self.len) % cap;
        let wleft = cap - self.len;
        let first_len = wleft.min(cap - end);
        let second_len = wleft - first_len;
        let (wrapped, tail) = self.buf.split_at_mut(end);
        (&mut tail[..first_len], &mut wrapped[..second_len])
    }

    /// Contiguous prefix of the readable region.
    pub fn head(&self) -> &[u8] {
        self.read_bufs().0
    }
}
