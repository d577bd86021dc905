//! Bounded FIFO byte store with zero-copy access to both ends.
//!
//! A [`Buffer`] either owns its storage or is a read-only *view* over a
//! borrowed slice. Views are used to hand request-body slices to consume
//! functions without copying; the two kinds are indistinguishable on the
//! consuming side.

use std::fmt;

/// FIFO byte store over a contiguous region.
///
/// Two cursors track the region in use: `bottom` is the first byte still to
/// be consumed, `top` the first free byte. `0 <= bottom <= top <= capacity`
/// holds at all times. Cursor misuse (consuming more than is buffered,
/// producing past the capacity, writing into a view) is a programmer error
/// and panics.
pub struct Buffer<'a> {
    store: Store<'a>,
    bottom: usize,
    top: usize,
}

enum Store<'a> {
    Owned(Box<[u8]>),
    View(&'a [u8]),
}

impl Buffer<'static> {
    /// Creates an owned buffer able to hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Buffer {
            store: Store::Owned(vec![0; capacity].into_boxed_slice()),
            bottom: 0,
            top: 0,
        }
    }
}

impl<'a> Buffer<'a> {
    /// Creates a read-only view over externally owned bytes; the whole slice
    /// counts as already produced.
    pub fn view(data: &'a [u8]) -> Self {
        Buffer {
            top: data.len(),
            store: Store::View(data),
            bottom: 0,
        }
    }

    fn capacity(&self) -> usize {
        match &self.store {
            Store::Owned(data) => data.len(),
            Store::View(data) => data.len(),
        }
    }

    fn data(&self) -> &[u8] {
        match &self.store {
            Store::Owned(data) => data,
            Store::View(data) => data,
        }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.store {
            Store::Owned(data) => data,
            Store::View(_) => panic!("write into a view buffer"),
        }
    }

    /// Number of bytes currently buffered.
    #[inline]
    pub fn usage(&self) -> usize {
        self.top - self.bottom
    }

    /// Bytes that can be produced without compacting first.
    #[inline]
    pub fn direct_avail(&self) -> usize {
        self.capacity() - self.top
    }

    /// Total bytes that can still be produced, counting the consumed region
    /// a compaction would reclaim.
    #[inline]
    pub fn total_avail(&self) -> usize {
        self.capacity() - self.usage()
    }

    /// Slides the buffered bytes down to the start of the region and returns
    /// the new [`direct_avail`](Self::direct_avail). Idempotent when nothing
    /// has been consumed yet.
    pub fn compact(&mut self) -> usize {
        if self.bottom == 0 {
            return self.direct_avail();
        }
        let (bottom, top) = (self.bottom, self.top);
        self.data_mut().copy_within(bottom..top, 0);
        self.top = top - bottom;
        self.bottom = 0;
        self.direct_avail()
    }

    /// Next buffered byte without consuming it, or `None` when empty.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.data().get(self.bottom).copied().filter(|_| self.usage() > 0)
    }

    /// Consumes and returns one byte.
    #[inline]
    pub fn consume(&mut self) -> u8 {
        assert!(self.usage() > 0, "no bytes to consume in buffer");
        let c = self.data()[self.bottom];
        self.bottom += 1;
        c
    }

    /// The buffered bytes, for zero-copy reads; pair with
    /// [`consumed`](Self::consumed).
    #[inline]
    pub fn to_consume(&self) -> &[u8] {
        &self.data()[self.bottom..self.top]
    }

    /// Marks `amount` buffered bytes as consumed.
    #[inline]
    pub fn consumed(&mut self, amount: usize) {
        assert!(amount <= self.usage(), "buffer underflow");
        self.bottom += amount;
    }

    /// Appends one byte, compacting first if the tail region is full.
    pub fn produce(&mut self, c: u8) {
        if self.direct_avail() == 0 {
            assert!(self.compact() > 0, "no bytes available in buffer");
        }
        let top = self.top;
        self.data_mut()[top] = c;
        self.top += 1;
    }

    /// Transfers as many bytes as fit from `source` into this buffer.
    pub fn produce_from(&mut self, source: &mut Buffer<'_>) {
        let n = source.usage().min(self.total_avail());
        self.produce_exact(source, n);
    }

    /// Transfers exactly `n` bytes from `source`, compacting as needed.
    pub fn produce_exact(&mut self, source: &mut Buffer<'_>, n: usize) {
        if self.direct_avail() < n {
            assert!(self.compact() >= n, "not enough space to take the copied bytes");
        }
        let top = self.top;
        self.data_mut()[top..top + n].copy_from_slice(&source.to_consume()[..n]);
        self.produced(n);
        source.consumed(n);
    }

    /// The free tail region, for zero-copy writes; pair with
    /// [`produced`](Self::produced).
    #[inline]
    pub fn to_produce(&mut self) -> &mut [u8] {
        let top = self.top;
        let cap = self.capacity();
        &mut self.data_mut()[top..cap]
    }

    /// Marks `amount` bytes of the tail region as produced.
    #[inline]
    pub fn produced(&mut self, amount: usize) {
        assert!(amount <= self.direct_avail(), "buffer overflow");
        self.top += amount;
    }
}

impl fmt::Debug for Buffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("bottom", &self.bottom)
            .field("top", &self.top)
            .field("view", &matches!(self.store, Store::View(_)))
            .finish()
    }
}
