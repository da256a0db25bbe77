//! One semispace: a growable vector of pads with hysteresis on resize.

pub(crate) const INITIAL_HEAP_PADS: usize = 1024;

/// A single semispace. `size` is the logical pad count the collector may
/// use; the backing vector only reallocates when it is too small or more
/// than three times too large, and then overshoots by half to damp churn.
pub(crate) struct Space {
    pub(crate) buf: Vec<u64>,
    pub(crate) size: usize,
}

impl Space {
    pub(crate) fn new() -> Self {
        Self {
            buf: vec![0; INITIAL_HEAP_PADS],
            size: INITIAL_HEAP_PADS,
        }
    }

    /// Pads actually held by the allocator (capacity, not logical size).
    pub(crate) fn alloc(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn resize(&mut self, size: usize) {
        if self.buf.len() < size || 3 * size < self.buf.len() {
            let target = size + (size >> 1);
            self.buf.resize(target.max(INITIAL_HEAP_PADS), 0);
        }
        self.size = size;
    }
}
