//! Count limited chunk buffer.

use std::cmp::Ordering;

use rayon;
use rayon::slice::ParallelSliceMut;

/// Default number of records buffered in memory before a chunk is spilled to disk.
pub const DEFAULT_MAX_ITEMS_PER_CHUNK: usize = 100_000;

/// Chunk buffer builder.
#[derive(Clone, Debug)]
pub struct LimitedBufferBuilder {
    buffer_limit: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    /// Creates a builder of buffers holding at most `buffer_limit` records.
    /// If `preallocate` is set the whole buffer capacity is allocated up front.
    pub fn new(buffer_limit: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            buffer_limit,
            preallocate,
        }
    }

    /// Returns the maximum number of records a buffer holds.
    pub fn limit(&self) -> usize {
        self.buffer_limit
    }

    /// Creates a new buffer.
    pub fn build<T>(&self) -> LimitedBuffer<T> {
        if self.preallocate {
            LimitedBuffer::with_capacity(self.buffer_limit)
        } else {
            LimitedBuffer::new(self.buffer_limit)
        }
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        LimitedBufferBuilder {
            buffer_limit: DEFAULT_MAX_ITEMS_PER_CHUNK,
            preallocate: false,
        }
    }
}

/// Buffer limited by elements count.
pub struct LimitedBuffer<T> {
    limit: usize,
    inner: Vec<T>,
}

impl<T> LimitedBuffer<T> {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::new(),
        }
    }

    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            inner: Vec::with_capacity(limit),
        }
    }

    /// Adds a new element to the buffer.
    pub fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the buffer reached the limit.
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    /// Removes all elements keeping the allocated memory for the next chunk.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.inner.iter()
    }

    /// Sorts the buffer on the current thread. The sort is stable.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        self.inner.sort_by(compare);
    }
}

impl<T: Send> LimitedBuffer<T> {
    /// Sorts the buffer using the current rayon thread pool. The sort is stable.
    pub fn par_sort_by<F>(&mut self, compare: F)
    where
        F: Fn(&T, &T) -> Ordering + Sync,
    {
        self.inner.as_mut_slice().par_sort_by(compare);
    }
}
