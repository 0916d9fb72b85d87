//! Small fixed-capacity collections used by the buffer pool's free list.
//!
//! [`SegmentRing`] is the heap-backed counterpart of a `const`-generic array
//! ring buffer: the buffer pool's capacity is a runtime configuration value
//! (`total_buffer_budget / buffer_size`), so the backing storage is a boxed
//! slice of `MaybeUninit<T>` sized once at construction rather than a
//! compile-time array.

mod uninit;

pub use uninit::uninit_boxed_slice;

use std::{fmt, mem::MaybeUninit};

/// A ring buffer over a fixed-capacity boxed slice, used as the free-list
/// storage for pooled segments. Supports LIFO reuse (`push`/`pop` from the
/// same end) for cache-warm behavior, and FIFO draining via `pop_front` for
/// iteration during shutdown accounting.
pub struct SegmentRing<T> {
    inner: Box<[MaybeUninit<T>]>,
    head: usize,
    len: usize,
}

impl<T> SegmentRing<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: uninit_boxed_slice(capacity),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn tail_idx(&self) -> usize {
        let cap = self.capacity();
        (self.head + self.len) % cap
    }

    /// Push a segment onto the ring. Fails (returning the value back) if the
    /// ring is at capacity, which the pool treats as a logic error: the free
    /// list must never hold more segments than were budgeted for it.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        let idx = self.tail_idx();
        // SAFETY: idx is within bounds and currently uninitialized because
        // it lies past the occupied [head, head+len) window.
        unsafe { self.inner.get_unchecked_mut(idx).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Pop the most recently pushed segment (LIFO), the common path for
    /// cache-warm reuse.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.len -= 1;
        let idx = self.tail_idx();
        // SAFETY: idx was written by a prior push and not yet read back.
        Some(unsafe { self.inner.get_unchecked_mut(idx).assume_init_read() })
    }

    /// Pop the oldest segment (FIFO), used when the pool wants to drain the
    /// free list in insertion order (e.g. leak-tracking dumps).
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let idx = self.head;
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        // SAFETY: idx was written by a prior push and not yet read back.
        Some(unsafe { self.inner.get_unchecked_mut(idx).assume_init_read() })
    }
}

impl<T> fmt::Debug for SegmentRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRing")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<T> Drop for SegmentRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifo_reuse() {
        let mut ring = SegmentRing::with_capacity(3);
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.push(3).unwrap();
        assert!(ring.push(4).is_err());

        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(2));
        ring.push(5).unwrap();
        assert_eq!(ring.pop(), Some(5));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn fifo_drain_after_wrap() {
        let mut ring = SegmentRing::with_capacity(4);
        for i in 0..4 {
            ring.push(i).unwrap();
        }
        assert_eq!(ring.pop_front(), Some(0));
        assert_eq!(ring.pop_front(), Some(1));
        ring.push(4).unwrap();
        ring.push(5).unwrap();
        assert_eq!(ring.pop_front(), Some(2));
        assert_eq!(ring.pop_front(), Some(3));
        assert_eq!(ring.pop_front(), Some(4));
        assert_eq!(ring.pop_front(), Some(5));
        assert_eq!(ring.pop_front(), None);
    }

    #[test]
    fn drop_runs_destructors() {
        use std::sync::Arc;

        let item = Arc::new(123);
        {
            let mut ring = SegmentRing::with_capacity(3);
            ring.push(item.clone()).ok().unwrap();
            ring.push(item.clone()).ok().unwrap();
            assert_eq!(Arc::strong_count(&item), 3);
        }
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
