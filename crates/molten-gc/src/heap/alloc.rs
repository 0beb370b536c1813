//! Per-thread allocation contexts.
//!
//! Each mutator owns a span of Gen0 segment memory and bumps through it
//! without locking. Refills go through the heap, which charges the span
//! against the Gen0 budget and tiles the fresh span with a filler object;
//! every bump re-tiles the remainder before publishing the new object, so
//! a context's span is linearly walkable at every instant. The fields are
//! atomics because the collector snapshots the span of a thread that
//! missed the suspension deadline while that thread keeps bumping.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::{TypeId, HEADER_BYTES};

/// A bump-allocation span owned by one mutator thread.
///
/// Empty (`ptr == limit == 0`) until the first refill and after every
/// collection. Only the owning thread advances `ptr`; the heap lock
/// serializes refills against collections.
#[derive(Debug, Default)]
pub struct AllocContext {
    ptr: AtomicUsize,
    limit: AtomicUsize,
}

impl AllocContext {
    /// Bumps out `size` bytes. Returns the object address and the actual
    /// allocation size, which may exceed `size` by tail padding: a span
    /// remainder smaller than a filler header is folded into the final
    /// allocation so no unwalkable gap is left behind.
    ///
    /// Owner thread only.
    pub fn bump(&self, size: usize) -> Option<(usize, usize)> {
        debug_assert_eq!(size % crate::object::OBJECT_ALIGN, 0);
        let ptr = self.ptr.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        let remaining = limit.wrapping_sub(ptr);
        if ptr == 0 || remaining < size {
            return None;
        }
        let mut alloc_size = size;
        if remaining - size < HEADER_BYTES && remaining != size {
            alloc_size = remaining;
        }
        self.ptr.store(ptr + alloc_size, Ordering::Relaxed);
        Some((ptr, alloc_size))
    }

    /// Installs a fresh span. Owner thread, or the heap on its behalf
    /// under the heap lock.
    pub fn refill(&self, start: usize, len: usize) {
        self.ptr.store(start, Ordering::Relaxed);
        self.limit.store(start + len, Ordering::Release);
    }

    /// Empties the context, returning the unused remainder span (if any).
    /// The remainder is already covered by a filler object.
    pub fn take_remainder(&self) -> Option<(usize, usize)> {
        let span = self.span();
        self.ptr.store(0, Ordering::Relaxed);
        self.limit.store(0, Ordering::Release);
        span
    }

    /// Snapshot of the unused remainder `(ptr, len)`, or `None` when empty.
    /// Racy when read off-thread: the span may shrink concurrently, never
    /// grow, so the snapshot is a conservative overestimate.
    #[must_use]
    pub fn span(&self) -> Option<(usize, usize)> {
        let ptr = self.ptr.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);
        (ptr != 0 && limit > ptr).then(|| (ptr, limit - ptr))
    }

    /// Bytes left in the current span.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.span().map_or(0, |(_, len)| len)
    }
}

/// Why an allocation request failed.
#[derive(Debug)]
pub enum AllocError {
    /// The OS refused to reserve or commit memory.
    OutOfMemory(io::Error),
    /// The requested type index was never registered.
    UnknownType(TypeId),
    /// The heap is shutting down.
    ShuttingDown,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory(err) => write!(f, "out of memory: {err}"),
            Self::UnknownType(ty) => write!(f, "unregistered type index {}", ty.0),
            Self::ShuttingDown => write!(f, "heap is shutting down"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OutOfMemory(err) => Some(err),
            Self::UnknownType(_) | Self::ShuttingDown => None,
        }
    }
}

impl From<io::Error> for AllocError {
    fn from(err: io::Error) -> Self {
        Self::OutOfMemory(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context_never_allocates() {
        let ctx = AllocContext::default();
        assert_eq!(ctx.bump(16), None);
        assert_eq!(ctx.take_remainder(), None);
    }

    #[test]
    fn bump_advances_and_exhausts() {
        let ctx = AllocContext::default();
        ctx.refill(0x1000, 64);
        assert_eq!(ctx.bump(32), Some((0x1000, 32)));
        assert_eq!(ctx.bump(32), Some((0x1020, 32)));
        assert_eq!(ctx.bump(16), None);
    }

    #[test]
    fn small_tail_is_folded_into_last_allocation() {
        let ctx = AllocContext::default();
        ctx.refill(0x1000, 40);
        // 24 bytes would leave 16 behind: fine as a filler.
        let (_, size) = ctx.bump(24).unwrap();
        assert_eq!(size, 24);
        assert_eq!(ctx.remaining(), 16);

        ctx.refill(0x2000, 40);
        // 32 bytes would leave 8 behind: folded into the allocation.
        let (_, size) = ctx.bump(32).unwrap();
        assert_eq!(size, 40);
        assert_eq!(ctx.remaining(), 0);
    }

    #[test]
    fn span_serves_size_over_object_size_allocations() {
        let ctx = AllocContext::default();
        ctx.refill(0x1000, 256);
        let mut served = 0;
        while ctx.bump(24).is_some() {
            served += 1;
        }
        assert_eq!(served, 256 / 24);
    }

    #[test]
    fn take_remainder_empties_the_context() {
        let ctx = AllocContext::default();
        ctx.refill(0x1000, 64);
        ctx.bump(16).unwrap();
        assert_eq!(ctx.take_remainder(), Some((0x1010, 48)));
        assert_eq!(ctx.remaining(), 0);
        assert_eq!(ctx.bump(16), None);
    }
}
