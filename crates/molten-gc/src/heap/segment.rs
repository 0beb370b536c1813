//! Heap segments.
//!
//! A segment is a contiguous region of reserved address space whose base is
//! aligned to [`SEGMENT_SIZE`]. Physical memory is committed in
//! [`COMMIT_GRANULE`] steps as the bump pointer advances and returned to the
//! OS when sweeping frees the tail. The first bytes of every segment hold an
//! in-memory [`SegmentHeader`] starting with a magic word, so masking any
//! object address down to the segment alignment finds the header in one
//! step. Interior pointers into large objects can cross an alignment
//! boundary into payload bytes; lookups that must tolerate arbitrary
//! addresses go through the heap's segment map instead.
//!
//! Small-object segments belong to exactly one generation and are promoted
//! whole. Large-object segments hold a single object each and may span
//! multiple alignment units.

use std::io;
use std::sync::atomic::AtomicU8;

use crate::heap::card::CardTable;
use crate::heap::Generation;
use crate::object::{write_free_filler, ObjRef, HEADER_BYTES, TYPE_FREE};
use sys_vm::Reservation;

/// Size and base alignment of a small-object segment.
pub const SEGMENT_SIZE: usize = 1 << 20;

/// Mask that takes an address to its enclosing alignment-unit base.
pub const SEGMENT_MASK: usize = !(SEGMENT_SIZE - 1);

/// Commit step; a multiple of every supported page size.
pub const COMMIT_GRANULE: usize = 64 * 1024;

/// First word of every segment. "MOLTSEG\0" in ASCII.
pub const SEGMENT_MAGIC: u64 = 0x4d4f_4c54_5345_4700;

/// Header written at the base of every segment's memory.
///
/// Fields are raw because the write barrier reads them through a masked
/// pointer without holding any lock; everything here is immutable after
/// construction except the card bytes it points to.
#[repr(C)]
pub struct SegmentHeader {
    magic: u64,
    base: usize,
    end: usize,
    objects_start: usize,
    cards: *const AtomicU8,
    card_count: usize,
}

impl SegmentHeader {
    /// Whether `addr` falls inside this segment's object range.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.objects_start && addr < self.end
    }

    /// Dirties the card covering `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must lie inside this segment.
    #[inline]
    pub unsafe fn dirty_card(&self, addr: usize) {
        debug_assert!(addr >= self.base && addr < self.end);
        debug_assert!((addr - self.base) >> super::card::CARD_SHIFT < self.card_count);
        // SAFETY: the card array covers base..end per construction.
        unsafe { super::card::dirty_raw(self.cards, addr - self.base) };
    }
}

/// Looks for a segment header at the alignment-unit base enclosing `addr`.
///
/// # Safety
///
/// The masked base address must be committed readable memory. That holds
/// for any address inside a committed object range (the base of a small
/// segment is its header; inside a large object the masked word is payload
/// and the magic check fails). It does NOT hold for arbitrary pointers;
/// conservative scans must use the segment map.
#[inline]
#[must_use]
pub unsafe fn header_for_addr(addr: usize) -> Option<&'static SegmentHeader> {
    let base = addr & SEGMENT_MASK;
    // SAFETY: base is committed per the caller contract; the magic word
    // distinguishes a real header from object payload.
    let header = unsafe { &*(base as *const SegmentHeader) };
    (header.magic == SEGMENT_MAGIC && header.contains(addr)).then_some(header)
}

fn objects_start_offset() -> usize {
    // Keep object bases 16-aligned past the header.
    (std::mem::size_of::<SegmentHeader>() + 15) & !15
}

/// A free gap inside a swept segment, mirrored by a filler object in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeGap {
    pub addr: usize,
    pub len: usize,
}

/// One heap segment.
pub struct Segment {
    reservation: Reservation,
    cards: CardTable,
    pub generation: Generation,
    pub large: bool,
    /// Bytes committed from the segment base.
    committed: usize,
    /// Next unallocated address; objects live in `[objects_start, bump)`.
    bump: usize,
    objects_start: usize,
    end: usize,
    /// Reusable gaps produced by the last sweep, largest last.
    free_gaps: Vec<FreeGap>,
    /// Live bytes as of the last sweep (fillers excluded).
    pub live_bytes: usize,
}

impl Segment {
    /// Creates an empty small-object segment for `generation`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reservation or the initial commit fails.
    pub fn new(generation: Generation) -> io::Result<Self> {
        Self::with_len(generation, SEGMENT_SIZE, false)
    }

    /// Creates a segment holding a single large object of `object_size`
    /// bytes. The whole object range is committed up front.
    ///
    /// # Errors
    ///
    /// Returns the OS error if reservation or commit fails.
    pub fn new_large(generation: Generation, object_size: usize) -> io::Result<Self> {
        let needed = objects_start_offset() + object_size;
        let len = needed.div_ceil(SEGMENT_SIZE) * SEGMENT_SIZE;
        let mut seg = Self::with_len(generation, len, true)?;
        seg.ensure_committed(seg.objects_start + object_size - seg.base())?;
        Ok(seg)
    }

    fn with_len(generation: Generation, len: usize, large: bool) -> io::Result<Self> {
        let reservation = Reservation::reserve_aligned(len, SEGMENT_SIZE)?;
        let base = reservation.base() as usize;
        let objects_start = base + objects_start_offset();
        let end = base + len;
        let cards = CardTable::new(len);

        let seg = Self {
            reservation,
            cards,
            generation,
            large,
            committed: 0,
            bump: objects_start,
            objects_start,
            end,
            free_gaps: Vec::new(),
            live_bytes: 0,
        };
        // Commit the first granule and plant the header.
        let mut seg = seg;
        seg.ensure_committed(objects_start_offset())?;
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            base,
            end,
            objects_start,
            cards: seg.cards.as_ptr(),
            card_count: seg.cards.len(),
        };
        // SAFETY: the first granule is committed and exclusively owned.
        unsafe { (base as *mut SegmentHeader).write(header) };
        Ok(seg)
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.reservation.base() as usize
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    #[must_use]
    pub const fn objects_start(&self) -> usize {
        self.objects_start
    }

    /// Current bump pointer; objects live below it.
    #[must_use]
    pub const fn allocated_end(&self) -> usize {
        self.bump
    }

    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.objects_start && addr < self.bump
    }

    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Bytes still available for bump allocation.
    #[must_use]
    pub const fn bump_remaining(&self) -> usize {
        self.end - self.bump
    }

    fn ensure_committed(&mut self, upto_offset: usize) -> io::Result<()> {
        let needed = upto_offset.div_ceil(COMMIT_GRANULE) * COMMIT_GRANULE;
        let needed = needed.min(self.end - self.base());
        if needed > self.committed {
            self.reservation
                .commit(self.committed, needed - self.committed)?;
            self.committed = needed;
        }
        Ok(())
    }

    /// Carves a span of `[min_len, preferred_len]` bytes from the bump
    /// frontier for an allocation context. The span is extended to the
    /// segment end when the leftover tail would be too small to hold a
    /// filler object, so the object range stays linearly walkable.
    ///
    /// Returns `None` when the segment cannot satisfy `min_len`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if committing the span fails.
    pub fn carve_span(
        &mut self,
        min_len: usize,
        preferred_len: usize,
    ) -> io::Result<Option<(usize, usize)>> {
        debug_assert!(min_len <= preferred_len);
        let remaining = self.bump_remaining();
        if remaining < min_len {
            return Ok(None);
        }
        let mut len = preferred_len.min(remaining);
        if remaining - len < HEADER_BYTES {
            len = remaining;
        }
        self.ensure_committed(self.bump + len - self.base())?;
        let start = self.bump;
        self.bump += len;
        Ok(Some((start, len)))
    }

    /// Takes a swept free gap able to hold `size` bytes. The remainder, if
    /// any, stays on the free list with a fresh filler over it.
    pub fn take_free_gap(&mut self, size: usize) -> Option<usize> {
        let idx = self
            .free_gaps
            .iter()
            .position(|g| g.len == size || g.len >= size + HEADER_BYTES)?;
        let gap = self.free_gaps.swap_remove(idx);
        if gap.len > size {
            let rest = FreeGap {
                addr: gap.addr + size,
                len: gap.len - size,
            };
            // SAFETY: the remainder lies inside this segment's committed
            // object range and overlaps no live object.
            unsafe { write_free_filler(rest.addr, rest.len) };
            self.free_gaps.push(rest);
        }
        Some(gap.addr)
    }

    /// Replaces the free list after a sweep. Each gap must already be
    /// covered by a filler object.
    pub fn set_free_gaps(&mut self, gaps: Vec<FreeGap>) {
        self.free_gaps = gaps;
    }

    /// Sum of swept free-gap bytes still available for reuse.
    #[must_use]
    pub fn free_gap_bytes(&self) -> usize {
        self.free_gaps.iter().map(|g| g.len).sum()
    }

    /// Resets the bump pointer after compaction. Everything in
    /// `[new_bump, old bump)` must already be dead.
    pub fn reset_bump(&mut self, new_bump: usize) {
        debug_assert!(new_bump >= self.objects_start && new_bump <= self.bump);
        self.bump = new_bump;
        self.free_gaps.clear();
    }

    /// Walks every object (fillers included) in allocation order.
    ///
    /// The object range must be consistent: every header valid, sizes
    /// tiling `[objects_start, bump)` exactly. Only call while mutators are
    /// suspended or from the owning collection.
    pub fn walk(&self, mut f: impl FnMut(ObjRef)) {
        let mut addr = self.objects_start;
        while addr < self.bump {
            let obj = ObjRef::from_addr(addr).expect("segment base is never null");
            let size = obj.size();
            assert!(
                size >= HEADER_BYTES && addr + size <= self.bump,
                "heap walk found corrupt object size {size:#x} at {addr:#x}"
            );
            f(obj);
            addr += size;
        }
    }

    /// Walks objects overlapping `[from, to)` (segment-relative offsets are
    /// not used; both are absolute addresses). Starts from the first object
    /// at or after the start of the walk; callers pass card-run bounds.
    pub fn walk_range(&self, from: usize, to: usize, mut f: impl FnMut(ObjRef)) {
        let to = to.min(self.bump);
        let mut addr = self.objects_start;
        while addr < to {
            let obj = ObjRef::from_addr(addr).expect("segment base is never null");
            let size = obj.size();
            assert!(
                size >= HEADER_BYTES && addr + size <= self.bump,
                "heap walk found corrupt object size {size:#x} at {addr:#x}"
            );
            if addr + size > from && obj.type_id() != TYPE_FREE {
                f(obj);
            }
            addr += size;
        }
    }

    /// Returns unused committed tail pages past the bump pointer to the OS.
    /// Advisory; failures are ignored by callers.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the decommit fails.
    pub fn shrink(&mut self) -> io::Result<()> {
        let keep = (self.bump - self.base()).div_ceil(COMMIT_GRANULE) * COMMIT_GRANULE;
        if keep < self.committed {
            self.reservation.decommit(keep, self.committed - keep)?;
            self.committed = keep;
        }
        Ok(())
    }
}

// SAFETY: segments are owned by the heap and only mutated under its lock or
// during stop-the-world phases; the card bytes they expose are atomics.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{write_header, TypeId};

    #[test]
    fn header_found_by_masking() {
        let mut seg = Segment::new(Generation::Gen0).unwrap();
        let (start, len) = seg.carve_span(64, 64).unwrap().unwrap();
        assert_eq!(len, 64);
        unsafe { write_header(start, TypeId(1), 64, 0) };

        let header = unsafe { header_for_addr(start + 24) }.expect("header");
        assert_eq!(header.base, seg.base());
        assert!(header.contains(start));
    }

    #[test]
    fn carve_never_leaves_unfillable_tail() {
        let mut seg = Segment::new(Generation::Gen0).unwrap();
        let remaining = seg.bump_remaining();
        // Ask for a span that would leave 8 bytes at the tail.
        let min = remaining - 8;
        let (_, len) = seg.carve_span(min, min).unwrap().unwrap();
        assert_eq!(len, remaining);
        assert_eq!(seg.bump_remaining(), 0);
    }

    #[test]
    fn walk_skips_over_fillers_by_size() {
        let mut seg = Segment::new(Generation::Gen0).unwrap();
        let (start, _) = seg.carve_span(96, 96).unwrap().unwrap();
        unsafe {
            write_header(start, TypeId(1), 32, 0);
            write_free_filler(start + 32, 40);
            write_header(start + 72, TypeId(2), 24, 0);
        }
        let mut seen = Vec::new();
        seg.walk(|obj| seen.push((obj.addr() - start, obj.type_id())));
        assert_eq!(
            seen,
            vec![(0, TypeId(1)), (32, TYPE_FREE), (72, TypeId(2))]
        );
    }

    #[test]
    fn free_gap_reuse_splits_with_filler() {
        let mut seg = Segment::new(Generation::Gen2).unwrap();
        let (start, _) = seg.carve_span(128, 128).unwrap().unwrap();
        unsafe { write_free_filler(start, 128) };
        seg.set_free_gaps(vec![FreeGap { addr: start, len: 128 }]);

        // A 120-byte request would leave an 8-byte tail; must not split.
        assert_eq!(seg.take_free_gap(120), None);
        let addr = seg.take_free_gap(96).unwrap();
        assert_eq!(addr, start);
        let rest = ObjRef::from_addr(start + 96).unwrap();
        assert_eq!(rest.type_id(), TYPE_FREE);
        assert_eq!(rest.size(), 32);
        assert_eq!(seg.take_free_gap(32), Some(start + 96));
        assert_eq!(seg.take_free_gap(16), None);
    }

    #[test]
    fn large_segment_commits_object_range() {
        let size = 3 * SEGMENT_SIZE / 2;
        let seg = Segment::new_large(Generation::Gen2, size).unwrap();
        assert!(seg.end() - seg.base() >= size);
        assert_eq!(seg.base() % SEGMENT_SIZE, 0);
        // The whole object range is writable.
        unsafe {
            std::ptr::write_volatile(seg.objects_start() as *mut u8, 1);
            std::ptr::write_volatile((seg.objects_start() + size - 1) as *mut u8, 1);
        }
    }
}
