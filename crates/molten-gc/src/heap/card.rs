//! Card table: coarse dirty tracking for cross-generation references.
//!
//! Each segment carries one byte per 512-byte card of its address range.
//! The write barrier sets the byte unconditionally with a relaxed store;
//! the barrier races with itself and with the card scan by design, and the
//! only consequence of a lost race is a card scanned once more than
//! necessary. Cards are cleared by the collector while mutators are
//! suspended.

use std::sync::atomic::{AtomicU8, Ordering};

/// Bytes covered by one card.
pub const CARD_SIZE: usize = 512;

/// `log2(CARD_SIZE)`.
pub const CARD_SHIFT: usize = 9;

const CARD_CLEAN: u8 = 0;
const CARD_DIRTY: u8 = 1;

/// Dirty-card bytes for one segment's address range.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Creates a clean table covering `covered_len` bytes.
    #[must_use]
    pub fn new(covered_len: usize) -> Self {
        let count = covered_len.div_ceil(CARD_SIZE);
        let mut cards = Vec::with_capacity(count);
        cards.resize_with(count, || AtomicU8::new(CARD_CLEAN));
        Self {
            cards: cards.into_boxed_slice(),
        }
    }

    /// Number of cards in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Raw pointer to the card bytes, for the in-segment header.
    #[must_use]
    pub fn as_ptr(&self) -> *const AtomicU8 {
        self.cards.as_ptr()
    }

    /// Dirties the card covering byte `offset` of the segment.
    #[inline]
    pub fn dirty_offset(&self, offset: usize) {
        self.cards[offset >> CARD_SHIFT].store(CARD_DIRTY, Ordering::Relaxed);
    }

    /// Dirties every card intersecting `[offset, offset + len)`.
    pub fn dirty_range(&self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let first = offset >> CARD_SHIFT;
        let last = (offset + len - 1) >> CARD_SHIFT;
        for card in &self.cards[first..=last] {
            card.store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    /// Whether card `index` is dirty.
    #[must_use]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Relaxed) != CARD_CLEAN
    }

    /// Clears every card.
    pub fn clear_all(&self) {
        for card in &*self.cards {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Calls `f` with the byte range `[start, end)` (segment offsets) of
    /// each maximal run of dirty cards.
    pub fn for_each_dirty_run(&self, mut f: impl FnMut(usize, usize)) {
        let mut run_start: Option<usize> = None;
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Relaxed) != CARD_CLEAN {
                run_start.get_or_insert(i);
            } else if let Some(start) = run_start.take() {
                f(start << CARD_SHIFT, i << CARD_SHIFT);
            }
        }
        if let Some(start) = run_start {
            f(start << CARD_SHIFT, self.cards.len() << CARD_SHIFT);
        }
    }

    /// Dirty cards in the table (diagnostics and metrics).
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != CARD_CLEAN)
            .count()
    }
}

/// Dirties the card for `offset` through a raw card-array pointer, as
/// published in a segment header.
///
/// # Safety
///
/// `cards` must point to a live card array of at least
/// `(offset >> CARD_SHIFT) + 1` entries.
#[inline]
pub unsafe fn dirty_raw(cards: *const AtomicU8, offset: usize) {
    // SAFETY: index is in bounds per the caller contract.
    unsafe { (*cards.add(offset >> CARD_SHIFT)).store(CARD_DIRTY, Ordering::Relaxed) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_whole_range() {
        let table = CardTable::new(CARD_SIZE * 4 + 1);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn dirty_and_clear() {
        let table = CardTable::new(CARD_SIZE * 8);
        assert_eq!(table.dirty_count(), 0);
        table.dirty_offset(0);
        table.dirty_offset(CARD_SIZE * 3 + 7);
        assert!(table.is_dirty(0));
        assert!(table.is_dirty(3));
        assert!(!table.is_dirty(1));
        assert_eq!(table.dirty_count(), 2);
        table.clear_all();
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn dirty_range_touches_boundary_cards() {
        let table = CardTable::new(CARD_SIZE * 8);
        table.dirty_range(CARD_SIZE - 1, 2);
        assert!(table.is_dirty(0));
        assert!(table.is_dirty(1));
        assert!(!table.is_dirty(2));
    }

    #[test]
    fn dirty_runs_merge_adjacent_cards() {
        let table = CardTable::new(CARD_SIZE * 8);
        table.dirty_offset(CARD_SIZE);
        table.dirty_offset(CARD_SIZE * 2);
        table.dirty_offset(CARD_SIZE * 7);

        let mut runs = Vec::new();
        table.for_each_dirty_run(|start, end| runs.push((start, end)));
        assert_eq!(
            runs,
            vec![
                (CARD_SIZE, CARD_SIZE * 3),
                (CARD_SIZE * 7, CARD_SIZE * 8),
            ]
        );
    }
}
