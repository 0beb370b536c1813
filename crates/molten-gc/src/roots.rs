//! Root reporting: shadow stacks, handles, and static roots.
//!
//! Stack roots are precise through per-thread shadow stacks: the embedder
//! pushes a frame around any region that holds object references in locals
//! and routes those references through frame slots. Slots are plain words
//! behind atomics so the collector can read them while the owner is
//! suspended, update them when objects move, and (for a thread that missed
//! the suspension deadline) scan the whole array conservatively without a
//! data race.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::ObjRef;

/// A root location reported to the marker.
#[derive(Debug, Clone, Copy)]
pub enum Root {
    /// Address of a word-sized slot holding an object address (0 = null).
    /// The collector may rewrite the slot when the referent relocates.
    Slot(*const AtomicUsize),
    /// A word-aligned range scanned conservatively. Any word that resolves
    /// to a live object keeps it alive and pins it in place; the words are
    /// never rewritten.
    Range { start: usize, end: usize },
}

// SAFETY: roots point into registered shadow stacks, the handle table, or
// registered static cells, all of which outlive any scan that uses them.
unsafe impl Send for Root {}
unsafe impl Sync for Root {}

/// Capacity of one thread's shadow stack, in slots.
pub const SHADOW_STACK_SLOTS: usize = 4096;

/// Per-thread stack of object-reference slots.
///
/// Fixed capacity so the slot array never reallocates: the collector holds
/// raw slot addresses across a scan, and an exempted thread's pushes race
/// with a conservative read of the array. Overflow is fatal; it means the
/// embedder leaked frames.
pub struct ShadowStack {
    slots: Box<[AtomicUsize]>,
    len: AtomicUsize,
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowStack {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(SHADOW_STACK_SLOTS);
        slots.resize_with(SHADOW_STACK_SLOTS, || AtomicUsize::new(0));
        Self {
            slots: slots.into_boxed_slice(),
            len: AtomicUsize::new(0),
        }
    }

    /// Live slot count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, value: usize) -> usize {
        let index = self.len.load(Ordering::Relaxed);
        assert!(index < self.slots.len(), "shadow stack overflow");
        self.slots[index].store(value, Ordering::Relaxed);
        // Publish the slot before the new length becomes visible.
        self.len.store(index + 1, Ordering::Release);
        index
    }

    fn truncate(&self, len: usize) {
        debug_assert!(len <= self.len.load(Ordering::Relaxed));
        self.len.store(len, Ordering::Release);
    }

    /// Reads slot `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ObjRef> {
        ObjRef::from_addr(self.slots[index].load(Ordering::Relaxed))
    }

    /// Writes slot `index`. No write barrier: shadow slots are not heap
    /// memory and are enumerated on every scan.
    pub fn set(&self, index: usize, value: Option<ObjRef>) {
        self.slots[index].store(value.map_or(0, ObjRef::addr), Ordering::Relaxed);
    }

    /// Reports each live slot as a precise root. Legal only while the
    /// owning thread is suspended or in an external region.
    pub fn report_precise(&self, mut f: impl FnMut(Root)) {
        let len = self.len();
        for slot in &self.slots[..len] {
            f(Root::Slot(slot));
        }
    }

    /// Reports the whole slot array as one conservative range, for a thread
    /// exempted from suspension.
    #[must_use]
    pub fn as_conservative_range(&self) -> Root {
        let start = self.slots.as_ptr() as usize;
        Root::Range {
            start,
            end: start + self.slots.len() * std::mem::size_of::<usize>(),
        }
    }
}

/// A scoped group of shadow-stack slots, popped on drop.
///
/// `!Send`: a frame must be dropped on the thread that opened it.
pub struct ShadowFrame<'a> {
    stack: &'a ShadowStack,
    base: usize,
    _not_send: PhantomData<Cell<()>>,
}

impl<'a> ShadowFrame<'a> {
    #[must_use]
    pub fn new(stack: &'a ShadowStack) -> Self {
        Self {
            stack,
            base: stack.len(),
            _not_send: PhantomData,
        }
    }

    /// Pushes a reference into this frame, returning its slot.
    ///
    /// References held across a collection must be re-read through the slot
    /// afterwards; compaction may have moved the object and updated the
    /// slot.
    pub fn push(&self, value: Option<ObjRef>) -> ShadowSlot<'a> {
        let index = self.stack.push(value.map_or(0, ObjRef::addr));
        ShadowSlot {
            stack: self.stack,
            index,
        }
    }
}

impl Drop for ShadowFrame<'_> {
    fn drop(&mut self) {
        self.stack.truncate(self.base);
    }
}

/// One slot inside a [`ShadowFrame`].
#[derive(Clone, Copy)]
pub struct ShadowSlot<'a> {
    stack: &'a ShadowStack,
    index: usize,
}

impl ShadowSlot<'_> {
    #[must_use]
    pub fn get(&self) -> Option<ObjRef> {
        self.stack.get(self.index)
    }

    pub fn set(&self, value: Option<ObjRef>) {
        self.stack.set(self.index, value);
    }
}

// ============================================================================
// Handle table
// ============================================================================

/// How a handle roots its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Keeps the target alive; target may move.
    Strong,
    /// Does not keep the target alive; nulled when the target dies.
    Weak,
    /// Keeps the target alive and prevents relocation.
    Pinned,
}

/// An index into the heap's [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

struct HandleEntry {
    addr: usize,
    kind: HandleKind,
    live: bool,
}

/// Strong, weak, and pinned references from unmanaged code.
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<HandleSlots>,
}

#[derive(Default)]
struct HandleSlots {
    entries: Vec<HandleEntry>,
    free: Vec<usize>,
}

impl HandleTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle of `kind` targeting `target`.
    pub fn create(&self, target: ObjRef, kind: HandleKind) -> Handle {
        let mut inner = self.inner.lock();
        let entry = HandleEntry {
            addr: target.addr(),
            kind,
            live: true,
        };
        if let Some(index) = inner.free.pop() {
            inner.entries[index] = entry;
            Handle(index)
        } else {
            inner.entries.push(entry);
            Handle(inner.entries.len() - 1)
        }
    }

    /// Reads the handle's target. `None` for a weak handle whose target
    /// has died.
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<ObjRef> {
        let inner = self.inner.lock();
        let entry = &inner.entries[handle.0];
        assert!(entry.live, "use of destroyed handle");
        ObjRef::from_addr(entry.addr)
    }

    /// Retargets the handle.
    pub fn set(&self, handle: Handle, target: Option<ObjRef>) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[handle.0];
        assert!(entry.live, "use of destroyed handle");
        entry.addr = target.map_or(0, ObjRef::addr);
    }

    /// Destroys the handle; its slot is recycled.
    pub fn destroy(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[handle.0];
        assert!(entry.live, "double destroy of handle");
        entry.live = false;
        entry.addr = 0;
        inner.free.push(handle.0);
    }

    /// Reports strong and pinned handles to the marker. The second callback
    /// argument is true for pinned handles.
    pub(crate) fn report_strong(&self, mut f: impl FnMut(ObjRef, bool)) {
        let inner = self.inner.lock();
        for entry in &inner.entries {
            if !entry.live || entry.kind == HandleKind::Weak {
                continue;
            }
            if let Some(obj) = ObjRef::from_addr(entry.addr) {
                f(obj, entry.kind == HandleKind::Pinned);
            }
        }
    }

    /// Nulls weak handles whose target `is_dead`, and rewrites surviving
    /// targets through `relocate`. Runs while the world is stopped.
    pub(crate) fn sweep(
        &self,
        mut is_dead: impl FnMut(ObjRef) -> bool,
        mut relocate: impl FnMut(ObjRef) -> ObjRef,
    ) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            if !entry.live {
                continue;
            }
            let Some(obj) = ObjRef::from_addr(entry.addr) else {
                continue;
            };
            if entry.kind == HandleKind::Weak && is_dead(obj) {
                entry.addr = 0;
            } else {
                entry.addr = relocate(obj).addr();
            }
        }
    }
}

// ============================================================================
// Static roots
// ============================================================================

/// Registered static root cells, reported on every scan.
#[derive(Default)]
pub struct StaticRoots {
    cells: Mutex<Vec<&'static AtomicUsize>>,
}

impl StaticRoots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a static cell holding an object address (0 = null).
    pub fn register(&self, cell: &'static AtomicUsize) {
        self.cells.lock().push(cell);
    }

    pub(crate) fn report(&self, mut f: impl FnMut(Root)) {
        for cell in self.cells.lock().iter() {
            f(Root::Slot(*cell));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_ref(addr: usize) -> ObjRef {
        ObjRef::from_addr(addr).unwrap()
    }

    #[test]
    fn frames_nest_and_pop() {
        let stack = ShadowStack::new();
        let outer = ShadowFrame::new(&stack);
        let a = outer.push(Some(fake_ref(0x1000)));
        {
            let inner = ShadowFrame::new(&stack);
            inner.push(Some(fake_ref(0x2000)));
            inner.push(None);
            assert_eq!(stack.len(), 3);
        }
        assert_eq!(stack.len(), 1);
        assert_eq!(a.get(), Some(fake_ref(0x1000)));
        a.set(Some(fake_ref(0x3000)));
        assert_eq!(stack.get(0), Some(fake_ref(0x3000)));
    }

    #[test]
    fn precise_report_covers_live_slots_only() {
        let stack = ShadowStack::new();
        let frame = ShadowFrame::new(&stack);
        frame.push(Some(fake_ref(0x1000)));
        frame.push(None);

        let mut seen = Vec::new();
        stack.report_precise(|root| match root {
            Root::Slot(slot) => seen.push(unsafe { (*slot).load(Ordering::Relaxed) }),
            Root::Range { .. } => panic!("precise report produced a range"),
        });
        assert_eq!(seen, vec![0x1000, 0]);
    }

    #[test]
    fn conservative_range_spans_whole_array() {
        let stack = ShadowStack::new();
        match stack.as_conservative_range() {
            Root::Range { start, end } => {
                assert_eq!(end - start, SHADOW_STACK_SLOTS * std::mem::size_of::<usize>());
            }
            Root::Slot(_) => panic!("expected a range"),
        }
    }

    #[test]
    fn handle_lifecycle() {
        let table = HandleTable::new();
        let h = table.create(fake_ref(0x1000), HandleKind::Strong);
        assert_eq!(table.get(h), Some(fake_ref(0x1000)));
        table.set(h, Some(fake_ref(0x2000)));
        assert_eq!(table.get(h), Some(fake_ref(0x2000)));
        table.destroy(h);
        let h2 = table.create(fake_ref(0x3000), HandleKind::Weak);
        // Slot is recycled.
        assert_eq!(h2, h);
    }

    #[test]
    fn weak_handles_null_on_death() {
        let table = HandleTable::new();
        let strong = table.create(fake_ref(0x1000), HandleKind::Strong);
        let weak = table.create(fake_ref(0x2000), HandleKind::Weak);
        table.sweep(|obj| obj.addr() == 0x2000, |obj| obj);
        assert_eq!(table.get(strong), Some(fake_ref(0x1000)));
        assert_eq!(table.get(weak), None);
    }

    #[test]
    fn sweep_relocates_survivors() {
        let table = HandleTable::new();
        let h = table.create(fake_ref(0x1000), HandleKind::Strong);
        table.sweep(|_| false, |obj| fake_ref(obj.addr() + 0x10));
        assert_eq!(table.get(h), Some(fake_ref(0x1010)));
    }
}
