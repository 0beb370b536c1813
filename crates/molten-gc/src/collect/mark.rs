//! Mark phase: root scanning and transitive tracing.

use std::sync::atomic::Ordering;

use crate::heap::card::CARD_SHIFT;
use crate::heap::{Generation, HeapState};
use crate::object::{ObjRef, TypeRegistry, FLAG_MARK, FLAG_PIN, TYPE_FREE};
use crate::roots::Root;

/// Marking statistics fed into metrics and the budget policy.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MarkStats {
    pub objects_marked: usize,
    pub bytes_marked: usize,
    pub cards_scanned: usize,
}

/// Tracing state for one collection. Borrows the heap state immutably; all
/// object mutation goes through the atomic header flags.
pub(crate) struct Marker<'a> {
    state: &'a HeapState,
    types: &'a TypeRegistry,
    condemn: Generation,
    full: bool,
    worklist: Vec<ObjRef>,
    pub(crate) stats: MarkStats,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(state: &'a HeapState, types: &'a TypeRegistry, condemn: Generation) -> Self {
        Self {
            state,
            types,
            condemn,
            full: condemn >= Generation::Gen2,
            worklist: Vec::new(),
            stats: MarkStats::default(),
        }
    }

    /// Marks from one reported root.
    pub(crate) fn mark_root(&mut self, root: Root) {
        match root {
            Root::Slot(slot) => {
                // SAFETY: reported slots outlive the scan.
                let addr = unsafe { (*slot).load(Ordering::Acquire) };
                if addr != 0 {
                    let obj = self.state.assert_valid_object(addr);
                    self.mark_object(obj, false);
                }
            }
            Root::Range { start, end } => self.mark_range_conservative(start, end),
        }
    }

    /// Marks a known object reference (handle table entries).
    pub(crate) fn mark_ref(&mut self, obj: ObjRef, pin: bool) {
        let obj = self.state.assert_valid_object(obj.addr());
        self.mark_object(obj, pin);
    }

    /// Conservative scan: every word in the range that points into a live
    /// allocation keeps that allocation alive and pins it.
    fn mark_range_conservative(&mut self, start: usize, end: usize) {
        debug_assert_eq!(start % std::mem::size_of::<usize>(), 0);
        let mut addr = start;
        while addr < end {
            // SAFETY: conservative ranges are word-aligned slot arrays that
            // outlive the scan; racy reads are tolerated by going through
            // the atomic.
            let word =
                unsafe { (*(addr as *const std::sync::atomic::AtomicUsize)).load(Ordering::Relaxed) };
            if word != 0 {
                if let Some(obj) = self.state.find_object(word) {
                    self.mark_object(obj, true);
                }
            }
            addr += std::mem::size_of::<usize>();
        }
    }

    /// Marks `obj` and queues it for tracing. Objects outside the condemned
    /// generations are live by definition in a minor collection and are not
    /// traced; their edges into the condemned set come from the card scan.
    pub(crate) fn mark_object(&mut self, obj: ObjRef, pin: bool) {
        if !self.full {
            let gen = self
                .state
                .generation_of(obj.addr())
                .expect("marked reference left the heap");
            if !gen.condemned_by(self.condemn) {
                return;
            }
        }
        let mut flags = FLAG_MARK;
        if pin {
            flags |= FLAG_PIN;
        }
        let prev = obj.set_flags(flags);
        if prev & FLAG_MARK != 0 {
            return;
        }
        self.stats.objects_marked += 1;
        self.stats.bytes_marked += obj.size();
        self.worklist.push(obj);
    }

    /// Marks a dead finalizable object and everything it reaches
    /// (resurrection). Runs after the primary drain.
    pub(crate) fn resurrect(&mut self, obj: ObjRef) {
        self.mark_object(obj, false);
    }

    /// Traces until the worklist is empty.
    pub(crate) fn drain(&mut self) {
        while let Some(obj) = self.worklist.pop() {
            self.trace(obj);
        }
    }

    /// Traces at most `limit` objects. Returns true once the worklist is
    /// empty. Used by the background collector to bound how long it holds
    /// the heap lock.
    pub(crate) fn drain_some(&mut self, limit: usize) -> bool {
        for _ in 0..limit {
            let Some(obj) = self.worklist.pop() else {
                return true;
            };
            self.trace(obj);
        }
        self.worklist.is_empty()
    }

    /// Marks a raw address recorded by the snapshot barrier. Resolved
    /// conservatively: a barrier entry can outlive the object it named
    /// when a racing write lands just as a cycle winds down.
    pub(crate) fn mark_addr(&mut self, addr: usize) {
        if addr != 0 {
            if let Some(obj) = self.state.find_object(addr) {
                self.mark_object(obj, false);
            }
        }
    }

    /// Requeues addresses carried over from a previous tracing session.
    /// The objects are already marked; they only need their slots traced.
    pub(crate) fn seed(&mut self, addrs: impl IntoIterator<Item = usize>) {
        self.worklist
            .extend(addrs.into_iter().filter_map(ObjRef::from_addr));
    }

    /// Hands back the untraced remainder as raw addresses so the worklist
    /// can outlive this marker's heap borrow.
    pub(crate) fn pending(&mut self) -> Vec<usize> {
        self.worklist.drain(..).map(|obj| obj.addr()).collect()
    }

    fn trace(&mut self, obj: ObjRef) {
        let ty = obj.type_id();
        if ty == TYPE_FREE {
            // Tolerate a stale worklist entry rather than tracing a filler.
            return;
        }
        let desc = self
            .types
            .get(ty)
            .unwrap_or_else(|| panic!("corrupt object header at {:#x}: type {}", obj.addr(), ty.0));
        for &slot in &desc.ref_slots {
            // SAFETY: the descriptor bounds the slot.
            let target = unsafe { obj.read_slot(slot as usize) };
            if target != 0 {
                let target = self.state.assert_valid_object(target);
                self.mark_object(target, false);
            }
        }
    }
}

/// A card the scan wants dirty again after clearing: the object covering it
/// still references a younger generation.
pub(crate) struct Redirty {
    pub segment: usize,
    pub offset: usize,
}

/// Scans dirty cards of every non-condemned segment, marking condemned
/// targets. Cards are cleared afterwards; cards whose objects retain
/// younger-generation references are re-dirtied by the caller via the
/// returned list (conservatively sound: a spurious card costs one extra
/// scan).
pub(crate) fn scan_cards(
    state: &HeapState,
    condemn: Generation,
    marker: &mut Marker<'_>,
) -> Vec<Redirty> {
    let mut redirty = Vec::new();
    for (index, seg) in state.segments.iter().enumerate() {
        if seg.generation.condemned_by(condemn) {
            continue;
        }
        let base = seg.base();
        let seg_age = seg.generation.age();
        let mut scanned = 0usize;
        seg.cards().for_each_dirty_run(|start_off, end_off| {
            scanned += (end_off - start_off) >> CARD_SHIFT;
            seg.walk_range(base + start_off, base + end_off, |obj| {
                let Some(desc) = marker.types.get(obj.type_id()) else {
                    panic!("corrupt object header at {:#x}", obj.addr());
                };
                for &slot in &desc.ref_slots {
                    // SAFETY: the descriptor bounds the slot.
                    let target = unsafe { obj.read_slot(slot as usize) };
                    if target == 0 {
                        continue;
                    }
                    let Some(target_gen) = state.generation_of(target) else {
                        panic!(
                            "corrupt reference {target:#x} in object at {:#x}",
                            obj.addr()
                        );
                    };
                    if target_gen.condemned_by(condemn) {
                        let target = state.assert_valid_object(target);
                        marker.mark_object(target, false);
                    }
                    if target_gen.age() < seg_age {
                        redirty.push(Redirty {
                            segment: index,
                            offset: obj.slot_addr(slot as usize) - base,
                        });
                    }
                }
            });
        });
        marker.stats.cards_scanned += scanned;
    }
    marker.drain();
    redirty
}
