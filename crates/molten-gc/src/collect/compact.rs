//! Sliding compaction for fragmented small-object segments.
//!
//! Runs only in full collections, after marking, with every mutator
//! suspended. Live objects slide toward the segment base in address order;
//! pinned objects stay put and the slide resumes past them, so moves are
//! always downward and a forward memmove is safe. Large objects never move.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::heap::segment::Segment;
use crate::heap::HeapState;
use crate::object::{
    write_free_filler, ObjRef, TypeRegistry, FLAG_MARK, FLAG_PIN, TYPE_FREE,
};
use crate::roots::Root;

/// Old address -> new address for every object compaction moves.
pub(crate) type ForwardMap = HashMap<usize, usize>;

/// What a compaction pass did, for the sweep accounting that follows it.
#[derive(Default)]
pub(crate) struct CompactOutcome {
    pub forward: ForwardMap,
    /// Indices of the segments whose plans were applied.
    pub compacted: Vec<usize>,
    pub relocated: usize,
    pub live_bytes: usize,
    pub live_objects: usize,
    /// Garbage erased by the slide instead of by the sweep.
    pub dead_bytes: usize,
    pub dead_objects: usize,
}

struct PlanEntry {
    old: usize,
    new: usize,
    size: usize,
}

#[derive(Default)]
struct SegmentPlan {
    entries: Vec<PlanEntry>,
    new_bump: usize,
    dead_bytes: usize,
    dead_objects: usize,
}

/// Plans and performs compaction of every condemned small-object segment
/// whose dead-space ratio exceeds `free_ratio`. Compacted segments come out
/// fully swept: dead objects are erased by the slide, survivor flags are
/// cleared, and `live_bytes` is up to date.
///
/// Reference slots of all live objects are rewritten here; the caller
/// rewrites roots, handles, and the finalization queue.
pub(crate) fn compact_heap(
    state: &mut HeapState,
    types: &TypeRegistry,
    condemned: &[usize],
    free_ratio: f64,
) -> CompactOutcome {
    let mut outcome = CompactOutcome::default();
    let mut plans: Vec<(usize, SegmentPlan)> = Vec::new();

    for &index in condemned {
        let seg = &state.segments[index];
        if seg.large || dead_ratio(seg) <= free_ratio {
            continue;
        }
        let plan = plan_segment(seg, &mut outcome.forward);
        if !plan.entries.is_empty() {
            plans.push((index, plan));
        }
    }
    if outcome.forward.is_empty() {
        return CompactOutcome::default();
    }

    // Rewrite heap references before any object moves; the map still keys
    // on old addresses.
    rewrite_heap_refs(state, types, &outcome.forward);

    for (index, plan) in &plans {
        let seg = &mut state.segments[*index];
        outcome.relocated += apply_plan(seg, &plan.entries, plan.new_bump);
        outcome.compacted.push(*index);
        outcome.live_bytes += seg.live_bytes;
        outcome.live_objects += plan.entries.len();
        outcome.dead_bytes += plan.dead_bytes;
        outcome.dead_objects += plan.dead_objects;
    }
    debug!(
        relocated = outcome.relocated,
        segments = plans.len(),
        "compaction complete"
    );
    outcome
}

fn dead_ratio(seg: &Segment) -> f64 {
    let mut dead = 0usize;
    let mut total = 0usize;
    seg.walk(|obj| {
        total += obj.size();
        if obj.type_id() == TYPE_FREE || !obj.is_marked() {
            dead += obj.size();
        }
    });
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        dead as f64 / total as f64
    }
}

/// Computes sliding destinations. Pinned survivors act as barriers: the
/// destination cursor jumps past them, so every move is downward.
fn plan_segment(seg: &Segment, forward: &mut ForwardMap) -> SegmentPlan {
    let mut plan = SegmentPlan::default();
    let mut dest = seg.objects_start();
    seg.walk(|obj| {
        if obj.type_id() == TYPE_FREE {
            return;
        }
        let size = obj.size();
        if !obj.is_marked() {
            plan.dead_bytes += size;
            plan.dead_objects += 1;
            return;
        }
        if obj.is_pinned() {
            plan.entries.push(PlanEntry {
                old: obj.addr(),
                new: obj.addr(),
                size,
            });
            dest = dest.max(obj.addr() + size);
        } else {
            if dest != obj.addr() {
                forward.insert(obj.addr(), dest);
            }
            plan.entries.push(PlanEntry {
                old: obj.addr(),
                new: dest,
                size,
            });
            dest += size;
        }
    });
    plan.new_bump = dest;
    plan
}

/// Rewrites every reference slot of every live object through the map.
fn rewrite_heap_refs(state: &HeapState, types: &TypeRegistry, forward: &ForwardMap) {
    for seg in &state.segments {
        seg.walk(|obj| {
            if obj.type_id() == TYPE_FREE || !obj.is_marked() {
                return;
            }
            let desc = types
                .get(obj.type_id())
                .unwrap_or_else(|| panic!("corrupt object header at {:#x}", obj.addr()));
            for &slot in &desc.ref_slots {
                // SAFETY: the descriptor bounds the slot.
                let target = unsafe { obj.read_slot(slot as usize) };
                if let Some(&new) = forward.get(&target) {
                    // SAFETY: same slot, new target address.
                    unsafe { obj.write_slot(slot as usize, new) };
                }
            }
        });
    }
}

/// Rewrites one root slot through the map.
pub(crate) fn rewrite_root(root: Root, forward: &ForwardMap) {
    if let Root::Slot(slot) = root {
        // SAFETY: reported slots outlive the collection.
        let value = unsafe { (*slot).load(Ordering::Relaxed) };
        if let Some(&new) = forward.get(&value) {
            // SAFETY: as above.
            unsafe { (*slot).store(new, Ordering::Relaxed) };
        }
    }
}

/// Moves object bytes, re-tiles the gaps around pinned islands, resets the
/// bump pointer, and clears mark/pin flags on the survivors.
fn apply_plan(seg: &mut Segment, entries: &[PlanEntry], new_bump: usize) -> usize {
    let mut relocated = 0;
    for entry in entries {
        if entry.new != entry.old {
            // SAFETY: both ranges lie in this segment's committed object
            // area; plan order guarantees the destination run is free or
            // overlaps the source downward, which ptr::copy handles.
            unsafe {
                std::ptr::copy(
                    entry.old as *const u8,
                    entry.new as *mut u8,
                    entry.size,
                );
            }
            relocated += 1;
        }
    }

    // Entries sorted by new address; fill the holes between them.
    let mut sorted: Vec<&PlanEntry> = entries.iter().collect();
    sorted.sort_unstable_by_key(|e| e.new);
    let mut cursor = seg.objects_start();
    let mut live_bytes = 0;
    for entry in &sorted {
        if entry.new > cursor {
            // SAFETY: the gap holds no live object.
            unsafe { write_free_filler(cursor, entry.new - cursor) };
        }
        cursor = entry.new + entry.size;
        live_bytes += entry.size;
        let obj = ObjRef::from_addr(entry.new).expect("object addresses are never zero");
        obj.clear_flags(FLAG_MARK | FLAG_PIN);
    }
    debug_assert!(cursor <= new_bump);
    if new_bump > cursor {
        // SAFETY: trailing hole below the old bump pointer.
        unsafe { write_free_filler(cursor, new_bump - cursor) };
    }
    seg.reset_bump(new_bump);
    seg.live_bytes = live_bytes;
    let _ = seg.shrink();
    relocated
}
