//! Collection driver.
//!
//! [`run_collection`] is the stop-the-world core shared by minor, full, and
//! the final pause of background collections: mutators are already stopped
//! and the caller holds the collection lock. Phases: retire allocation
//! contexts, clear flags, mark from roots (plus cards for minors), resolve
//! finalization, optionally compact, sweep, promote surviving segments
//! whole, and recompute budgets.

pub(crate) mod compact;
pub(crate) mod concurrent;
pub(crate) mod mark;

use std::sync::Arc;

use crate::config::SurvivalStats;
use crate::heap::segment::Segment;
use crate::heap::{Generation, HeapState, RuntimeHeap};
use crate::metrics::{CollectionType, GcMetrics, PhaseTimer};
use crate::object::{write_free_filler, ObjRef, FLAG_MARK, FLAG_PIN, TYPE_FREE};
use crate::suspend::SuspendOutcome;
use crate::threads::MutatorControl;

use compact::CompactOutcome;
use mark::Marker;

#[derive(Debug, Default, Clone, Copy)]
struct SweepTotals {
    live_bytes: usize,
    live_objects: usize,
    dead_bytes: usize,
    dead_objects: usize,
}

/// Runs the stop-the-world phases of one collection. Mutators are stopped
/// (or exempted) and the collection lock is held by the caller.
pub(crate) fn run_collection(
    heap: &RuntimeHeap,
    threads: &[Arc<MutatorControl>],
    condemn: Generation,
    ctype: CollectionType,
    outcome: &SuspendOutcome,
) -> GcMetrics {
    let mut inner_guard = heap.inner.lock();
    let inner = &mut *inner_guard;
    // New objects allocated by exempted mutators during the phases must
    // survive this cycle.
    heap.concurrent.set_alloc_black(true);
    let mut timer = PhaseTimer::new();

    // Escalate Gen0 to Gen1 once the middle generation has grown past a
    // budget's worth of segments.
    let mut condemn = condemn;
    if condemn == Generation::Gen0 {
        let gen1_bytes: usize = inner
            .segments
            .iter()
            .filter(|s| s.generation == Generation::Gen1)
            .map(|s| s.allocated_end() - s.objects_start())
            .sum();
        if gen1_bytes > heap.config.gen0_budget {
            condemn = Generation::Gen1;
        }
    }
    let full = condemn >= Generation::Gen2;

    // Retire allocation contexts. Exempted mutators keep theirs; the spans
    // they own are skipped below.
    let mut live_spans: Vec<(usize, usize)> = Vec::new();
    for control in threads {
        if control.is_exempt() {
            if let Some(span) = control.alloc_ctx().span() {
                live_spans.push(span);
            }
        } else {
            let _ = control.alloc_ctx().take_remainder();
        }
    }
    let overlaps_live_span =
        |seg: &Segment| live_spans.iter().any(|&(p, _)| p >= seg.base() && p < seg.end());

    let condemned: Vec<usize> = inner
        .segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.generation.condemned_by(condemn))
        .map(|(i, _)| i)
        .collect();

    // Clear stale flags on everything we are about to judge.
    for &i in &condemned {
        inner.segments[i].walk(|obj| {
            if obj.type_id() != TYPE_FREE {
                obj.clear_flags(FLAG_MARK | FLAG_PIN);
            }
        });
    }

    // ------------------------------------------------------------------
    // Mark
    // ------------------------------------------------------------------
    timer.start();
    let (mark_stats, redirty) = {
        let state: &HeapState = inner;
        let mut marker = Marker::new(state, &heap.types, condemn);
        for control in threads {
            if control.is_exempt() {
                marker.mark_root(control.shadow_stack().as_conservative_range());
            } else {
                control.shadow_stack().report_precise(|root| marker.mark_root(root));
            }
        }
        heap.handles.report_strong(|obj, pinned| marker.mark_ref(obj, pinned));
        heap.statics.report(|root| marker.mark_root(root));
        // Resurrected objects the embedder has not drained yet are still
        // waiting for their finalizers to run.
        heap.finalize.report_ready(|obj| marker.mark_ref(obj, false));
        marker.drain();

        let redirty = if full {
            Vec::new()
        } else {
            mark::scan_cards(state, condemn, &mut marker)
        };

        // Dead finalizable objects are resurrected and queued.
        heap.finalize.promote_dead(
            |obj| {
                state
                    .generation_of(obj.addr())
                    .is_some_and(|gen| gen.condemned_by(condemn))
                    && !obj.is_marked()
            },
            |obj| marker.resurrect(obj),
        );
        marker.drain();
        (marker.stats, redirty)
    };
    timer.end_mark();

    // Weak handles observe liveness before anything moves.
    heap.handles.sweep(
        |obj| {
            inner
                .generation_of(obj.addr())
                .is_some_and(|gen| gen.condemned_by(condemn))
                && !obj.is_marked()
        },
        |obj| obj,
    );

    // ------------------------------------------------------------------
    // Compact (full collections only, and never around an exempted thread)
    // ------------------------------------------------------------------
    timer.start();
    let compaction = if full && outcome.exempted == 0 {
        compact::compact_heap(inner, &heap.types, &condemned, heap.config.compact_free_ratio)
    } else {
        CompactOutcome::default()
    };
    let forward = &compaction.forward;
    if !forward.is_empty() {
        for control in threads {
            control
                .shadow_stack()
                .report_precise(|root| compact::rewrite_root(root, forward));
        }
        heap.statics.report(|root| compact::rewrite_root(root, forward));
        let relocate =
            |obj: ObjRef| forward.get(&obj.addr()).and_then(|&a| ObjRef::from_addr(a)).unwrap_or(obj);
        heap.handles.sweep(|_| false, relocate);
        heap.finalize.relocate(relocate);
    }
    timer.end_compact();

    // ------------------------------------------------------------------
    // Sweep and promote
    // ------------------------------------------------------------------
    timer.start();
    let mut totals = SweepTotals {
        live_bytes: compaction.live_bytes,
        live_objects: compaction.live_objects,
        dead_bytes: compaction.dead_bytes,
        dead_objects: compaction.dead_objects,
    };
    let mut dead_segments: Vec<usize> = Vec::new();
    let mut skipped_young = false;
    for &i in &condemned {
        if compaction.compacted.contains(&i) {
            // The slide already swept this segment.
            continue;
        }
        let seg = &mut inner.segments[i];
        if overlaps_live_span(seg) {
            // An exempted mutator is bump-allocating here; leave the whole
            // segment for the next cycle.
            skipped_young = true;
            continue;
        }
        if seg.large {
            let obj = ObjRef::from_addr(seg.objects_start()).expect("segment base is never zero");
            if obj.is_marked() {
                obj.clear_flags(FLAG_MARK | FLAG_PIN);
                seg.live_bytes = obj.size();
                totals.live_bytes += obj.size();
                totals.live_objects += 1;
            } else {
                totals.dead_bytes += obj.size();
                totals.dead_objects += 1;
                dead_segments.push(i);
            }
            continue;
        }
        let swept = sweep_segment(seg);
        totals.live_bytes += swept.live_bytes;
        totals.live_objects += swept.live_objects;
        totals.dead_bytes += swept.dead_bytes;
        totals.dead_objects += swept.dead_objects;
    }

    // Whole-segment promotion. Surviving segments age one generation; empty
    // ones are recycled or released.
    let mut kept_empty_gen0 = false;
    let mut promoted_to_gen2 = 0usize;
    let mut wrecked: Vec<usize> = Vec::new();
    for &i in &condemned {
        if dead_segments.contains(&i) {
            continue;
        }
        let seg = &mut inner.segments[i];
        if seg.large || overlaps_live_span(seg) {
            continue;
        }
        if seg.live_bytes == 0 {
            if seg.generation == Generation::Gen0 && !kept_empty_gen0 {
                kept_empty_gen0 = true;
                seg.reset_bump(seg.objects_start());
                seg.cards().clear_all();
                let _ = seg.shrink();
            } else {
                dead_segments.push(i);
            }
            continue;
        }
        let next = seg.generation.promoted();
        if next == Generation::Gen2 && seg.generation != Generation::Gen2 {
            promoted_to_gen2 += seg.live_bytes;
            // Arriving in Gen2, the segment may still reference Gen1
            // survivors; without precise card state, keep it all dirty.
            wrecked.push(i);
        } else if skipped_young && next != seg.generation {
            // A condemned segment was left in place under an exempted
            // mutator; the survivors promoted past it may hold the only
            // references into it, and their precise cards are about to go.
            wrecked.push(i);
        }
        seg.generation = next;
        seg.cards().clear_all();
        let _ = seg.shrink();
    }
    inner.gen2_used += promoted_to_gen2;

    // Re-dirty cards whose objects still hold younger-generation
    // references. After a full collection every precise card is stale
    // (compaction moved objects, sweeps ran everywhere), so the whole live
    // range of every old segment goes dirty instead.
    for entry in &redirty {
        inner.segments[entry.segment]
            .cards()
            .dirty_offset(entry.offset);
    }
    if full {
        wrecked.extend(
            (0..inner.segments.len()).filter(|&i| inner.segments[i].generation.age() == 2),
        );
    }
    for &i in &wrecked {
        let seg = &inner.segments[i];
        seg.cards().clear_all();
        let len = seg.allocated_end() - seg.base();
        if len > 0 {
            seg.cards().dirty_range(0, len);
        }
    }

    inner.remove_segments(&dead_segments);
    timer.end_sweep();

    // ------------------------------------------------------------------
    // Budgets
    // ------------------------------------------------------------------
    let stats = SurvivalStats {
        condemned: condemn,
        bytes_surviving: totals.live_bytes,
        bytes_condemned: totals.live_bytes + totals.dead_bytes,
        prior_budget: inner.gen0_budget,
    };
    inner.gen0_budget = (heap.config.budget_policy)(&stats, &heap.config);
    inner.gen0_used = 0;
    if full {
        inner.gen2_used = 0;
    }
    heap.concurrent.set_alloc_black(heap.concurrent.satb_active());

    GcMetrics {
        duration: std::time::Duration::ZERO, // caller fills the pause time
        bytes_reclaimed: totals.dead_bytes,
        bytes_surviving: totals.live_bytes,
        objects_reclaimed: totals.dead_objects,
        objects_surviving: totals.live_objects,
        collection_type: ctype,
        total_collections: 0,
        mark_duration: timer.mark,
        sweep_duration: timer.sweep,
        compact_duration: timer.compact,
        cards_scanned: mark_stats.cards_scanned,
        objects_relocated: compaction.relocated,
        threads_exempted: outcome.exempted,
    }
}

/// Sweeps one small-object segment: dead runs become coalesced fillers on
/// the free list, survivors get their cycle flags cleared.
fn sweep_segment(seg: &mut Segment) -> SweepTotals {
    struct Entry {
        addr: usize,
        size: usize,
        live: bool,
        is_object: bool,
    }
    let mut entries = Vec::new();
    seg.walk(|obj| {
        let is_object = obj.type_id() != TYPE_FREE;
        entries.push(Entry {
            addr: obj.addr(),
            size: obj.size(),
            live: is_object && obj.is_marked(),
            is_object,
        });
    });

    let mut totals = SweepTotals::default();
    let mut gaps = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut run_len = 0usize;
    for entry in &entries {
        if entry.live {
            if let Some(start) = run_start.take() {
                gaps.push(crate::heap::segment::FreeGap {
                    addr: start,
                    len: run_len,
                });
            }
            let obj = ObjRef::from_addr(entry.addr).expect("object addresses are never zero");
            obj.clear_flags(FLAG_MARK | FLAG_PIN);
            totals.live_bytes += entry.size;
            totals.live_objects += 1;
        } else {
            if entry.is_object {
                totals.dead_bytes += entry.size;
                totals.dead_objects += 1;
            }
            if run_start.is_none() {
                run_start = Some(entry.addr);
                run_len = 0;
            }
            run_len += entry.size;
        }
    }
    if let Some(start) = run_start {
        gaps.push(crate::heap::segment::FreeGap {
            addr: start,
            len: run_len,
        });
    }
    for gap in &gaps {
        // SAFETY: the run holds only dead objects and old fillers.
        unsafe { write_free_filler(gap.addr, gap.len) };
    }
    seg.live_bytes = totals.live_bytes;
    seg.set_free_gaps(gaps);
    let _ = seg.shrink();
    totals
}
