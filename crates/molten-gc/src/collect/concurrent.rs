//! Background collection of the old generation.
//!
//! The cycle runs on a dedicated thread in three stages: a short pause that
//! snapshots roots and arms the snapshot barrier, a concurrent mark that
//! traces in bounded batches while mutators run, and a final pause that
//! drains the barrier, rescans roots, and sweeps Gen2 and the large space
//! in place. Nothing moves and nothing is promoted; minor collections are
//! deferred for the duration and a full collection preempts the cycle
//! through [`ConcurrentState::preempt`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::heap::{Generation, RuntimeHeap, TriggerKind};
use crate::metrics::{CollectionType, GcMetrics};
use crate::object::{ObjRef, FLAG_MARK, FLAG_PIN, TYPE_FREE};
use crate::threads::{self, MutatorControl};

use super::mark::Marker;
use super::SweepTotals;

/// Objects traced per heap-lock session during the concurrent mark.
const TRACE_BATCH: usize = 512;

const LOCK_RETRY: Duration = Duration::from_millis(1);

enum BgCommand {
    Idle,
    Collect,
    Shutdown,
}

/// State shared between the heap, its mutators, and the background thread.
pub(crate) struct ConcurrentState {
    cmd: Mutex<BgCommand>,
    cmd_cv: Condvar,
    /// New allocations are born marked while true. Set during background
    /// cycles and across every stop-the-world window.
    alloc_black: AtomicBool,
    /// The write barrier records overwritten references while true.
    satb_active: AtomicBool,
    /// Snapshot buffer fed by the write barrier.
    satb: SegQueue<usize>,
    abort: AtomicBool,
    cycle_running: AtomicBool,
    idle_mutex: Mutex<()>,
    idle_cv: Condvar,
}

impl ConcurrentState {
    pub(crate) fn new() -> Self {
        Self {
            cmd: Mutex::new(BgCommand::Idle),
            cmd_cv: Condvar::new(),
            alloc_black: AtomicBool::new(false),
            satb_active: AtomicBool::new(false),
            satb: SegQueue::new(),
            abort: AtomicBool::new(false),
            cycle_running: AtomicBool::new(false),
            idle_mutex: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    pub(crate) fn alloc_black(&self) -> bool {
        self.alloc_black.load(Ordering::Acquire)
    }

    pub(crate) fn set_alloc_black(&self, value: bool) {
        self.alloc_black.store(value, Ordering::Release);
    }

    pub(crate) fn satb_active(&self) -> bool {
        self.satb_active.load(Ordering::Acquire)
    }

    /// Barrier hook: records a reference about to be overwritten.
    pub(crate) fn record_overwrite(&self, addr: usize) {
        self.satb.push(addr);
    }

    /// Asks the background thread for a cycle. False when one is already
    /// running or queued.
    pub(crate) fn request_cycle(&self) -> bool {
        let mut cmd = self.cmd.lock();
        if matches!(*cmd, BgCommand::Idle) && !self.cycle_running.load(Ordering::Acquire) {
            *cmd = BgCommand::Collect;
            self.cmd_cv.notify_one();
            true
        } else {
            false
        }
    }

    /// Aborts any in-flight cycle and waits until the background thread is
    /// idle. Called by a full collection that already holds the collection
    /// lock, which is why the background thread only ever polls for that
    /// lock with `try_lock`.
    pub(crate) fn preempt(&self) {
        if !self.cycle_running.load(Ordering::Acquire) {
            return;
        }
        self.abort.store(true, Ordering::Release);
        let mut guard = self.idle_mutex.lock();
        while self.cycle_running.load(Ordering::Acquire) {
            self.idle_cv.wait_for(&mut guard, LOCK_RETRY);
        }
        drop(guard);
        self.abort.store(false, Ordering::Release);
    }

    pub(crate) fn shutdown(&self) {
        self.abort.store(true, Ordering::Release);
        *self.cmd.lock() = BgCommand::Shutdown;
        self.cmd_cv.notify_one();
    }
}

/// Starts the background collector thread. It holds only a weak reference
/// to the heap and exits when the heap is dropped.
pub(crate) fn spawn(heap: &Arc<RuntimeHeap>) {
    let weak = Arc::downgrade(heap);
    let state = Arc::clone(&heap.concurrent);
    let spawned = std::thread::Builder::new()
        .name("gc-background".into())
        .spawn(move || worker(&weak, &state));
    if let Err(err) = spawned {
        warn!(%err, "background collector thread failed to start");
    }
}

fn worker(heap: &Weak<RuntimeHeap>, state: &Arc<ConcurrentState>) {
    loop {
        {
            let mut cmd = state.cmd.lock();
            loop {
                match *cmd {
                    BgCommand::Shutdown => return,
                    BgCommand::Collect => {
                        *cmd = BgCommand::Idle;
                        break;
                    }
                    BgCommand::Idle => state.cmd_cv.wait(&mut cmd),
                }
            }
        }
        let Some(heap) = heap.upgrade() else { return };
        state.cycle_running.store(true, Ordering::Release);
        run_cycle(&heap, state);
        state.cycle_running.store(false, Ordering::Release);
        drop(state.idle_mutex.lock());
        state.idle_cv.notify_all();
    }
}

fn run_cycle(heap: &RuntimeHeap, state: &ConcurrentState) {
    let self_ptr = threads::current_control_ptr();

    // ------------------------------------------------------------------
    // Initial pause: snapshot roots, arm the barrier
    // ------------------------------------------------------------------
    let Some(guard) = acquire_collection_lock(heap, state) else {
        return cancel(state);
    };
    let init_pause = Instant::now();
    let threads = heap.registry.lock();
    let _outcome = heap
        .coordinator
        .suspend_all(&threads, self_ptr, heap.config.suspend_timeout);
    let mut worklist: Vec<usize>;
    {
        let inner = heap.inner.lock();
        while state.satb.pop().is_some() {}
        for seg in &inner.segments {
            seg.walk(|obj| {
                if obj.type_id() != TYPE_FREE {
                    obj.clear_flags(FLAG_MARK | FLAG_PIN);
                }
            });
        }
        let mut marker = Marker::new(&inner, &heap.types, Generation::Gen2);
        scan_roots(&threads, heap, &mut marker);
        worklist = marker.pending();
    }
    state.satb_active.store(true, Ordering::Release);
    state.alloc_black.store(true, Ordering::Release);
    heap.coordinator.resume_all(&threads, self_ptr);
    drop(threads);
    drop(guard);
    let init_pause = init_pause.elapsed();
    debug!(roots = worklist.len(), "background mark started");

    // ------------------------------------------------------------------
    // Concurrent mark: trace in batches, the heap lock released between
    // ------------------------------------------------------------------
    let mark_start = Instant::now();
    loop {
        if state.abort.load(Ordering::Acquire) {
            return cancel(state);
        }
        {
            let inner = heap.inner.lock();
            let mut marker = Marker::new(&inner, &heap.types, Generation::Gen2);
            marker.seed(worklist.drain(..));
            while let Some(addr) = state.satb.pop() {
                marker.mark_addr(addr);
            }
            let emptied = marker.drain_some(TRACE_BATCH);
            worklist = marker.pending();
            if emptied && worklist.is_empty() && state.satb.is_empty() {
                break;
            }
        }
        std::thread::yield_now();
    }
    let mark_duration = mark_start.elapsed();

    // ------------------------------------------------------------------
    // Final pause: drain the barrier, rescan roots, sweep the old space
    // ------------------------------------------------------------------
    let Some(guard) = acquire_collection_lock(heap, state) else {
        return cancel(state);
    };
    let final_pause = Instant::now();
    let threads = heap.registry.lock();
    let outcome = heap
        .coordinator
        .suspend_all(&threads, self_ptr, heap.config.suspend_timeout);

    let mut totals = SweepTotals::default();
    {
        let mut inner_guard = heap.inner.lock();
        let inner = &mut *inner_guard;
        {
            let mut marker = Marker::new(inner, &heap.types, Generation::Gen2);
            marker.seed(worklist.drain(..));
            while let Some(addr) = state.satb.pop() {
                marker.mark_addr(addr);
            }
            scan_roots(&threads, heap, &mut marker);
            marker.drain();
            heap.finalize.promote_dead(
                |obj| {
                    inner
                        .generation_of(obj.addr())
                        .is_some_and(|gen| gen.age() == 2)
                        && !obj.is_marked()
                },
                |obj| marker.resurrect(obj),
            );
            marker.drain();
        }
        heap.handles.sweep(
            |obj| {
                inner
                    .generation_of(obj.addr())
                    .is_some_and(|gen| gen.age() == 2)
                    && !obj.is_marked()
            },
            |obj| obj,
        );

        // Sweep Gen2 and the large space in place. Young segments keep
        // their state; the next minor collection clears the marks the
        // tracer left behind.
        let mut dead_segments: Vec<usize> = Vec::new();
        for (index, seg) in inner.segments.iter_mut().enumerate() {
            if seg.generation.age() != 2 {
                continue;
            }
            if seg.large {
                let obj =
                    ObjRef::from_addr(seg.objects_start()).expect("segment base is never zero");
                if obj.is_marked() {
                    obj.clear_flags(FLAG_MARK | FLAG_PIN);
                    seg.live_bytes = obj.size();
                    totals.live_bytes += obj.size();
                    totals.live_objects += 1;
                } else {
                    totals.dead_bytes += obj.size();
                    totals.dead_objects += 1;
                    dead_segments.push(index);
                    continue;
                }
            } else {
                let swept = super::sweep_segment(seg);
                totals.live_bytes += swept.live_bytes;
                totals.live_objects += swept.live_objects;
                totals.dead_bytes += swept.dead_bytes;
                totals.dead_objects += swept.dead_objects;
            }
            // Swept in place, so precise card state is gone; keep the
            // whole live range dirty for the next minor scan.
            seg.cards().clear_all();
            let len = seg.allocated_end() - seg.base();
            if len > 0 {
                seg.cards().dirty_range(0, len);
            }
        }
        inner.remove_segments(&dead_segments);
        inner.gen2_used = 0;

        state.satb_active.store(false, Ordering::Release);
        state.alloc_black.store(false, Ordering::Release);
        while state.satb.pop().is_some() {}
    }
    heap.collection_epoch.fetch_add(1, Ordering::Release);
    heap.coordinator.resume_all(&threads, self_ptr);
    drop(threads);
    drop(guard);
    let final_pause = final_pause.elapsed();

    let metrics = GcMetrics {
        duration: init_pause + final_pause,
        bytes_reclaimed: totals.dead_bytes,
        bytes_surviving: totals.live_bytes,
        objects_reclaimed: totals.dead_objects,
        objects_surviving: totals.live_objects,
        collection_type: CollectionType::Background,
        total_collections: 0,
        mark_duration,
        sweep_duration: final_pause,
        compact_duration: Duration::ZERO,
        cards_scanned: 0,
        objects_relocated: 0,
        threads_exempted: outcome.exempted,
    };
    info!(
        kind = ?CollectionType::Background,
        trigger = ?TriggerKind::Background,
        pause_us = metrics.duration.as_micros() as u64,
        mark_us = mark_duration.as_micros() as u64,
        reclaimed = metrics.bytes_reclaimed,
        surviving = metrics.bytes_surviving,
        "collection finished"
    );
    heap.metrics.record(metrics);
}

fn scan_roots(
    threads: &[Arc<MutatorControl>],
    heap: &RuntimeHeap,
    marker: &mut Marker<'_>,
) {
    for control in threads {
        if control.is_exempt() {
            marker.mark_root(control.shadow_stack().as_conservative_range());
        } else {
            control
                .shadow_stack()
                .report_precise(|root| marker.mark_root(root));
        }
    }
    heap.handles
        .report_strong(|obj, pinned| marker.mark_ref(obj, pinned));
    heap.statics.report(|root| marker.mark_root(root));
    heap.finalize.report_ready(|obj| marker.mark_ref(obj, false));
}

/// Polls for the collection lock, giving up when the cycle is aborted.
/// Never blocks on the lock outright: the full collection that wants to
/// preempt this cycle is the one holding it.
fn acquire_collection_lock<'a>(
    heap: &'a RuntimeHeap,
    state: &ConcurrentState,
) -> Option<MutexGuard<'a, ()>> {
    loop {
        if state.abort.load(Ordering::Acquire) {
            return None;
        }
        if let Some(guard) = heap.collection_lock.try_lock() {
            return Some(guard);
        }
        std::thread::sleep(LOCK_RETRY);
    }
}

/// Disarms the barrier after an aborted cycle. Marks left on objects are
/// cleared by the next collection's own flag sweep.
fn cancel(state: &ConcurrentState) {
    state.satb_active.store(false, Ordering::Release);
    state.alloc_black.store(false, Ordering::Release);
    while state.satb.pop().is_some() {}
    debug!("background cycle aborted");
}
