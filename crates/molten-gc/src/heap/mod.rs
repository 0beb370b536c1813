//! The managed heap: segments, generations, allocation, and the write
//! barrier. Collection phases live in [`crate::collect`].

pub mod alloc;
pub mod card;
pub mod segment;

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::collect::{self, concurrent::ConcurrentState};
use crate::config::HeapConfig;
use crate::finalize::FinalizeQueue;
use crate::heap::alloc::AllocError;
use crate::heap::segment::{Segment, SEGMENT_SIZE};
use crate::metrics::{CollectionType, MetricsStore};
use crate::object::{
    write_free_filler, write_header, ObjRef, TypeDescriptor, TypeId, TypeRegistry, FLAG_MARK,
    HEADER_BYTES, TYPE_FREE,
};
use crate::roots::{HandleTable, StaticRoots};
use crate::suspend::{self, SuspendShared, SuspensionBackend, SuspensionCoordinator};
use crate::threads::{self, MutatorControl, MutatorGuard, RuntimeSection, ThreadRegistry};

/// Objects at or above this size go straight to the large-object space and
/// never move.
pub const LARGE_OBJECT_THRESHOLD: usize = 85_000;

/// Heap generations. Small objects start in Gen0 and age by whole-segment
/// promotion; `Large` is the non-moving large-object space, collected with
/// Gen2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Generation {
    Gen0 = 0,
    Gen1 = 1,
    Gen2 = 2,
    Large = 3,
}

impl Generation {
    /// Where a surviving segment of this generation goes.
    #[must_use]
    pub(crate) const fn promoted(self) -> Self {
        match self {
            Self::Gen0 => Self::Gen1,
            Self::Gen1 => Self::Gen2,
            Self::Gen2 => Self::Gen2,
            Self::Large => Self::Large,
        }
    }

    /// Age rank for card purposes; `Large` is as old as Gen2.
    #[must_use]
    pub(crate) const fn age(self) -> u8 {
        match self {
            Self::Gen0 => 0,
            Self::Gen1 => 1,
            Self::Gen2 | Self::Large => 2,
        }
    }

    /// Whether a segment of this generation is condemned when `condemn`
    /// is collected.
    #[must_use]
    pub(crate) fn condemned_by(self, condemn: Self) -> bool {
        match condemn {
            Self::Gen0 => self == Self::Gen0,
            Self::Gen1 => self <= Self::Gen1,
            Self::Gen2 | Self::Large => true,
        }
    }
}

/// Sorted (base, end, segment index) ranges for address lookups that must
/// not fault: conservative root words and large-object interiors.
#[derive(Default)]
pub(crate) struct SegmentMap {
    ranges: Vec<(usize, usize, usize)>,
}

impl SegmentMap {
    fn insert(&mut self, base: usize, end: usize, index: usize) {
        let pos = self.ranges.partition_point(|&(b, _, _)| b < base);
        self.ranges.insert(pos, (base, end, index));
    }

    pub(crate) fn lookup(&self, addr: usize) -> Option<usize> {
        let pos = self.ranges.partition_point(|&(b, _, _)| b <= addr);
        let &(base, end, index) = self.ranges.get(pos.checked_sub(1)?)?;
        (addr >= base && addr < end).then_some(index)
    }

    fn rebuild(&mut self, segments: &[Segment]) {
        self.ranges.clear();
        for (index, seg) in segments.iter().enumerate() {
            self.ranges.push((seg.base(), seg.end(), index));
        }
        self.ranges.sort_unstable_by_key(|&(b, _, _)| b);
    }
}

/// Heap structures guarded by the heap lock.
pub(crate) struct HeapState {
    pub(crate) segments: Vec<Segment>,
    pub(crate) map: SegmentMap,
    /// Bytes carved for Gen0 contexts since the last Gen0 collection.
    pub(crate) gen0_used: usize,
    pub(crate) gen0_budget: usize,
    /// Bytes promoted into Gen2 or allocated large since the last full
    /// collection.
    pub(crate) gen2_used: usize,
    pub(crate) shutting_down: bool,
}

impl HeapState {
    fn new(config: &HeapConfig) -> Self {
        Self {
            segments: Vec::new(),
            map: SegmentMap::default(),
            gen0_used: 0,
            gen0_budget: config.gen0_budget,
            gen2_used: 0,
            shutting_down: false,
        }
    }

    pub(crate) fn add_segment(&mut self, seg: Segment) -> usize {
        let index = self.segments.len();
        self.map.insert(seg.base(), seg.end(), index);
        self.segments.push(seg);
        index
    }

    /// Drops segments flagged by the collector and reindexes the map.
    pub(crate) fn remove_segments(&mut self, dead: &[usize]) {
        if dead.is_empty() {
            return;
        }
        let mut index = 0;
        self.segments.retain(|_| {
            let drop_it = dead.contains(&index);
            index += 1;
            !drop_it
        });
        self.map.rebuild(&self.segments);
    }

    fn carve_gen0_span(&mut self, min: usize, preferred: usize) -> io::Result<(usize, usize)> {
        // Swept free gaps first, then the bump frontier. Gap memory is below
        // the bump watermark, so it is already committed.
        for seg in &mut self.segments {
            if seg.generation != Generation::Gen0 || seg.large || seg.free_gap_bytes() < min {
                continue;
            }
            if let Some(addr) = seg.take_free_gap(preferred) {
                return Ok((addr, preferred));
            }
            if min < preferred {
                if let Some(addr) = seg.take_free_gap(min) {
                    return Ok((addr, min));
                }
            }
        }
        for seg in &mut self.segments {
            if seg.generation == Generation::Gen0 && !seg.large {
                if let Some(span) = seg.carve_span(min, preferred)? {
                    return Ok(span);
                }
            }
        }
        let mut seg = Segment::new(Generation::Gen0)?;
        let span = seg
            .carve_span(min, preferred)?
            .expect("fresh segment cannot satisfy a small span");
        debug!(base = format_args!("{:#x}", seg.base()), "new gen0 segment");
        self.add_segment(seg);
        Ok(span)
    }

    /// Resolves a conservative word to the object containing it, walking
    /// the segment it points into. `None` for anything that is not an
    /// interior-or-base pointer to a live allocation.
    pub(crate) fn find_object(&self, addr: usize) -> Option<ObjRef> {
        let seg = &self.segments[self.map.lookup(addr)?];
        if !seg.contains(addr) {
            return None;
        }
        let mut found = None;
        seg.walk(|obj| {
            if found.is_none()
                && obj.type_id() != TYPE_FREE
                && addr >= obj.addr()
                && addr < obj.addr() + obj.size()
            {
                found = Some(obj);
            }
        });
        found
    }

    /// Validates a precise root value: it must be the base address of an
    /// allocation inside a segment's object range. A root that points into
    /// the heap but at a non-object address is heap corruption and fatal.
    pub(crate) fn assert_valid_object(&self, addr: usize) -> ObjRef {
        let index = self
            .map
            .lookup(addr)
            .unwrap_or_else(|| panic!("precise root points outside the heap: {addr:#x}"));
        let seg = &self.segments[index];
        assert!(
            seg.contains(addr) && addr % crate::object::OBJECT_ALIGN == 0,
            "precise root is not an object base: {addr:#x}"
        );
        ObjRef::from_addr(addr).expect("segment ranges never contain zero")
    }

    pub(crate) fn generation_of(&self, addr: usize) -> Option<Generation> {
        let index = self.map.lookup(addr)?;
        let seg = &self.segments[index];
        seg.contains(addr).then_some(seg.generation)
    }
}

/// The process-wide managed heap.
///
/// Created once at runtime start; mutator threads register with
/// [`RuntimeHeap::register_mutator`] before allocating. All state is
/// process-lifetime-only and rebuilt from nothing on each start.
pub struct RuntimeHeap {
    pub(crate) config: HeapConfig,
    pub(crate) types: TypeRegistry,
    pub(crate) inner: Mutex<HeapState>,
    pub(crate) registry: ThreadRegistry,
    pub(crate) coordinator: SuspensionCoordinator,
    /// Serializes collections; held for each stop-the-world window.
    pub(crate) collection_lock: Mutex<()>,
    pub(crate) collection_epoch: AtomicUsize,
    pub(crate) handles: HandleTable,
    pub(crate) statics: StaticRoots,
    pub(crate) finalize: FinalizeQueue,
    pub(crate) metrics: MetricsStore,
    pub(crate) concurrent: Arc<ConcurrentState>,
}

impl RuntimeHeap {
    /// Creates a heap with the platform's default suspension backend.
    #[must_use]
    pub fn new(config: HeapConfig) -> Arc<Self> {
        Self::with_backend(config, suspend::default_backend())
    }

    /// Creates a heap with an explicit suspension backend.
    #[must_use]
    pub fn with_backend(config: HeapConfig, backend: Box<dyn SuspensionBackend>) -> Arc<Self> {
        let shared = Arc::new(SuspendShared::new());
        let heap = Arc::new(Self {
            inner: Mutex::new(HeapState::new(&config)),
            types: TypeRegistry::new(),
            registry: ThreadRegistry::new(Arc::clone(&shared)),
            coordinator: SuspensionCoordinator::new(shared, backend),
            collection_lock: Mutex::new(()),
            collection_epoch: AtomicUsize::new(0),
            handles: HandleTable::new(),
            statics: StaticRoots::new(),
            finalize: FinalizeQueue::new(),
            metrics: MetricsStore::new(),
            concurrent: Arc::new(ConcurrentState::new()),
            config,
        });
        if heap.config.concurrent {
            collect::concurrent::spawn(&heap);
        }
        heap
    }

    /// Registers a managed type. The returned index is what allocation
    /// takes; descriptors are immutable once registered.
    pub fn register_type(&self, desc: TypeDescriptor) -> TypeId {
        self.types.register(desc)
    }

    /// Looks up a registered descriptor.
    #[must_use]
    pub fn type_descriptor(&self, ty: TypeId) -> Option<Arc<TypeDescriptor>> {
        self.types.get(ty)
    }

    /// Registers the calling thread as a mutator. The guard must stay
    /// alive for as long as the thread touches managed objects.
    pub fn register_mutator(&self) -> MutatorGuard<'_> {
        let control = self.registry.register();
        MutatorGuard::new(self, control)
    }

    pub(crate) fn release_thread(&self, control: &Arc<MutatorControl>) {
        // The remainder span is already tiled with a filler; dropping the
        // context abandons it until the next sweep reclaims it.
        let _ = control.alloc_ctx().take_remainder();
        self.registry.deregister(control);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates an object of a registered type. The payload is zeroed.
    ///
    /// The calling thread must be registered. May trigger a collection.
    ///
    /// # Errors
    ///
    /// [`AllocError::UnknownType`] for an unregistered index,
    /// [`AllocError::OutOfMemory`] when the OS refuses memory.
    pub fn allocate(&self, ty: TypeId) -> Result<ObjRef, AllocError> {
        let _section = RuntimeSection::enter();
        let desc = self.types.get(ty).ok_or(AllocError::UnknownType(ty))?;
        if desc.size >= LARGE_OBJECT_THRESHOLD {
            return self.allocate_large(ty, &desc);
        }
        let control =
            threads::current_control().expect("allocate called from an unregistered thread");
        loop {
            if let Some((addr, alloc_size)) = control.alloc_ctx().bump(desc.size) {
                // Keep the span walkable before the new object is visible.
                if let Some((p, l)) = control.alloc_ctx().span() {
                    // SAFETY: the remainder is unused span memory we own.
                    unsafe { write_free_filler(p, l) };
                }
                return Ok(self.finish_allocation(addr, alloc_size, ty, desc.finalizable));
            }
            self.refill_context(control, desc.size)?;
        }
    }

    fn finish_allocation(
        &self,
        addr: usize,
        alloc_size: usize,
        ty: TypeId,
        finalizable: bool,
    ) -> ObjRef {
        let flags = if self.concurrent.alloc_black() {
            FLAG_MARK
        } else {
            0
        };
        // SAFETY: the range was just carved for this allocation.
        unsafe {
            ptr::write_bytes(
                (addr + HEADER_BYTES) as *mut u8,
                0,
                alloc_size - HEADER_BYTES,
            );
            write_header(addr, ty, alloc_size, flags);
        }
        let obj = ObjRef::from_addr(addr).expect("allocation address is never zero");
        if finalizable {
            self.finalize.register(obj);
        }
        obj
    }

    fn refill_context(
        &self,
        control: &MutatorControl,
        min: usize,
    ) -> Result<(), AllocError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.shutting_down {
                    return Err(AllocError::ShuttingDown);
                }
                let quantum = self.config.alloc_quantum.max(min);
                // The budget floor: an empty budget window always admits
                // one span, otherwise a tiny budget would loop forever.
                // While a background mark is in flight minor collections
                // are deferred, so the budget is waived until it finishes.
                if inner.gen0_used == 0
                    || inner.gen0_used + quantum <= inner.gen0_budget
                    || self.concurrent.satb_active()
                {
                    let (start, len) = inner.carve_gen0_span(min, quantum)?;
                    let _ = control.alloc_ctx().take_remainder();
                    // SAFETY: freshly carved span owned by this context.
                    unsafe { write_free_filler(start, len) };
                    control.alloc_ctx().refill(start, len);
                    inner.gen0_used += len;
                    return Ok(());
                }
            }
            // Budget exhausted; collect with the heap lock dropped.
            self.perform_collection(Generation::Gen0, TriggerKind::Budget);
        }
    }

    fn allocate_large(
        &self,
        ty: TypeId,
        desc: &TypeDescriptor,
    ) -> Result<ObjRef, AllocError> {
        let over_budget = {
            let inner = self.inner.lock();
            if inner.shutting_down {
                return Err(AllocError::ShuttingDown);
            }
            inner.gen2_used > 0 && inner.gen2_used + desc.size > self.config.gen2_budget
        };
        if over_budget {
            if self.config.concurrent {
                self.concurrent.request_cycle();
            } else {
                self.perform_collection(Generation::Gen2, TriggerKind::Budget);
            }
        }

        let addr = {
            let mut inner = self.inner.lock();
            let mut seg = Segment::new_large(Generation::Large, desc.size)?;
            let (addr, _) = seg
                .carve_span(desc.size, desc.size)?
                .expect("large segment sized for exactly this object");
            inner.gen2_used += desc.size;
            inner.add_segment(seg);
            addr
        };
        debug!(size = desc.size, "large object allocated");
        Ok(self.finish_allocation(addr, desc.size, ty, desc.finalizable))
    }

    // ========================================================================
    // Reference access and the write barrier
    // ========================================================================

    /// Stores `value` into reference slot `slot` of `obj` and dirties the
    /// covering card. `slot` must be one of the type's registered reference
    /// slots and `obj` must be live.
    pub fn write_ref(&self, obj: ObjRef, slot: usize, value: Option<ObjRef>) {
        let _section = RuntimeSection::enter();
        self.debug_check_slot(obj, slot, true);
        if self.concurrent.satb_active() {
            // Snapshot-at-the-beginning: the overwritten reference must
            // survive the in-flight background cycle.
            // SAFETY: slot is in bounds per the call contract.
            let old = unsafe { obj.read_slot(slot) };
            if old != 0 {
                self.concurrent.record_overwrite(old);
            }
        }
        // SAFETY: slot is in bounds per the call contract.
        unsafe { obj.write_slot(slot, value.map_or(0, ObjRef::addr)) };
        self.dirty_card(obj.slot_addr(slot));
    }

    /// Reads reference slot `slot` of `obj`.
    #[must_use]
    pub fn read_ref(&self, obj: ObjRef, slot: usize) -> Option<ObjRef> {
        self.debug_check_slot(obj, slot, true);
        // SAFETY: slot is in bounds per the call contract.
        ObjRef::from_addr(unsafe { obj.read_slot(slot) })
    }

    /// Stores a scalar word into non-reference slot `slot`. No barrier.
    pub fn write_word(&self, obj: ObjRef, slot: usize, value: usize) {
        self.debug_check_slot(obj, slot, false);
        // SAFETY: slot is in bounds per the call contract.
        unsafe { obj.write_slot(slot, value) };
    }

    /// Reads a scalar word from non-reference slot `slot`.
    #[must_use]
    pub fn read_word(&self, obj: ObjRef, slot: usize) -> usize {
        self.debug_check_slot(obj, slot, false);
        // SAFETY: slot is in bounds per the call contract.
        unsafe { obj.read_slot(slot) }
    }

    fn debug_check_slot(&self, obj: ObjRef, slot: usize, want_ref: bool) {
        if cfg!(debug_assertions) {
            let desc = self
                .types
                .get(obj.type_id())
                .expect("object header carries an unregistered type index");
            assert!(slot < desc.slots, "slot {slot} out of bounds");
            #[allow(clippy::cast_possible_truncation)]
            let is_ref = desc.ref_slots.contains(&(slot as u16));
            assert_eq!(is_ref, want_ref, "slot {slot} reference-ness mismatch");
        }
    }

    /// Unconditional card dirtying. Races with the card scan are benign:
    /// the worst case is one extra card scanned next cycle.
    fn dirty_card(&self, slot_addr: usize) {
        // SAFETY: slot_addr is inside a committed object range, so the
        // masked base is committed memory.
        if let Some(header) = unsafe { segment::header_for_addr(slot_addr) } {
            // SAFETY: the header covers slot_addr.
            unsafe { header.dirty_card(slot_addr) };
            return;
        }
        // Interior of a large object past its first alignment unit.
        let inner = self.inner.lock();
        let Some(index) = inner.map.lookup(slot_addr) else {
            panic!("reference write outside the managed heap: {slot_addr:#x}");
        };
        let seg = &inner.segments[index];
        seg.cards().dirty_offset(slot_addr - seg.base());
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Runs a full stop-the-world collection of every generation,
    /// preempting any background cycle in flight.
    pub fn collect(&self) {
        self.perform_collection(Generation::Gen2, TriggerKind::Explicit);
    }

    /// Runs a collection condemning `generation` and everything younger.
    pub fn collect_generation(&self, generation: Generation) {
        self.perform_collection(generation, TriggerKind::Explicit);
    }

    /// Kicks off a background collection if concurrent mode is enabled.
    /// Returns false when it is not, or a cycle is already running.
    pub fn start_background_collection(&self) -> bool {
        self.config.concurrent && self.concurrent.request_cycle()
    }

    pub(crate) fn perform_collection(&self, condemn: Generation, trigger: TriggerKind) {
        let epoch = self.collection_epoch.load(Ordering::Acquire);
        let guard = loop {
            if let Some(guard) = self.collection_lock.try_lock() {
                break guard;
            }
            // Another thread is collecting; park if it wants us stopped.
            threads::safepoint();
            std::thread::yield_now();
            if trigger == TriggerKind::Budget
                && self.collection_epoch.load(Ordering::Acquire) != epoch
            {
                // Someone else just collected on our behalf.
                return;
            }
        };

        let mut condemn = condemn;
        if condemn >= Generation::Gen2 {
            // Full collections take precedence over the background cycle.
            self.concurrent.preempt();
        } else if self.concurrent.satb_active() {
            // Minor collections would free young objects the background
            // tracer still has queued. They wait out the cycle; allocation
            // keeps going on the waived budget.
            debug!("minor collection deferred during background mark");
            return;
        } else if !self.config.concurrent {
            let inner = self.inner.lock();
            if inner.gen2_used > self.config.gen2_budget {
                condemn = Generation::Gen2;
            }
        }
        let ctype = if condemn >= Generation::Gen2 {
            CollectionType::Major
        } else {
            CollectionType::Minor
        };

        let threads = self.registry.lock();
        let self_ptr = threads::current_control_ptr();
        let pause_start = Instant::now();
        let outcome =
            self.coordinator
                .suspend_all(&threads, self_ptr, self.config.suspend_timeout);
        let metrics = collect::run_collection(self, &threads, condemn, ctype, &outcome);
        self.collection_epoch.fetch_add(1, Ordering::Release);
        self.coordinator.resume_all(&threads, self_ptr);
        drop(threads);
        drop(guard);

        let mut metrics = metrics;
        metrics.duration = pause_start.elapsed();
        info!(
            kind = ?ctype,
            ?trigger,
            pause_us = metrics.duration.as_micros() as u64,
            reclaimed = metrics.bytes_reclaimed,
            surviving = metrics.bytes_surviving,
            "collection finished"
        );
        self.metrics.record(metrics);

        // A minor collection may have pushed Gen2 over its budget.
        if ctype == CollectionType::Minor && self.config.concurrent {
            let over = self.inner.lock().gen2_used > self.config.gen2_budget;
            if over {
                self.concurrent.request_cycle();
            }
        }
    }

    // ========================================================================
    // Ancillary surfaces
    // ========================================================================

    /// Strong/weak/pinned handle table.
    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Static root registration.
    #[must_use]
    pub fn statics(&self) -> &StaticRoots {
        &self.statics
    }

    /// Finalization queue; drain it to run finalizers.
    #[must_use]
    pub fn finalization(&self) -> &FinalizeQueue {
        &self.finalize
    }

    /// Collection statistics.
    #[must_use]
    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    /// The generation currently holding `obj`, or `None` if `obj` does not
    /// point into the heap.
    #[must_use]
    pub fn generation_of(&self, obj: ObjRef) -> Option<Generation> {
        self.inner.lock().generation_of(obj.addr())
    }

    /// Number of live (committed) segments, large-object segments included.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Counts live (non-filler) objects across the heap. Stops the world.
    /// Diagnostics and tests only.
    #[must_use]
    pub fn live_object_count(&self) -> usize {
        let _guard = self.collection_lock.lock();
        let threads = self.registry.lock();
        let self_ptr = threads::current_control_ptr();
        let _outcome =
            self.coordinator
                .suspend_all(&threads, self_ptr, self.config.suspend_timeout);
        let count = {
            let inner = self.inner.lock();
            let mut count = 0;
            for seg in &inner.segments {
                seg.walk(|obj| {
                    if obj.type_id() != TYPE_FREE {
                        count += 1;
                    }
                });
            }
            count
        };
        self.coordinator.resume_all(&threads, self_ptr);
        count
    }
}

impl Drop for RuntimeHeap {
    fn drop(&mut self) {
        self.inner.get_mut().shutting_down = true;
        self.concurrent.shutdown();
    }
}

/// What provoked a collection, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerKind {
    Budget,
    Explicit,
    Background,
}

const _: () = assert!(LARGE_OBJECT_THRESHOLD < SEGMENT_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_map_lookup() {
        let mut map = SegmentMap::default();
        map.insert(0x10_0000, 0x20_0000, 0);
        map.insert(0x40_0000, 0x50_0000, 1);
        assert_eq!(map.lookup(0x10_0000), Some(0));
        assert_eq!(map.lookup(0x1f_ffff), Some(0));
        assert_eq!(map.lookup(0x20_0000), None);
        assert_eq!(map.lookup(0x45_0000), Some(1));
        assert_eq!(map.lookup(0x5_0000), None);
    }

    #[test]
    fn generation_ordering() {
        assert!(Generation::Gen0.condemned_by(Generation::Gen0));
        assert!(!Generation::Gen1.condemned_by(Generation::Gen0));
        assert!(Generation::Gen1.condemned_by(Generation::Gen1));
        assert!(Generation::Large.condemned_by(Generation::Gen2));
        assert_eq!(Generation::Gen0.promoted(), Generation::Gen1);
        assert_eq!(Generation::Gen2.promoted(), Generation::Gen2);
        assert_eq!(Generation::Large.promoted(), Generation::Large);
        assert_eq!(Generation::Large.age(), Generation::Gen2.age());
    }
}
