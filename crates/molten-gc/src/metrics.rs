//! Collection metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Stop-the-world pause time (for background cycles, both pauses
    /// combined).
    pub duration: Duration,
    /// Bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Bytes surviving in the condemned generations.
    pub bytes_surviving: usize,
    /// Objects reclaimed.
    pub objects_reclaimed: usize,
    /// Objects surviving.
    pub objects_surviving: usize,
    /// What kind of collection ran.
    pub collection_type: CollectionType,
    /// Collections performed by this heap so far.
    pub total_collections: usize,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Duration of the compact phase (zero when nothing moved).
    pub compact_duration: Duration,
    /// Dirty cards scanned (minor collections only).
    pub cards_scanned: usize,
    /// Objects relocated by compaction.
    pub objects_relocated: usize,
    /// Mutators that missed the suspension deadline and were scanned
    /// conservatively.
    pub threads_exempted: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Creates a zeroed snapshot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            collection_type: CollectionType::None,
            total_collections: 0,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            cards_scanned: 0,
            objects_relocated: 0,
            threads_exempted: 0,
        }
    }
}

/// Kind of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// A minor collection (Gen0, or Gen0+Gen1).
    Minor = 1,
    /// A full stop-the-world collection.
    Major = 2,
    /// A full collection with concurrent marking.
    Background = 3,
}

/// Helper for capturing per-phase durations inside a collection.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Accumulated mark time.
    pub mark: Duration,
    /// Accumulated sweep time.
    pub sweep: Duration,
    /// Accumulated compact time.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Starts timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Ends the mark phase and records its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    /// Ends the sweep phase and records its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep += start.elapsed();
        }
    }

    /// Ends the compact phase and records its duration.
    pub fn end_compact(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.compact += start.elapsed();
        }
    }
}

/// Cumulative counters for one heap, updated at the end of every collection.
#[derive(Debug)]
pub struct MetricsStore {
    collections: AtomicUsize,
    minor_collections: AtomicUsize,
    major_collections: AtomicUsize,
    background_collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    pause_ns: AtomicU64,
    last: Mutex<GcMetrics>,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            minor_collections: AtomicUsize::new(0),
            major_collections: AtomicUsize::new(0),
            background_collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
            last: Mutex::new(GcMetrics::new()),
        }
    }

    /// Records a finished collection.
    pub fn record(&self, mut metrics: GcMetrics) {
        let total = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics.total_collections = total;
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        match metrics.collection_type {
            CollectionType::Minor => {
                self.minor_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Major => {
                self.major_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::Background => {
                self.background_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionType::None => {}
        }
        *self.last.lock() = metrics;
    }

    /// Snapshot of the most recent collection.
    #[must_use]
    pub fn last(&self) -> GcMetrics {
        *self.last.lock()
    }

    /// Total collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Total minor collections performed.
    #[inline]
    #[must_use]
    pub fn total_minor_collections(&self) -> usize {
        self.minor_collections.load(Ordering::Relaxed)
    }

    /// Total full stop-the-world collections performed.
    #[inline]
    #[must_use]
    pub fn total_major_collections(&self) -> usize {
        self.major_collections.load(Ordering::Relaxed)
    }

    /// Total background collections performed.
    #[inline]
    #[must_use]
    pub fn total_background_collections(&self) -> usize {
        self.background_collections.load(Ordering::Relaxed)
    }

    /// Total bytes reclaimed.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Total objects reclaimed.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Total stop-the-world pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        assert_eq!(timer.mark, Duration::ZERO);

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark > Duration::ZERO);

        timer.start();
        timer.end_sweep();
        // end without a matching start is a no-op
        timer.end_compact();
        assert_eq!(timer.compact, Duration::ZERO);
    }

    #[test]
    fn store_accumulates_by_type() {
        let store = MetricsStore::new();
        let mut m = GcMetrics::new();
        m.collection_type = CollectionType::Minor;
        m.bytes_reclaimed = 100;
        store.record(m);
        m.collection_type = CollectionType::Major;
        m.bytes_reclaimed = 50;
        store.record(m);

        assert_eq!(store.total_collections(), 2);
        assert_eq!(store.total_minor_collections(), 1);
        assert_eq!(store.total_major_collections(), 1);
        assert_eq!(store.total_bytes_reclaimed(), 150);
        assert_eq!(store.last().total_collections, 2);
        assert_eq!(store.last().collection_type, CollectionType::Major);
    }
}
