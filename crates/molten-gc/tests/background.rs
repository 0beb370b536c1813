//! Background (concurrent) collection of the old generation.

use std::thread;
use std::time::{Duration, Instant};

use molten_gc::{
    CollectionType, Generation, HeapConfig, RuntimeHeap, TypeDescriptor,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn concurrent_config() -> HeapConfig {
    let mut config = HeapConfig::small();
    config.concurrent = true;
    config
}

/// Spins until one background cycle has been recorded.
fn wait_for_background(heap: &RuntimeHeap) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.metrics().total_background_collections() == 0 {
        assert!(
            Instant::now() < deadline,
            "background collection never completed"
        );
        molten_gc::safepoint();
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn background_requests_need_the_concurrent_switch() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    assert!(!heap.start_background_collection());
}

#[test]
fn background_cycle_reclaims_unreachable_old_objects() {
    init_tracing();
    let heap = RuntimeHeap::new(concurrent_config());
    // Past the large-object threshold, so it lives in the old space from
    // the start.
    let blob = heap.register_type(TypeDescriptor::new("blob", 10_624, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let kept = heap.allocate(blob).unwrap();
    heap.write_word(kept, 0, 0x600D);
    let slot = frame.push(Some(kept));
    let _garbage = heap.allocate(blob).unwrap();

    assert!(heap.start_background_collection());
    wait_for_background(&heap);

    let last = heap.metrics().last();
    assert_eq!(last.collection_type, CollectionType::Background);
    assert!(
        last.bytes_reclaimed >= 85_000,
        "dead large object was not reclaimed"
    );
    let kept = slot.get().expect("rooted object dropped by the background cycle");
    assert_eq!(heap.read_word(kept, 0), 0x600D);
    assert_eq!(heap.generation_of(kept), Some(Generation::Large));
}

#[test]
fn explicit_full_collection_preempts_a_background_cycle() {
    init_tracing();
    let heap = RuntimeHeap::new(concurrent_config());
    let blob = heap.register_type(TypeDescriptor::new("blob", 10_624, vec![], false));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    let _ = heap.allocate(blob).unwrap();
    let _ = heap.allocate(blob).unwrap();

    heap.start_background_collection();
    // Must finish promptly whether it aborts the cycle or runs after it.
    heap.collect();
    assert!(heap.metrics().total_major_collections() >= 1);
    assert!(heap.metrics().total_bytes_reclaimed() >= 2 * 85_000);
}
