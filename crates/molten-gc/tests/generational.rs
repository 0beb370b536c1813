//! Generational behavior: budget-triggered collections, whole-segment
//! promotion, and survivor accounting.

use std::sync::atomic::{AtomicUsize, Ordering};

use molten_gc::{
    CollectionType, Generation, HeapConfig, RuntimeHeap, SurvivalStats, TypeDescriptor,
};

#[test]
fn allocation_pressure_triggers_minor_collections() {
    let heap = RuntimeHeap::new(HeapConfig::small());
    let cell = heap.register_type(TypeDescriptor::new("cell", 2, vec![], false));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    // 64 KiB of garbage against a 16 KiB budget.
    for _ in 0..2000 {
        let _ = heap.allocate(cell).unwrap();
    }
    assert!(
        heap.metrics().total_minor_collections() >= 2,
        "budget never triggered a collection"
    );
    assert_eq!(heap.metrics().last().collection_type, CollectionType::Minor);
}

#[test]
fn survivors_promote_whole_segments() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let obj = heap.allocate(cell).unwrap();
    heap.write_word(obj, 0, 0xA5A5);
    let slot = frame.push(Some(obj));

    heap.collect_generation(Generation::Gen0);
    let obj = slot.get().unwrap();
    assert_eq!(heap.generation_of(obj), Some(Generation::Gen1));

    // Gen0-only collections leave the middle generation alone.
    heap.collect_generation(Generation::Gen0);
    let obj = slot.get().unwrap();
    assert_eq!(heap.generation_of(obj), Some(Generation::Gen1));

    heap.collect_generation(Generation::Gen1);
    let obj = slot.get().unwrap();
    assert_eq!(heap.generation_of(obj), Some(Generation::Gen2));
    assert_eq!(heap.read_word(obj, 0), 0xA5A5);
}

#[test]
fn sweep_accounting_matches_the_object_graph() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 2, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    // 100 rooted objects, 1000 garbage ones, 32 bytes each.
    for _ in 0..100 {
        let obj = heap.allocate(cell).unwrap();
        frame.push(Some(obj));
    }
    for _ in 0..1000 {
        let _ = heap.allocate(cell).unwrap();
    }
    heap.collect_generation(Generation::Gen0);

    let last = heap.metrics().last();
    assert_eq!(last.collection_type, CollectionType::Minor);
    assert_eq!(last.objects_surviving, 100);
    assert_eq!(last.objects_reclaimed, 1000);
    assert_eq!(last.bytes_surviving, 100 * 32);
    // Reclaimed bytes include the retired allocation-context remainders.
    assert!(last.bytes_reclaimed >= 1000 * 32);
}

static POLICY_CALLS: AtomicUsize = AtomicUsize::new(0);

fn fixed_budget(_stats: &SurvivalStats, config: &HeapConfig) -> usize {
    POLICY_CALLS.fetch_add(1, Ordering::Relaxed);
    config.min_gen0_budget
}

#[test]
fn budget_policy_is_replaceable() {
    let mut config = HeapConfig::small();
    config.budget_policy = fixed_budget;
    let heap = RuntimeHeap::new(config);
    let cell = heap.register_type(TypeDescriptor::new("cell", 2, vec![], false));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    for _ in 0..2000 {
        let _ = heap.allocate(cell).unwrap();
    }
    heap.collect_generation(Generation::Gen0);
    assert!(
        POLICY_CALLS.load(Ordering::Relaxed) >= 1,
        "custom budget policy was never consulted"
    );
}
