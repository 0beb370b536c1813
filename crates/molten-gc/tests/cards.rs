//! Write-barrier and card-table soundness: references from old objects are
//! the only path to young targets, and minor collections must honor them.

use molten_gc::{Generation, HandleKind, HeapConfig, RuntimeHeap, TypeDescriptor};

#[test]
fn old_to_young_references_survive_minor_collections() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    // Slot 0 is a reference, slot 1 a scalar.
    let node = heap.register_type(TypeDescriptor::new("node", 2, vec![0], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    // Age one object into Gen2. Minor collections never move objects, so
    // re-reading the slot after each one is enough.
    let old = heap.allocate(node).unwrap();
    let slot_old = frame.push(Some(old));
    heap.collect_generation(Generation::Gen0);
    heap.collect_generation(Generation::Gen1);
    let old = slot_old.get().unwrap();
    assert_eq!(heap.generation_of(old), Some(Generation::Gen2));

    // A young object reachable only through the old one.
    let young = heap.allocate(node).unwrap();
    heap.write_word(young, 1, 41);
    heap.write_ref(old, 0, Some(young));

    heap.collect_generation(Generation::Gen0);
    let young = heap
        .read_ref(old, 0)
        .expect("young target dropped despite the dirty card");
    assert_eq!(heap.read_word(young, 1), 41);
    assert_eq!(heap.generation_of(young), Some(Generation::Gen1));
    assert!(heap.metrics().last().cards_scanned >= 1);

    // The card must stay dirty while the target is still younger than the
    // holder, so a Gen1 collection sees the edge too.
    heap.collect_generation(Generation::Gen1);
    let young = heap.read_ref(old, 0).expect("target dropped on the second minor");
    assert_eq!(heap.read_word(young, 1), 41);
    assert_eq!(heap.generation_of(young), Some(Generation::Gen2));
}

#[test]
fn handle_rooted_old_objects_keep_their_young_referents() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let node = heap.register_type(TypeDescriptor::new("node", 2, vec![0], false));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    // The old object is held only through a pinned handle; its shadow-stack
    // root is gone before the minor collection runs.
    let old = heap.allocate(node).unwrap();
    let handle = heap.handles().create(old, HandleKind::Pinned);
    heap.collect_generation(Generation::Gen0);
    heap.collect_generation(Generation::Gen1);
    let old = heap.handles().get(handle).expect("pinned handle lost its target");
    assert_eq!(heap.generation_of(old), Some(Generation::Gen2));

    let young = heap.allocate(node).unwrap();
    heap.write_word(young, 1, 7);
    heap.write_ref(old, 0, Some(young));
    heap.collect_generation(Generation::Gen0);

    let young = heap
        .read_ref(old, 0)
        .expect("young referent of a handle-rooted object dropped");
    assert_eq!(heap.read_word(young, 1), 7);
    heap.handles().destroy(handle);
}

#[test]
fn young_to_young_edges_need_no_cards() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let node = heap.register_type(TypeDescriptor::new("node", 2, vec![0], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let a = heap.allocate(node).unwrap();
    let slot_a = frame.push(Some(a));
    let b = heap.allocate(node).unwrap();
    heap.write_word(b, 1, 7);
    heap.write_ref(slot_a.get().unwrap(), 0, Some(b));

    // b is reachable only through a; tracing from the shadow stack covers it.
    heap.collect_generation(Generation::Gen0);
    let a = slot_a.get().unwrap();
    let b = heap.read_ref(a, 0).expect("transitively reachable object dropped");
    assert_eq!(heap.read_word(b, 1), 7);
}
