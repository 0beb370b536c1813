//! Basic allocation and object access.

use molten_gc::{
    AllocError, Generation, HeapConfig, RuntimeHeap, TypeDescriptor, TypeId,
};

#[test]
fn allocate_and_access_scalars() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let point = heap.register_type(TypeDescriptor::new("point", 2, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let obj = heap.allocate(point).unwrap();
    let _slot = frame.push(Some(obj));
    // Payload starts zeroed.
    assert_eq!(heap.read_word(obj, 0), 0);
    assert_eq!(heap.read_word(obj, 1), 0);

    heap.write_word(obj, 0, 7);
    heap.write_word(obj, 1, usize::MAX);
    assert_eq!(heap.read_word(obj, 0), 7);
    assert_eq!(heap.read_word(obj, 1), usize::MAX);
}

#[test]
fn reference_slots_round_trip() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let pair = heap.register_type(TypeDescriptor::new("pair", 2, vec![0, 1], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let a = heap.allocate(pair).unwrap();
    let slot_a = frame.push(Some(a));
    let b = heap.allocate(pair).unwrap();

    let a = slot_a.get().unwrap();
    assert_eq!(heap.read_ref(a, 0), None);
    heap.write_ref(a, 0, Some(b));
    assert_eq!(heap.read_ref(a, 0), Some(b));
    heap.write_ref(a, 0, None);
    assert_eq!(heap.read_ref(a, 0), None);
}

#[test]
fn unregistered_type_is_rejected() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    match heap.allocate(TypeId(99)) {
        Err(AllocError::UnknownType(ty)) => assert_eq!(ty, TypeId(99)),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn new_objects_start_in_gen0() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let point = heap.register_type(TypeDescriptor::new("point", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();
    let obj = heap.allocate(point).unwrap();
    let _slot = frame.push(Some(obj));
    assert_eq!(heap.generation_of(obj), Some(Generation::Gen0));
}

#[test]
fn large_objects_live_in_the_large_space() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    // 16 + 10624 * 8 = 85,008 bytes, past the large-object threshold.
    let blob = heap.register_type(TypeDescriptor::new("blob", 10_624, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let obj = heap.allocate(blob).unwrap();
    let slot = frame.push(Some(obj));
    assert_eq!(heap.generation_of(obj), Some(Generation::Large));
    heap.write_word(obj, 10_623, 0xBEEF);
    assert_eq!(heap.read_word(obj, 10_623), 0xBEEF);

    let before = heap.segment_count();
    slot.set(None);
    heap.collect();
    assert!(heap.segment_count() < before, "dead large segment was not released");
}

#[test]
fn live_object_count_sees_rooted_objects() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let point = heap.register_type(TypeDescriptor::new("point", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();
    for _ in 0..10 {
        let obj = heap.allocate(point).unwrap();
        frame.push(Some(obj));
    }
    assert_eq!(heap.live_object_count(), 10);
}
