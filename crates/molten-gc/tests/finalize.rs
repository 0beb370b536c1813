//! Weak handles and the finalization queue.

use molten_gc::{Generation, HandleKind, HeapConfig, RuntimeHeap, TypeDescriptor};

#[test]
fn weak_handles_null_out_when_the_target_dies() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let kept = heap.allocate(cell).unwrap();
    let slot = frame.push(Some(kept));
    let doomed = heap.allocate(cell).unwrap();

    let weak_kept = heap.handles().create(kept, HandleKind::Weak);
    let weak_doomed = heap.handles().create(doomed, HandleKind::Weak);

    heap.collect_generation(Generation::Gen0);
    assert!(heap.handles().get(weak_doomed).is_none(), "weak handle kept its target alive");
    assert!(heap.handles().get(weak_kept).is_some());
    assert_eq!(heap.handles().get(weak_kept), slot.get());
}

#[test]
fn rooted_finalizable_objects_are_not_queued() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let res = heap.register_type(TypeDescriptor::new("resource", 1, vec![], true));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let obj = heap.allocate(res).unwrap();
    let _slot = frame.push(Some(obj));
    assert_eq!(heap.finalization().registered_count(), 1);

    heap.collect_generation(Generation::Gen0);
    assert_eq!(heap.finalization().ready_count(), 0);
    assert_eq!(heap.finalization().registered_count(), 1);
}

#[test]
fn undrained_ready_objects_survive_later_collections() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let res = heap.register_type(TypeDescriptor::new("resource", 1, vec![], true));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    let obj = heap.allocate(res).unwrap();
    heap.write_word(obj, 0, 0xF00D);
    heap.collect_generation(Generation::Gen0);
    assert_eq!(heap.finalization().ready_count(), 1);

    // The embedder is slow to run finalizers; the queued object rides out
    // any number of collections, full (moving) ones included.
    heap.collect_generation(Generation::Gen0);
    heap.collect();
    assert_eq!(heap.finalization().ready_count(), 1);

    let ready = heap.finalization().drain_ready();
    assert_eq!(ready.len(), 1);
    assert_eq!(heap.read_word(ready[0], 0), 0xF00D);

    // Finalization ran; now it is ordinary garbage.
    heap.collect();
    assert_eq!(heap.live_object_count(), 0);
}

#[test]
fn dead_finalizable_objects_are_resurrected_once() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let res = heap.register_type(TypeDescriptor::new("resource", 1, vec![], true));
    let mutator = heap.register_mutator();
    let _frame = mutator.frame();

    let obj = heap.allocate(res).unwrap();
    heap.write_word(obj, 0, 0xCAFE);
    assert_eq!(heap.finalization().registered_count(), 1);

    // Unreachable, but the pending finalization resurrects it.
    heap.collect_generation(Generation::Gen0);
    assert_eq!(heap.finalization().ready_count(), 1);
    assert_eq!(heap.finalization().registered_count(), 0);

    let ready = heap.finalization().drain_ready();
    assert_eq!(ready.len(), 1);
    // Minor collections never move objects, so the payload is reachable.
    assert_eq!(heap.read_word(ready[0], 0), 0xCAFE);
    assert_eq!(heap.finalization().ready_count(), 0);

    // Finalization ran; the next collection reclaims it for good.
    heap.collect();
    assert_eq!(heap.live_object_count(), 0);
    assert_eq!(heap.finalization().ready_count(), 0);
}
