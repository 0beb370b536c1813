//! Sliding compaction: survivors keep their contents, roots and handles are
//! rewritten, and pinned objects never move.

use molten_gc::{
    CollectionType, Generation, HandleKind, HeapConfig, RuntimeHeap, TypeDescriptor,
};

#[test]
fn full_collection_compacts_fragmented_segments() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 2, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let mut slots = Vec::new();
    for i in 0..400usize {
        let obj = heap.allocate(cell).unwrap();
        heap.write_word(obj, 0, i);
        heap.write_word(obj, 1, !i);
        slots.push(frame.push(Some(obj)));
    }
    // Kill every other object to fragment the segments.
    for (i, slot) in slots.iter().enumerate() {
        if i % 2 == 1 {
            slot.set(None);
        }
    }

    heap.collect();
    let last = heap.metrics().last();
    assert_eq!(last.collection_type, CollectionType::Major);
    assert!(last.objects_relocated > 0, "nothing moved");
    assert_eq!(last.objects_surviving, 200);

    for (i, slot) in slots.iter().enumerate() {
        if i % 2 == 0 {
            let obj = slot.get().expect("survivor dropped by compaction");
            assert_eq!(heap.read_word(obj, 0), i, "payload corrupted by the slide");
            assert_eq!(heap.read_word(obj, 1), !i);
            assert_eq!(heap.generation_of(obj), Some(Generation::Gen1));
        }
    }
}

#[test]
fn strong_handles_are_rewritten_across_moves() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    // Garbage in front so the survivor has somewhere to slide to.
    for _ in 0..50 {
        let _ = heap.allocate(cell).unwrap();
    }
    let obj = heap.allocate(cell).unwrap();
    heap.write_word(obj, 0, 0xD00D);
    let handle = heap.handles().create(obj, HandleKind::Strong);
    drop(frame);

    heap.collect();
    let obj = heap.handles().get(handle).expect("strong handle went dead");
    assert_eq!(heap.read_word(obj, 0), 0xD00D);
    heap.handles().destroy(handle);
}

#[test]
fn pinned_objects_do_not_move() {
    let heap = RuntimeHeap::new(HeapConfig::default());
    let cell = heap.register_type(TypeDescriptor::new("cell", 1, vec![], false));
    let mutator = heap.register_mutator();
    let frame = mutator.frame();

    let mut slots = Vec::new();
    for i in 0..100usize {
        let obj = heap.allocate(cell).unwrap();
        heap.write_word(obj, 0, i);
        slots.push(frame.push(Some(obj)));
    }
    let pinned_obj = slots[80].get().unwrap();
    let pin = heap.handles().create(pinned_obj, HandleKind::Pinned);
    let pinned_addr = pinned_obj.addr();
    // Drop everything else so the slide has plenty to do around the pin.
    for (i, slot) in slots.iter().enumerate() {
        if i != 80 && i % 4 != 0 {
            slot.set(None);
        }
    }

    heap.collect();
    assert!(heap.metrics().last().objects_relocated > 0);
    let pinned_obj = heap.handles().get(pin).unwrap();
    assert_eq!(pinned_obj.addr(), pinned_addr, "pinned object moved");
    assert_eq!(heap.read_word(pinned_obj, 0), 80);

    let live_before = heap.live_object_count();
    heap.handles().destroy(pin);
    slots[80].set(None);
    heap.collect();
    assert_eq!(heap.live_object_count(), live_before - 1);
}
