//! End-to-end collection behaviour: reachability, reclamation, idempotence
//! and the root, handle and callback-object sources.

use std::sync::Arc;

use parking_lot::Mutex;

use frameheap::test_utils::SymbolTable;
use frameheap::{Depth, Heap, HeapConfig, HeapError, ObjectKind, ShapeFlags, Symbol, Value};

fn heap(slots: usize) -> Heap {
    Heap::new(HeapConfig::with_arena_slots(slots)).unwrap()
}

fn sym(n: u32) -> Value {
    Value::Symbol(Symbol(n))
}

#[test]
fn back_to_back_collections_are_idempotent() {
    let mut heap = heap(256);
    let _garbage = heap.allocate_array(Value::Nil, 5).unwrap();
    let top = heap.allocate_array(Value::Int(1), 3).unwrap();
    let bytes = heap.allocate_binary(Value::Nil, 10).unwrap();
    heap.set_slot(top, 0, bytes).unwrap();
    let root = heap.add_root(top).unwrap();

    let first = heap.collect().unwrap();
    assert!(first.reclaimed_slots > 0);
    let top_after_first = heap.root(root).unwrap();
    let used_after_first = heap.stats().used_slots;

    let second = heap.collect().unwrap();
    assert_eq!(second.reclaimed_slots, 0);
    assert_eq!(second.moved_objects, 0);
    assert_eq!(second.epoch, first.epoch);
    assert_eq!(second.live_slots, first.live_slots);
    assert_eq!(heap.root(root).unwrap(), top_after_first);
    assert_eq!(heap.stats().used_slots, used_after_first);
}

#[test]
fn reachable_objects_keep_their_contents() {
    let mut heap = heap(512);
    let _garbage = heap.allocate_array(Value::Nil, 5).unwrap();
    let bytes = heap.allocate_binary(Value::Int(1), 13).unwrap();
    heap.write_bytes(bytes, 0, b"reachability!").unwrap();
    let leaf = heap.allocate_array(Value::Int(2), 2).unwrap();
    heap.set_slot(leaf, 0, Value::Int(9)).unwrap();
    heap.set_slot(leaf, 1, bytes).unwrap();
    let _more_garbage = heap.allocate_binary(Value::Nil, 40).unwrap();
    let top = heap.allocate_array(Value::Int(3), 3).unwrap();
    heap.set_slot(top, 0, leaf).unwrap();
    heap.set_slot(top, 1, Value::Char('x')).unwrap();
    heap.set_slot(top, 2, bytes).unwrap();
    let root = heap.add_root(top).unwrap();

    let stats = heap.collect().unwrap();
    assert_eq!(stats.live_objects, 3);
    assert_eq!(heap.stats().forwarding_stubs, 0);

    let top = heap.root(root).unwrap();
    assert_eq!(heap.deref(top).unwrap(), top);
    assert_eq!(heap.class_of(top).unwrap(), Value::Int(3));
    assert_eq!(heap.get_slot(top, 1).unwrap(), Value::Char('x'));

    let leaf = heap.get_slot(top, 0).unwrap();
    let bytes = heap.get_slot(top, 2).unwrap();
    assert_eq!(heap.get_slot(leaf, 0).unwrap(), Value::Int(9));
    assert_eq!(heap.get_slot(leaf, 1).unwrap(), bytes);
    assert_eq!(heap.kind_of(bytes).unwrap(), ObjectKind::Binary);
    assert_eq!(heap.read_bytes(bytes).unwrap(), b"reachability!".to_vec());
}

#[test]
fn unreachable_space_is_reusable() {
    let mut heap = heap(64);
    let a = heap.allocate_array(Value::Nil, 20).unwrap();
    let a_root = heap.add_root(a).unwrap();
    let b = heap.allocate_array(Value::Nil, 20).unwrap();
    heap.add_root(b).unwrap();
    heap.remove_root(a_root).unwrap();

    let stats = heap.collect().unwrap();
    assert_eq!(stats.reclaimed_slots, 22);
    assert_eq!(heap.stats().used_slots, 22);
    let blocks = heap.dump().unwrap();
    assert_eq!(blocks.iter().filter(|b| !b.is_free()).count(), 1);

    // Exactly the reclaimed space, so no second collection is needed.
    heap.allocate_array(Value::Nil, 40).unwrap();
    assert_eq!(heap.stats().collections, 1);
    assert_eq!(heap.stats().free_slots, 0);
}

#[test]
fn array_held_only_by_a_deep_handle_is_reclaimed() {
    let mut heap = heap(128);
    for _ in 0..3 {
        heap.enter_scope();
    }
    assert_eq!(heap.current_depth(), Depth(3));
    let array = heap.allocate_array(sym(42), 10).unwrap();
    let handle = heap.allocate_handle(array).unwrap();

    assert_eq!(heap.clear_handles_deeper_than(Depth(2)), 1);
    let stats = heap.collect().unwrap();
    assert_eq!(stats.reclaimed_slots, 12);
    assert_eq!(heap.stats().free_slots, 128);
    assert_eq!(heap.handle(handle), Err(HeapError::InvalidHandle));

    let reused = heap.allocate_array(sym(42), 10).unwrap();
    assert_eq!(reused.addr().unwrap().index(), 0);
}

#[test]
fn array_held_by_a_root_survives_unchanged() {
    let mut heap = heap(128);
    let array = heap.allocate_array(sym(42), 10).unwrap();
    heap.set_slot(array, 9, Value::Int(-1)).unwrap();
    let root = heap.add_root(array).unwrap();

    let stats = heap.collect().unwrap();
    assert_eq!(stats.reclaimed_slots, 0);
    let survivor = heap.root(root).unwrap();
    assert_eq!(survivor, array);
    assert_eq!(heap.length(survivor).unwrap(), 10);
    assert_eq!(heap.class_of(survivor).unwrap(), sym(42));
    assert_eq!(heap.get_slot(survivor, 9).unwrap(), Value::Int(-1));
}

#[test]
fn frames_sharing_a_shape_keep_sharing_it() {
    let mut heap = heap(256);
    let _garbage = heap.allocate_array(Value::Nil, 8).unwrap();
    let shape = heap.allocate_shape(Value::Nil, 2).unwrap();
    heap.set_shape_tag(shape, 0, sym(1)).unwrap();
    heap.set_shape_tag(shape, 1, sym(2)).unwrap();
    let first = heap.allocate_frame_with_shape(shape).unwrap();
    let second = heap.allocate_frame_with_shape(shape).unwrap();
    let first = heap.frame_set(first, sym(1), Value::Int(10)).unwrap();
    let first_root = heap.add_root(first).unwrap();
    let second_root = heap.add_root(second).unwrap();

    let stats = heap.collect().unwrap();
    // Two frames plus the shape, counted once.
    assert_eq!(stats.live_objects, 3);

    let first = heap.root(first_root).unwrap();
    let second = heap.root(second_root).unwrap();
    let shape = heap.shape_of(first).unwrap();
    assert_eq!(heap.shape_of(second).unwrap(), shape);
    assert!(heap.shape_flags(shape).unwrap().contains(ShapeFlags::SHARED));
    assert_eq!(heap.frame_get(first, sym(1)).unwrap(), Some(Value::Int(10)));
    assert_eq!(heap.frame_get(second, sym(2)).unwrap(), Some(Value::Nil));

    heap.remove_root(first_root).unwrap();
    heap.remove_root(second_root).unwrap();
    heap.collect().unwrap();
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn callback_objects_trace_update_and_prune() {
    let mut heap = heap(256);
    let table = Arc::new(Mutex::new(SymbolTable::new()));
    let id = heap.register_callback_object(table.clone());

    let _garbage = heap.allocate_array(Value::Nil, 4).unwrap();
    let pinned = heap.allocate_binary(Value::Nil, 3).unwrap();
    table.lock().pin(pinned);
    let kept = heap.allocate_binary(Value::Nil, 2).unwrap();
    let kept_root = heap.add_root(kept).unwrap();
    table.lock().intern(kept);
    let dropped = heap.allocate_binary(Value::Nil, 2).unwrap();
    table.lock().intern(dropped);

    heap.collect().unwrap();
    let kept = heap.root(kept_root).unwrap();
    assert_eq!(table.lock().interned(), &[kept]);
    let pinned = table.lock().pinned()[0];
    assert_eq!(heap.length(pinned).unwrap(), 3);

    heap.unregister_callback_object(id).unwrap();
    let stats = heap.collect().unwrap();
    assert_eq!(stats.live_objects, 1);
    assert!(matches!(
        heap.unregister_callback_object(id),
        Err(HeapError::UnknownCallback)
    ));
}

#[test]
fn classes_and_handles_keep_objects_alive() {
    let mut heap = heap(256);
    let class = heap.allocate_binary(Value::Nil, 8).unwrap();
    let instance = heap.allocate_array(class, 1).unwrap();
    let _garbage = heap.allocate_array(Value::Nil, 3).unwrap();
    let handle = heap.allocate_handle(instance).unwrap();

    let stats = heap.collect().unwrap();
    assert_eq!(stats.live_objects, 2);
    let instance = heap.handle(handle).unwrap();
    let class = heap.class_of(instance).unwrap();
    assert_eq!(heap.length(class).unwrap(), 8);

    heap.dispose_handle(handle).unwrap();
    heap.collect().unwrap();
    assert_eq!(heap.stats().live_blocks, 0);
}

#[test]
fn gaps_beyond_the_free_stack_stay_free_space() {
    let config = HeapConfig {
        arena_slots: 128,
        free_stack_capacity: 1,
        ..HeapConfig::default()
    };
    let mut heap = Heap::new(config).unwrap();

    // Four pinned blocks at 8, 18, 28 and 38, each behind an 8-slot gap.
    let mut pinned = Vec::new();
    for i in 0..4 {
        heap.allocate_array(Value::Nil, 6).unwrap();
        let block = heap.allocate_array(Value::Int(i), 0).unwrap();
        heap.lock(block).unwrap();
        pinned.push((heap.add_root(block).unwrap(), block.addr().unwrap()));
    }
    let mut movable = Vec::new();
    for j in 0..3 {
        let array = heap.allocate_array(Value::Nil, 2).unwrap();
        heap.set_slot(array, 1, Value::Int(100 + j)).unwrap();
        movable.push(heap.add_root(array).unwrap());
    }

    let stats = heap.collect().unwrap();
    assert_eq!(stats.moved_objects, 3);
    heap.verify().unwrap();

    for (i, (root, addr)) in pinned.iter().enumerate() {
        let block = heap.root(*root).unwrap();
        assert_eq!(block.addr().unwrap(), *addr);
        assert_eq!(heap.class_of(block).unwrap(), Value::Int(i as i64));
    }
    let placed: Vec<_> = movable
        .iter()
        .map(|root| heap.root(*root).unwrap().addr().unwrap().index())
        .collect();
    // Only the first gap is banked; the third block goes to the cursor.
    assert_eq!(placed, vec![0, 4, 40]);
    for (j, root) in movable.iter().enumerate() {
        let array = heap.root(*root).unwrap();
        assert_eq!(heap.slots(array).unwrap(), vec![Value::Nil, Value::Int(100 + j as i64)]);
    }

    let after = heap.stats();
    assert_eq!(after.free_blocks, 4);
    assert_eq!(after.largest_free, 84);
    assert_eq!(after.free_slots, 108);
}
