use frameheap::{Heap, HeapConfig, HeapError, ShapeFlags, Symbol, Value};

fn heap() -> Heap {
    Heap::new(HeapConfig::with_arena_slots(1024)).unwrap()
}

fn sym(n: u32) -> Value {
    Value::Symbol(Symbol(n))
}

#[test]
fn prototype_chains_survive_compaction() {
    let mut heap = heap();
    let proto = heap.config().proto_tag;
    let _garbage = heap.allocate_array(Value::Nil, 30).unwrap();

    let parent = heap.allocate_frame().unwrap();
    let parent = heap.frame_set(parent, sym(1), Value::Int(100)).unwrap();
    let parent_root = heap.add_root(parent).unwrap();
    let child = heap.allocate_frame().unwrap();
    let parent = heap.root(parent_root).unwrap();
    let child = heap.frame_set(child, proto, parent).unwrap();
    let child_root = heap.add_root(child).unwrap();
    heap.remove_root(parent_root).unwrap();

    let stats = heap.collect().unwrap();
    assert!(stats.moved_objects > 0);
    let child = heap.root(child_root).unwrap();
    assert_eq!(heap.frame_lookup(child, sym(1)).unwrap(), Some(Value::Int(100)));
}

#[test]
fn cloned_frames_diverge_without_touching_the_original() {
    let mut heap = heap();
    let frame = heap.allocate_frame().unwrap();
    let frame = heap.frame_set(frame, sym(1), Value::Int(1)).unwrap();
    let root = heap.add_root(frame).unwrap();

    let copy = heap.clone_object(frame).unwrap();
    let frame = heap.root(root).unwrap();
    let shape = heap.shape_of(frame).unwrap();
    assert_eq!(heap.shape_of(copy).unwrap(), shape);
    assert!(heap.shape_flags(shape).unwrap().contains(ShapeFlags::SHARED));

    let copy = heap.frame_set(copy, sym(2), Value::Int(2)).unwrap();
    let frame = heap.root(root).unwrap();
    assert_eq!(heap.frame_tags(copy).unwrap(), vec![sym(1), sym(2)]);
    assert_eq!(heap.frame_tags(frame).unwrap(), vec![sym(1)]);
    assert_eq!(heap.frame_get(copy, sym(1)).unwrap(), Some(Value::Int(1)));
    assert_eq!(heap.frame_get(frame, sym(2)).unwrap(), None);
}

#[test]
fn frames_grow_through_frame_set_only() {
    let mut heap = heap();
    let frame = heap.allocate_frame().unwrap();
    assert!(matches!(
        heap.set_length(frame, 2),
        Err(HeapError::TypeMismatch { .. })
    ));
    assert!(matches!(
        heap.set_class(frame, Value::Nil),
        Err(HeapError::TypeMismatch { .. })
    ));
    let frame = (1..=20).try_fold(frame, |frame, n| {
        heap.frame_set(frame, sym(n), Value::Int(i64::from(n)))
    });
    let frame = frame.unwrap();
    assert_eq!(heap.length(frame).unwrap(), 20);
    assert_eq!(heap.frame_get(frame, sym(17)).unwrap(), Some(Value::Int(17)));
}

#[test]
fn many_frames_with_one_shape_collect_cleanly() {
    let mut heap = heap();
    let shape = heap.allocate_shape(Value::Nil, 3).unwrap();
    for (i, tag) in [sym(1), sym(2), sym(3)].into_iter().enumerate() {
        heap.set_shape_tag(shape, i, tag).unwrap();
    }
    let shape_root = heap.add_root(shape).unwrap();
    let mut roots = Vec::new();
    for n in 0..10 {
        let shape = heap.root(shape_root).unwrap();
        let frame = heap.allocate_frame_with_shape(shape).unwrap();
        heap.set_slot(frame, 2, Value::Int(n)).unwrap();
        if n % 2 == 0 {
            roots.push(heap.add_root(frame).unwrap());
        }
    }
    heap.remove_root(shape_root).unwrap();

    let stats = heap.collect().unwrap();
    assert_eq!(stats.live_objects, roots.len() + 1);
    let shape = heap.shape_of(heap.root(roots[0]).unwrap()).unwrap();
    for (i, root) in roots.iter().enumerate() {
        let frame = heap.root(*root).unwrap();
        assert_eq!(heap.shape_of(frame).unwrap(), shape);
        assert_eq!(heap.frame_get(frame, sym(3)).unwrap(), Some(Value::Int(2 * i as i64)));
    }
    heap.verify().unwrap();
}
