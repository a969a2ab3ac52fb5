//! Shape sharing, transitions and dictionary mode through the heap

use jsheap::{Attributes, ScopedReference, ShapeConfig, ShapeLayout, Value};

use super::{create_manual_heap, create_test_heap, names, plain_shape};

#[test]
fn test_same_properties_same_order_share_a_shape() {
    let heap = create_test_heap();
    let mut names = names();
    let (x, y) = (names.intern("x"), names.intern("y"));
    let shape = plain_shape(&heap);

    let a = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    let b = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    let c = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    for obj in [&a, &b] {
        heap.put(obj.get(), &x, Value::ONE).unwrap();
        heap.put(obj.get(), &y, Value::ZERO).unwrap();
    }
    heap.put(c.get(), &y, Value::ZERO).unwrap();
    heap.put(c.get(), &x, Value::ONE).unwrap();

    let shape_a = heap.shape_of(a.get()).unwrap();
    assert_eq!(shape_a, heap.shape_of(b.get()).unwrap());
    assert_ne!(shape_a, heap.shape_of(c.get()).unwrap());
    assert_eq!(heap.shapes().layout(shape_a), ShapeLayout::Shared);
}

#[test]
fn test_previous_chain_reconstructs_property_set() {
    let heap = create_manual_heap();
    let mut names = names();
    let obj = heap.allocate_object(plain_shape(&heap));
    heap.protect(obj);
    heap.put_direct(obj, &names.intern("a"), Value::ONE, Attributes::empty())
        .unwrap();
    heap.put_direct(obj, &names.intern("b"), Value::ONE, Attributes::DONT_ENUM)
        .unwrap();
    let proto = heap.allocate_object(plain_shape(&heap));
    heap.set_prototype(obj, proto).unwrap();
    heap.put_direct(obj, &names.intern("c"), Value::ONE, Attributes::READ_ONLY)
        .unwrap();

    let shape = heap.shape_of(obj).unwrap();
    let shapes = heap.shapes();
    let additions = shapes.property_additions(shape);
    let mut table = shapes.entries(shape);
    table.sort_by_key(|e| e.offset);
    assert_eq!(additions, table);
    let text: Vec<&str> = additions.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(text, ["a", "b", "c"]);
    assert_eq!(shapes.transition_count(shape), 4);
    assert_eq!(shapes.prototype(shape), proto);
}

#[test]
fn test_delete_and_re_add_keeps_values_apart() {
    let heap = create_manual_heap();
    let mut names = names();
    let obj = heap.allocate_object(plain_shape(&heap));
    heap.protect(obj);
    let keys: Vec<_> = (0..40).map(|i| names.intern(&format!("k{}", i))).collect();
    for (i, key) in keys.iter().enumerate() {
        heap.put(obj, key, Value::from(i as u16)).unwrap();
    }
    for key in keys.iter().step_by(3) {
        assert!(heap.delete_property(obj, key).unwrap());
    }
    for key in keys.iter().step_by(3) {
        heap.put(obj, key, Value::from(1000u16)).unwrap();
    }

    for (i, key) in keys.iter().enumerate() {
        let expected = if i % 3 == 0 { 1000 } else { i as u16 };
        assert_eq!(heap.get_direct(obj, key).unwrap(), Some(Value::from(expected)), "{}", key);
    }
    // no two properties share a slot
    let shape = heap.shape_of(obj).unwrap();
    let mut offsets: Vec<usize> = heap.shapes().entries(shape).iter().map(|e| e.offset).collect();
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), keys.len());
}

#[test]
fn test_long_chains_fall_back_to_dictionary() {
    let heap = create_test_heap();
    let mut names = names();
    let obj = ScopedReference::new(heap.clone(), heap.allocate_object(plain_shape(&heap)));
    let max = ShapeConfig::default().max_transition_length;
    let keys: Vec<_> = (0..max + 10).map(|i| names.intern(&format!("p{}", i))).collect();
    for (i, key) in keys.iter().enumerate() {
        let boxed = heap.number(i as f64 + 0.25);
        heap.put(obj.get(), key, boxed).unwrap();
    }

    let shape = heap.shape_of(obj.get()).unwrap();
    assert!(heap.shapes().is_dictionary(shape));
    heap.collect();
    for (i, key) in keys.iter().enumerate() {
        let boxed = heap.get_direct(obj.get(), key).unwrap().unwrap();
        assert_eq!(heap.to_number(boxed), Some(i as f64 + 0.25));
    }
}

#[test]
fn test_flattened_dictionaries_share_shapes() {
    let heap = create_manual_heap();
    let mut names = names();
    let (a, b, c) = (names.intern("a"), names.intern("b"), names.intern("c"));
    let root = plain_shape(&heap);

    let build = || {
        let obj = heap.allocate_object(root);
        heap.protect(obj);
        heap.put(obj, &a, Value::from(1u8)).unwrap();
        heap.put(obj, &b, Value::from(2u8)).unwrap();
        heap.put(obj, &c, Value::from(3u8)).unwrap();
        heap.delete_property(obj, &a).unwrap();
        heap.flatten_dictionary(obj).unwrap();
        obj
    };
    let first = build();
    let second = build();

    let shape = heap.shape_of(first).unwrap();
    assert_eq!(shape, heap.shape_of(second).unwrap());
    assert!(!heap.shapes().is_dictionary(shape));
    assert_eq!(heap.storage_of(first).unwrap(), [Value::from(2u8), Value::from(3u8)]);
    assert_eq!(heap.get(second, &c).unwrap(), Some(Value::from(3u8)));
    assert_eq!(heap.stats().dictionary_shapes, 0);
}

#[test]
fn test_prototype_change_does_not_touch_shared_shape() {
    let heap = create_manual_heap();
    let mut names = names();
    let x = names.intern("x");
    let root = plain_shape(&heap);
    let a = heap.allocate_object(root);
    let b = heap.allocate_object(root);
    heap.protect(a);
    heap.protect(b);
    heap.put(a, &x, Value::ONE).unwrap();
    heap.put(b, &x, Value::ONE).unwrap();

    let proto = heap.allocate_object(root);
    heap.set_prototype(a, proto).unwrap();
    assert_eq!(heap.prototype_of(a).unwrap(), proto);
    assert_eq!(heap.prototype_of(b).unwrap(), Value::NULL);
    assert_eq!(heap.get(a, &x).unwrap(), Some(Value::ONE));
}

#[test]
fn test_many_properties_grow_the_table() {
    let heap = create_manual_heap();
    let mut names = names();
    let obj = heap.allocate_object(plain_shape(&heap));
    heap.protect(obj);
    // stays on the shared graph, below the transition cap
    let keys: Vec<_> = (0..60).map(|i| names.intern(&format!("f{}", i))).collect();
    for (i, key) in keys.iter().enumerate() {
        heap.put(obj, key, Value::from(i as u16)).unwrap();
    }
    let shape = heap.shape_of(obj).unwrap();
    assert!(!heap.shapes().is_dictionary(shape));
    assert_eq!(heap.shapes().property_count(shape), 60);
    assert_eq!(heap.shapes().storage_size(shape), 60);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(heap.shapes().get_offset(shape, key), Some(i));
    }
}

#[test]
fn test_same_prototype_change_shares_a_shape() {
    let heap = create_manual_heap();
    let mut names = names();
    let x = names.intern("x");
    let root = plain_shape(&heap);
    let proto = ScopedReference::new(heap.clone(), heap.allocate_object(root));

    let first = ScopedReference::new(heap.clone(), heap.allocate_object(root));
    heap.set_prototype(first.get(), proto.get()).unwrap();
    heap.put(first.get(), &x, Value::ONE).unwrap();
    let shapes_before = heap.stats().shapes;

    for _ in 0..1000 {
        let obj = heap.allocate_object(root);
        heap.set_prototype(obj, proto.get()).unwrap();
        heap.put(obj, &x, Value::ONE).unwrap();
        assert_eq!(heap.shape_of(obj).unwrap(), heap.shape_of(first.get()).unwrap());
    }
    heap.collect();
    assert_eq!(heap.stats().shapes, shapes_before);
}
