//! for-in name lists

use std::rc::Rc;

use jsheap::{Attributes, Identifier, Value};

use super::{create_manual_heap, names, plain_shape};

fn text(list: &[Identifier]) -> Vec<&str> {
    list.iter().map(Identifier::as_str).collect()
}

#[test]
fn test_insertion_order_is_kept() {
    let heap = create_manual_heap();
    let mut names = names();
    let obj = heap.allocate_object(plain_shape(&heap));
    heap.protect(obj);
    for n in ["a", "c", "b"] {
        heap.put(obj, &names.intern(n), Value::ONE).unwrap();
    }
    let list = heap.enumerable_property_names(obj).unwrap();
    assert_eq!(text(&list), ["a", "c", "b"]);
}

#[test]
fn test_hidden_and_shadowed_names() {
    let heap = create_manual_heap();
    let mut names = names();
    let proto = heap.allocate_object(plain_shape(&heap));
    heap.protect(proto);
    heap.put(proto, &names.intern("shared"), Value::ONE).unwrap();
    heap.put(proto, &names.intern("inherited"), Value::ONE).unwrap();
    heap.put_direct(proto, &names.intern("secret"), Value::ONE, Attributes::DONT_ENUM)
        .unwrap();

    let obj = heap.allocate_object(heap.create_shape(proto, jsheap::TypeInfo::object()));
    heap.protect(obj);
    heap.put(obj, &names.intern("own"), Value::ONE).unwrap();
    heap.put(obj, &names.intern("shared"), Value::ZERO).unwrap();
    heap.put_direct(obj, &names.intern("method"), Value::ONE, Attributes::DONT_ENUM | Attributes::FUNCTION)
        .unwrap();

    let list = heap.enumerable_property_names(obj).unwrap();
    assert_eq!(text(&list), ["own", "shared", "inherited"]);
}

#[test]
fn test_cache_reused_until_prototype_changes() {
    let heap = create_manual_heap();
    let mut names = names();
    let proto = heap.allocate_object(plain_shape(&heap));
    heap.protect(proto);
    let obj = heap.allocate_object(heap.create_shape(proto, jsheap::TypeInfo::object()));
    heap.protect(obj);
    heap.put(obj, &names.intern("x"), Value::ONE).unwrap();

    let first = heap.enumerable_property_names(obj).unwrap();
    let second = heap.enumerable_property_names(obj).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert!(heap.shapes().has_enumeration_cache(heap.shape_of(obj).unwrap()));

    heap.put(proto, &names.intern("late"), Value::ONE).unwrap();
    let third = heap.enumerable_property_names(obj).unwrap();
    assert!(!Rc::ptr_eq(&first, &third));
    assert_eq!(text(&third), ["x", "late"]);

    // a dictionary prototype is mutated in place and still invalidates
    heap.delete_property(proto, &names.intern("late")).unwrap();
    assert_eq!(text(&heap.enumerable_property_names(obj).unwrap()), ["x"]);
    heap.put(proto, &names.intern("again"), Value::ONE).unwrap();
    assert_eq!(text(&heap.enumerable_property_names(obj).unwrap()), ["x", "again"]);
}

#[test]
fn test_dictionary_cells_list_surviving_names() {
    let heap = create_manual_heap();
    let mut names = names();
    let obj = heap.allocate_object(plain_shape(&heap));
    heap.protect(obj);
    for n in ["a", "b", "c", "d"] {
        heap.put(obj, &names.intern(n), Value::ONE).unwrap();
    }
    heap.delete_property(obj, &names.intern("b")).unwrap();
    let list = heap.enumerable_property_names(obj).unwrap();
    assert_eq!(text(&list), ["a", "c", "d"]);
    let shape = heap.shape_of(obj).unwrap();
    assert!(!heap.shapes().has_enumeration_cache(shape));

    // a re-added name goes to the end
    heap.put(obj, &names.intern("b"), Value::ONE).unwrap();
    let list = heap.enumerable_property_names(obj).unwrap();
    assert_eq!(text(&list), ["a", "c", "d", "b"]);
}
