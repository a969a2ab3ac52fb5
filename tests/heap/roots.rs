//! Protected values, scoped references and thread stacks

use std::thread;

use jsheap::{ScopedReference, Value};

use super::{create_manual_heap, create_test_heap, names, plain_shape};

#[test]
fn test_scoped_reference_survives_gc_pressure() {
    let heap = create_test_heap();
    let mut names = names();
    let label = names.intern("label");
    let shape = plain_shape(&heap);

    let guarded = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    let boxed = heap.number(2.75);
    heap.put(guarded.get(), &label, boxed).unwrap();

    for _ in 0..20_000 {
        heap.allocate_object(shape);
    }
    heap.collect();

    assert!(heap.contains(guarded.get()));
    let label_value = heap.get(guarded.get(), &label).unwrap().unwrap();
    assert_eq!(heap.to_number(label_value), Some(2.75));
}

#[test]
fn test_scoped_reference_released_at_scope_exit() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let value = heap.allocate_object(shape);
    {
        let _guard = ScopedReference::new(heap.clone(), value);
        let _nested = ScopedReference::new(heap.clone(), value);
        heap.collect();
        assert_eq!(heap.protect_count(value), 2);
    }
    assert_eq!(heap.protect_count(value), 0);
    assert_eq!(heap.collect(), 1);
}

#[test]
fn test_protecting_immediates_is_a_no_op() {
    let heap = create_manual_heap();
    heap.protect(Value::ONE);
    heap.protect(Value::UNDEFINED);
    let _guard = ScopedReference::new(heap.clone(), Value::TRUE);
    assert_eq!(heap.protected_object_count(), 0);
    heap.unprotect(Value::ONE);
}

#[test]
fn test_registered_thread_stack_is_scanned() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let cell = heap.allocate_object(shape);

    let registration = heap.register_thread();
    assert_eq!(heap.registered_thread_count(), 1);
    let registration = thread::spawn(move || {
        registration.stack().push(cell);
        registration
    })
    .join()
    .unwrap();

    heap.collect();
    assert!(heap.contains(cell));

    drop(registration);
    assert_eq!(heap.registered_thread_count(), 0);
    heap.collect();
    assert!(!heap.contains(cell));
}

#[test]
fn test_shared_roots_from_another_thread() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let cell = heap.allocate_object(shape);
    assert!(heap.shared_roots().is_none());

    heap.protect(cell);
    heap.set_gc_protect_needs_locking();
    let shared = heap.shared_roots().unwrap();
    // protections taken before locking carry over
    assert_eq!(shared.protected_count(), 1);

    let remote = shared.clone();
    thread::spawn(move || {
        remote.protect(cell);
        let guard = ScopedReference::new(remote.clone(), cell);
        drop(guard);
    })
    .join()
    .unwrap();
    assert_eq!(heap.protect_count(cell), 2);

    heap.unprotect(cell);
    heap.collect();
    assert!(heap.contains(cell));
    shared.unprotect(cell);
    heap.collect();
    assert!(!heap.contains(cell));
}

#[test]
fn test_protected_counts_by_type() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let objects: Vec<_> = (0..3)
        .map(|_| ScopedReference::new(heap.clone(), heap.allocate_object(shape)))
        .collect();
    let number = ScopedReference::new(heap.clone(), heap.allocate_number(0.5));

    let counts = heap.protected_object_type_counts();
    assert_eq!(counts.get("Object"), Some(&objects.len()));
    assert_eq!(counts.get("Number"), Some(&1));
    assert_eq!(heap.stats().protected_values, 4);
    drop(number);
    assert_eq!(heap.protected_object_count(), 3);
}
