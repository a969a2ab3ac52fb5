//! Marking, sweeping and the allocation trigger

use std::cell::Cell;
use std::rc::Rc;

use jsheap::{
    Attributes, CellType, Heap, HeapConfig, HostObject, RootProvider, ScopedReference, Trace,
    Tracer, TypeFlags, TypeInfo, Value,
};

use super::{create_manual_heap, create_test_heap, names, plain_shape};

#[test]
fn test_second_collect_reclaims_nothing() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let kept = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    for _ in 0..50 {
        heap.allocate_object(shape);
        heap.allocate_number(0.5);
    }

    assert_eq!(heap.collect(), 100);
    let after_first = heap.stats();
    assert_eq!(heap.collect(), 0);
    let after_second = heap.stats();
    assert_eq!(after_first.primary.live_objects, after_second.primary.live_objects);
    assert_eq!(after_first.numbers.live_objects, after_second.numbers.live_objects);
    assert!(heap.contains(kept.get()));
}

#[test]
fn test_unreachable_chain_is_reclaimed() {
    let heap = create_manual_heap();
    let mut names = names();
    let next = names.intern("next");
    let shape = plain_shape(&heap);

    let head = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    let mut tail = head.get();
    for _ in 0..100 {
        let node = heap.allocate_object(shape);
        heap.put(tail, &next, node).unwrap();
        tail = node;
    }
    assert_eq!(heap.collect(), 0);
    assert_eq!(heap.size(), 101);

    drop(head);
    assert_eq!(heap.collect(), 101);
    assert_eq!(heap.size(), 0);
}

#[test]
fn test_cycles_are_reclaimed() {
    let heap = create_manual_heap();
    let mut names = names();
    let other = names.intern("other");
    let shape = plain_shape(&heap);
    let a = heap.allocate_object(shape);
    let b = heap.allocate_object(shape);
    heap.put(a, &other, b).unwrap();
    heap.put(b, &other, a).unwrap();

    heap.protect(a);
    assert_eq!(heap.collect(), 0);
    heap.unprotect(a);
    assert_eq!(heap.collect(), 2);
}

#[test]
fn test_graph_survives_gc_pressure() {
    let heap = create_test_heap();
    let mut names = names();
    let (next, payload) = (names.intern("next"), names.intern("payload"));
    let shape = plain_shape(&heap);

    let head = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    let mut tail = ScopedReference::new(heap.clone(), head.get());
    for i in 0..5_000u32 {
        let node = heap.allocate_object(shape);
        heap.put(tail.get(), &next, node).unwrap();
        tail.set(node);
        let boxed = heap.number(f64::from(i) + 0.5);
        heap.put(node, &payload, boxed).unwrap();
        // garbage interleaved with the live list
        heap.allocate_object(shape);
        heap.allocate_number(-1.5);
    }

    heap.collect();
    let mut node = heap.get(head.get(), &next).unwrap();
    let mut count = 0u32;
    while let Some(current) = node {
        let boxed = heap.get(current, &payload).unwrap().unwrap();
        assert_eq!(heap.to_number(boxed), Some(f64::from(count) + 0.5));
        count += 1;
        node = heap.get(current, &next).unwrap();
    }
    assert_eq!(count, 5_000);
}

#[test]
fn test_conservative_scan_retains_coincidental_words() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let cell = heap.allocate_object(shape);
    let number = heap.allocate_number(6.25);
    let unrelated = heap.allocate_object(shape);

    {
        let frame = heap.stack().frame();
        // A word that is not a value but happens to equal a cell address
        frame.push(Value::from_raw(cell.raw()));
        frame.push(Value::from_raw(number.raw()));
        // Interior, misaligned and foreign words are ignored
        frame.push(Value::from_raw(unrelated.raw() + 4));
        frame.push(Value::from_raw(unrelated.raw() + 1));
        frame.push(Value::from_raw(0xdead_bee0));
        frame.push(Value::from_raw(usize::MAX & !3));

        assert_eq!(heap.collect(), 1);
        assert!(heap.contains(cell));
        assert!(heap.contains(number));
        assert!(!heap.contains(unrelated));
        assert!(heap.is_cell_marked(cell));
    }

    heap.collect();
    assert!(!heap.contains(cell));
    assert!(!heap.contains(number));
}

struct Words(Vec<usize>);

impl RootProvider for Words {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        for &word in &self.0 {
            visitor(Value::from_raw(word));
        }
    }
}

#[test]
fn test_root_provider_words_are_scanned() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let cell = heap.allocate_object(shape);
    let provider: Rc<dyn RootProvider> = Rc::new(Words(vec![cell.raw(), 12345]));
    heap.add_root_provider(&provider);

    heap.collect();
    assert!(heap.contains(cell));
    drop(provider);
    heap.collect();
    assert!(!heap.contains(cell));
}

#[test]
fn test_empty_blocks_are_released() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    for _ in 0..20_000 {
        heap.allocate_object(shape);
    }
    let before = heap.stats().primary.blocks;
    assert!(before > 3);

    heap.collect();
    let spare = heap.config().spare_empty_blocks;
    assert_eq!(heap.stats().primary.blocks, spare);
    assert_eq!(heap.size(), 0);
}

#[test]
fn test_allocation_trigger_bounds_growth() {
    let heap = create_manual_heap();
    heap.set_allocations_per_collection(1);
    let shape = plain_shape(&heap);
    for _ in 0..50_000 {
        heap.allocate_object(shape);
    }
    let stats = heap.stats();
    assert!(stats.collections > 0);
    assert!(stats.primary.blocks <= 2, "{:?}", stats.primary);
}

#[test]
fn test_extra_cost_brings_collection_forward() {
    let heap = create_manual_heap();
    heap.set_allocations_per_collection(10);
    let shape = plain_shape(&heap);
    let kept = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
    assert_eq!(heap.stats().collections, 0);

    heap.report_extra_memory_cost(1 << 20);
    heap.allocate_object(shape);
    let stats = heap.stats();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.extra_cost, 0);
    assert!(heap.contains(kept.get()));
}

#[test]
fn test_heap_reports_config() {
    let config = HeapConfig::from_json(r#"{ "allocations_per_collection": 0, "spare_empty_blocks": 0 }"#)
        .unwrap();
    let heap = Heap::with_config(config).unwrap();
    let shape = plain_shape(&heap);
    heap.allocate_object(shape);
    heap.collect();
    assert_eq!(heap.stats().primary.blocks, 0);
}

#[test]
#[should_panic(expected = "block reservation exhausted")]
fn test_block_reservation_exhaustion_is_fatal() {
    let mut config = HeapConfig::default();
    config.allocations_per_collection = 0;
    config.max_blocks = 1;
    let heap = Heap::with_config(config).unwrap();
    let shape = plain_shape(&heap);
    heap.allocate_number(0.5);
    for _ in 0..100_000 {
        heap.allocate_object(shape);
    }
}

struct Reentrant(Heap);

impl Trace for Reentrant {
    fn trace(&self, _tracer: &mut Tracer<'_>) {
        let shape = plain_shape(&self.0);
        self.0.allocate_object(shape);
    }
}

impl HostObject for Reentrant {
    fn class_name(&self) -> &'static str {
        "Reentrant"
    }
}

#[test]
#[should_panic(expected = "re-entered")]
fn test_allocation_during_collection_is_fatal() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let cell = heap.allocate_object(shape);
    heap.set_host_object(cell, Box::new(Reentrant(heap.clone())))
        .unwrap();
    heap.protect(cell);
    heap.collect();
}

struct Holder {
    held: Value,
    dropped: Rc<Cell<u32>>,
}

impl Trace for Holder {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.mark(self.held);
    }
}

impl HostObject for Holder {
    fn class_name(&self) -> &'static str {
        "Holder"
    }
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.dropped.set(self.dropped.get() + 1);
    }
}

#[test]
fn test_host_references_are_traced() {
    let heap = create_manual_heap();
    let shape = plain_shape(&heap);
    let dropped = Rc::new(Cell::new(0));
    let owner = heap.allocate_object(shape);
    let held = heap.allocate_number(9.75);
    heap.set_host_object(
        owner,
        Box::new(Holder {
            held,
            dropped: dropped.clone(),
        }),
    )
    .unwrap();

    heap.protect(owner);
    heap.collect();
    assert!(heap.contains(held));
    assert_eq!(dropped.get(), 0);

    heap.unprotect(owner);
    assert_eq!(heap.collect(), 2);
    assert_eq!(dropped.get(), 1);
}

#[test]
fn test_global_object_accounting() {
    let heap = create_manual_heap();
    let mut names = names();
    let global_shape = heap.create_shape(
        Value::NULL,
        TypeInfo::new(CellType::GlobalObject, TypeFlags::empty()),
    );
    let global = ScopedReference::new(heap.clone(), heap.allocate_object(global_shape));
    let builtin = heap.allocate_object(plain_shape(&heap));
    heap.put_direct(global.get(), &names.intern("Object"), builtin, Attributes::DONT_ENUM)
        .unwrap();

    heap.collect();
    assert_eq!(heap.global_object_count(), 1);
    assert_eq!(heap.protected_global_object_count(), 1);
    assert_eq!(heap.protected_object_count(), 1);
    assert!(heap.contains(builtin));
}
