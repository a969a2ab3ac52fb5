#![no_main]

use jsheap::{Heap, IdentifierTable, TypeInfo, Value};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Smaller limit for the heap (collections are expensive per byte)
    if data.len() > 2_048 {
        return;
    }

    let heap = Heap::new();
    heap.set_allocations_per_collection(1);
    let mut names = IdentifierTable::new();
    let keys: Vec<_> = (0..8).map(|i| names.intern(&format!("k{}", i))).collect();
    let shape = heap.create_shape(Value::NULL, TypeInfo::object());

    // Every rooted object stays on the heap's own stack
    let frame = heap.stack().frame();
    let mut rooted: Vec<Value> = Vec::new();

    for chunk in data.chunks(2) {
        let [op, arg] = [chunk[0], *chunk.get(1).unwrap_or(&0)];
        let target = rooted.get(usize::from(arg) % rooted.len().max(1)).copied();
        let key = &keys[usize::from(arg & 7)];
        match (op % 6, target) {
            (0, _) | (_, None) => {
                let obj = heap.allocate_object(shape);
                frame.push(obj);
                rooted.push(obj);
            }
            (1, Some(obj)) => {
                let boxed = heap.number(f64::from(arg) + 0.5);
                heap.put(obj, key, boxed).unwrap();
            }
            (2, Some(obj)) => {
                let other = rooted[usize::from(op) % rooted.len()];
                heap.put(obj, key, other).unwrap();
            }
            (3, Some(obj)) => {
                heap.delete_property(obj, key).unwrap();
            }
            (4, Some(obj)) => {
                let _ = heap.enumerable_property_names(obj).unwrap();
                heap.flatten_dictionary(obj).unwrap();
            }
            _ => {
                heap.collect();
            }
        }
    }

    heap.collect();
    for &obj in &rooted {
        assert!(heap.contains(obj));
        for key in &keys {
            if let Some(value) = heap.get_direct(obj, key).unwrap() {
                assert!(value.is_immediate() || heap.contains(value));
            }
        }
    }
});
