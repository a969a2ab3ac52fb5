//! Immediates, boxed numbers and decoding

use jsheap::value::{MAX_IMMEDIATE_INT, MIN_IMMEDIATE_INT};
use jsheap::{DecodedValue, ImmediateKind, Value};

use super::{create_manual_heap, plain_shape};

#[test]
fn test_integers_round_trip_without_allocation() {
    let heap = create_manual_heap();
    let samples = [MIN_IMMEDIATE_INT, -1_000_000, -1, 0, 1, 42, 1 << 20, MAX_IMMEDIATE_INT];
    for i in samples {
        let value = heap.number(f64::from(i));
        assert!(value.is_immediate());
        assert_eq!(value.as_i32(), Some(i));
        assert_eq!(heap.decode(value), Some(DecodedValue::Integer(i)));
        assert_eq!(Value::from_i32(i), Some(value));
    }
    assert_eq!(heap.size(), 0);
}

#[test]
fn test_values_outside_the_immediate_range_are_boxed() {
    let heap = create_manual_heap();
    for d in [f64::from(MAX_IMMEDIATE_INT) + 1.0, 0.5, -0.0, f64::INFINITY, f64::NAN] {
        let value = heap.number(d);
        assert!(value.is_cell());
        match heap.decode(value) {
            Some(DecodedValue::Double(back)) => {
                assert!(back.to_bits() == d.to_bits(), "{} decoded as {}", d, back);
            }
            other => panic!("expected a double, got {:?}", other),
        }
    }
    assert_eq!(heap.stats().numbers.live_objects, 5);
    assert_eq!(heap.stats().primary.live_objects, 0);
}

#[test]
fn test_decode_distinguishes_every_variant() {
    let heap = create_manual_heap();
    let obj = heap.allocate_object(plain_shape(&heap));
    assert_eq!(heap.decode(Value::TRUE), Some(DecodedValue::Boolean(true)));
    assert_eq!(heap.decode(Value::FALSE), Some(DecodedValue::Boolean(false)));
    assert_eq!(heap.decode(Value::UNDEFINED), Some(DecodedValue::Undefined));
    assert_eq!(heap.decode(Value::NULL), Some(DecodedValue::Null));
    assert_eq!(heap.decode(obj), Some(DecodedValue::Cell(obj)));
    assert!(heap.is_object(obj));

    heap.collect();
    // a dead cell no longer decodes
    assert_eq!(heap.decode(obj), None);
}

#[test]
fn test_truthiness() {
    let heap = create_manual_heap();
    let obj = heap.allocate_object(plain_shape(&heap));
    assert!(heap.to_boolean(obj));
    assert!(heap.to_boolean(Value::ONE));
    assert!(!heap.to_boolean(Value::ZERO));
    assert!(!heap.to_boolean(Value::NULL));
    assert!(!heap.to_boolean(Value::UNDEFINED));
    assert!(!heap.to_boolean(heap.number(-0.0)));
    assert!(heap.to_boolean(heap.number(-0.5)));
}

#[test]
fn test_fast_paths_agree_with_slow_arithmetic() {
    let pairs = [(0, 0), (1, 2), (1000, 24), ((1 << 28) - 1, 1 << 28)];
    for (a, b) in pairs {
        let (va, vb) = (Value::from_i32(a).unwrap(), Value::from_i32(b).unwrap());
        assert!(va.can_do_fast_additive_operations() && vb.can_do_fast_additive_operations());
        assert_eq!(Value::add_immediate_numbers(va, vb).as_i32(), Some(a + b));
        assert_eq!(Value::sub_immediate_numbers(va, vb).as_i32(), Some(a - b));
        assert_eq!(Value::and_immediate_numbers(va, vb).as_i32(), Some(a & b));
        assert_eq!(Value::or_immediate_numbers(va, vb).as_i32(), Some(a | b));
        assert_eq!(Value::xor_immediate_numbers(va, vb).as_i32(), Some(a ^ b));
    }
    let negative = Value::from_i32(-1).unwrap();
    assert!(!negative.can_do_fast_additive_operations());
    assert!(!Value::from_i32(1 << 29).unwrap().can_do_fast_additive_operations());
    assert_eq!(negative.immediate_kind(), Some(ImmediateKind::Integer(-1)));
}

#[test]
fn test_equality_is_bitwise() {
    let heap = create_manual_heap();
    assert_eq!(Value::boolean(true), Value::TRUE);
    assert_eq!(heap.number(3.0), Value::from(3u8));
    let a = heap.number(0.5);
    let b = heap.number(0.5);
    // boxed doubles are distinct cells
    assert_ne!(a, b);
    assert_eq!(heap.to_number(a), heap.to_number(b));
}
