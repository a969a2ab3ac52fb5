//! Integration tests for the heap, organized by feature
//!
//! These tests exercise the crate through the public API.
//!
//! ## Aggressive Test Defaults
//!
//! Tests use aggressive defaults to catch bugs early:
//! - `GC_THRESHOLD=1` - collect whenever the heap runs out of free cells
//!
//! Override via environment variables:
//!
//! ```bash
//! cargo test                           # Default: aggressive settings
//! GC_THRESHOLD=4000 cargo test         # Production trigger
//! GC_THRESHOLD=0 cargo test            # Disable automatic collection
//! ```

mod collector;
mod enumeration;
mod roots;
mod shapes;
mod values;

use jsheap::{Heap, IdentifierTable, ShapeId, TypeInfo, Value};

/// Create a heap with the test collection trigger.
pub fn create_test_heap() -> Heap {
    let heap = Heap::new();

    // Default to GC_THRESHOLD=1 (most aggressive) to catch GC bugs early
    let gc_threshold = std::env::var("GC_THRESHOLD")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1);
    heap.set_allocations_per_collection(gc_threshold);

    heap
}

/// A heap that only collects when asked.
pub fn create_manual_heap() -> Heap {
    let heap = Heap::new();
    heap.set_allocations_per_collection(0);
    heap
}

pub fn plain_shape(heap: &Heap) -> ShapeId {
    heap.create_shape(Value::NULL, TypeInfo::object())
}

pub fn names() -> IdentifierTable {
    IdentifierTable::new()
}
