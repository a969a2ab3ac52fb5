//! Conservative mark-sweep heap.
//!
//! Cells live in two pools of aligned blocks: the primary pool holds
//! [`ObjectCell`]s and the number pool holds boxed doubles. Collection marks
//! from the root set (protected values, registered stacks and root
//! providers), treating any word that names a live slot as a reference, then
//! traces object cells through their shape's prototype, their storage and
//! their host payload.
//!
//! Key design:
//! - A cell's pool and block are recovered from its address alone
//! - Mark bits live in the block header and are cleared when the next
//!   collection starts, so survivors read as marked in between
//! - Dead cells with host payloads are dropped after the heap borrow is
//!   released, so a payload's `Drop` may use the heap
//! - Allocating or collecting while already doing either is fatal

pub mod block;
mod object;
pub mod roots;
pub mod scoped;

use std::cell::{Ref, RefCell, RefMut};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;

use crate::cell::{NumberCell, ObjectCell, Tracer};
use crate::config::HeapConfig;
use crate::error::{HeapError, fatal};
use crate::shape::{CellType, ShapeArena, ShapeId, TypeInfo};
use crate::value::{ImmediateKind, Value};

use block::{CELL_SIZE, CollectorHeap, HeapType, NumberHeap, PrimaryHeap};
use roots::{MachineStack, RootProvider, RootSet, SharedRoots, ThreadRegistration};

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationInProgress {
    Idle,
    Allocating,
    Collecting,
}

/// Fully classified value. See [`Heap::decode`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedValue {
    Integer(i32),
    Boolean(bool),
    Undefined,
    Null,
    Double(f64),
    /// A live object cell.
    Cell(Value),
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    pub blocks: usize,
    /// Total slots across all blocks
    pub capacity: usize,
    pub live_objects: usize,
    pub live_at_last_collect: usize,
}

impl PoolStatistics {
    fn of<C, const N: usize>(pool: &CollectorHeap<C, N>) -> Self {
        Self {
            blocks: pool.block_count(),
            capacity: pool.capacity(),
            live_objects: pool.live_objects(),
            live_at_last_collect: pool.live_at_last_collect(),
        }
    }
}

/// Statistics about the heap
#[derive(Debug, Clone, Default)]
pub struct HeapStatistics {
    pub primary: PoolStatistics,
    pub numbers: PoolStatistics,
    /// Live shape records, shared and dictionary
    pub shapes: usize,
    pub dictionary_shapes: usize,
    /// Distinct protected values
    pub protected_values: usize,
    /// Virtual cells reported since the last collection
    pub extra_cost: usize,
    pub collections: usize,
}

// ============================================================================
// Space - the heap state behind the RefCell
// ============================================================================

struct Space {
    id: u32,
    config: HeapConfig,
    shapes: ShapeArena,
    primary: PrimaryHeap,
    numbers: NumberHeap,
    extra_cost: usize,
    operation: OperationInProgress,
    /// Persistent mark stack, reused between cycles.
    mark_stack: Vec<Value>,
    collections: usize,
}

fn primary_pool(space: &mut Space) -> &mut PrimaryHeap {
    &mut space.primary
}

fn number_pool(space: &mut Space) -> &mut NumberHeap {
    &mut space.numbers
}

impl Space {
    fn new(config: HeapConfig) -> Self {
        let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            shapes: ShapeArena::new(config.shapes.clone()),
            primary: PrimaryHeap::new(HeapType::Primary, id),
            numbers: NumberHeap::new(HeapType::Number, id),
            config,
            extra_cost: 0,
            operation: OperationInProgress::Idle,
            mark_stack: Vec::new(),
            collections: 0,
        }
    }

    fn begin(&mut self, operation: OperationInProgress) {
        if self.operation != OperationInProgress::Idle {
            fatal("heap re-entered during allocation or collection");
        }
        self.operation = operation;
    }

    fn end(&mut self) {
        self.operation = OperationInProgress::Idle;
    }

    /// Charge `cost` bytes held outside the cell blocks. Small costs are
    /// ignored.
    fn add_extra_cost(&mut self, cost: usize) {
        if cost > self.config.min_extra_cost {
            self.extra_cost += cost / (CELL_SIZE * 2);
        }
    }

    fn should_collect(&self) -> bool {
        let per_collection = self.config.allocations_per_collection;
        if per_collection == 0 {
            return false;
        }
        let new_cost = self.primary.new_objects() + self.numbers.new_objects() + self.extra_cost;
        let live = self.primary.live_at_last_collect() + self.numbers.live_at_last_collect();
        new_cost >= per_collection && new_cost >= live
    }

    /// Find a free slot in `pool`, collecting or growing as needed.
    /// `pending_root` is kept alive across any collection this triggers.
    fn take_slot<C, const N: usize>(
        &mut self,
        pool: fn(&mut Space) -> &mut CollectorHeap<C, N>,
        roots: &RootSet,
        pending_root: Value,
        graveyard: &mut Vec<ObjectCell>,
    ) -> NonNull<C> {
        let mut collected = false;
        if self.config.allocations_per_collection != 0
            && self.extra_cost > self.config.allocations_per_collection
            && self.should_collect()
        {
            self.collect_during_allocation(roots, pending_root, graveyard);
            collected = true;
        }
        loop {
            if let Some(slot) = pool(self).take_free_slot() {
                return slot;
            }
            if !collected && self.should_collect() {
                self.collect_during_allocation(roots, pending_root, graveyard);
                collected = true;
                continue;
            }
            let max_blocks = self.config.max_blocks;
            let pool = pool(self);
            if pool.block_count() >= max_blocks {
                fatal("heap block reservation exhausted");
            }
            pool.grow();
        }
    }

    fn collect_during_allocation(
        &mut self,
        roots: &RootSet,
        pending_root: Value,
        graveyard: &mut Vec<ObjectCell>,
    ) {
        self.operation = OperationInProgress::Collecting;
        self.collect(roots, &[pending_root], graveyard);
        self.operation = OperationInProgress::Allocating;
    }

    fn collect(&mut self, roots: &RootSet, extra_roots: &[Value], graveyard: &mut Vec<ObjectCell>) -> usize {
        debug_assert_eq!(self.operation, OperationInProgress::Collecting);
        self.mark(roots, extra_roots);
        let freed = self.sweep(graveyard);
        self.extra_cost = 0;
        self.collections += 1;
        log::debug!(
            "heap {} collection #{}: freed {} cells, {} objects and {} numbers live",
            self.id,
            self.collections,
            freed,
            self.primary.live_objects(),
            self.numbers.live_objects()
        );
        freed
    }

    fn mark(&mut self, roots: &RootSet, extra_roots: &[Value]) {
        self.primary.clear_marks();
        self.numbers.clear_marks();

        let mut pending = std::mem::take(&mut self.mark_stack);
        pending.clear();
        roots.visit(&mut |word| {
            if word.is_cell() {
                pending.push(word);
            }
        });
        pending.extend(extra_roots.iter().copied().filter(|v| v.is_cell()));

        while let Some(value) = pending.pop() {
            let address = value.raw();
            if let Some(cell) = self.primary.mark(address) {
                // SAFETY: `mark` only returns live cells, and nothing else
                // touches cell bodies while the space is borrowed.
                let cell = unsafe { cell.as_ref() };
                cell.visit_children(&self.shapes, &mut Tracer::new(&mut pending));
            } else {
                self.numbers.mark(address);
            }
        }
        self.mark_stack = pending;
    }

    fn sweep(&mut self, graveyard: &mut Vec<ObjectCell>) -> usize {
        let spare = self.config.spare_empty_blocks;
        let numbers = self.numbers.sweep(spare, |_| {});
        let shapes = &mut self.shapes;
        let primary = self.primary.sweep(spare, |cell| {
            shapes.release(cell.shape);
            if cell.host.is_some() {
                graveyard.push(cell);
            }
        });
        let live = &self.primary;
        self.shapes
            .forget_dead_prototypes(|prototype| live.cell_at(prototype.raw()).is_some());
        numbers.freed + primary.freed
    }

    fn object(&self, value: Value) -> Result<&ObjectCell, HeapError> {
        if !value.is_cell() {
            return Err(HeapError::NotAnObject);
        }
        let cell = self.primary.cell_at(value.raw()).ok_or(HeapError::NotAnObject)?;
        // SAFETY: live slots hold initialised cells; the space borrow is
        // held for the lifetime of the reference.
        Ok(unsafe { cell.as_ref() })
    }

    fn number_value(&self, value: Value) -> Option<f64> {
        if !value.is_cell() {
            return None;
        }
        let cell = self.numbers.cell_at(value.raw())?;
        // SAFETY: as in `object`.
        Some(unsafe { cell.as_ref() }.value)
    }
}

/// The live object cell `value`, borrowed from its pool.
fn object_mut(primary: &mut PrimaryHeap, value: Value) -> Result<&mut ObjectCell, HeapError> {
    if !value.is_cell() {
        return Err(HeapError::NotAnObject);
    }
    let mut cell = primary.cell_at(value.raw()).ok_or(HeapError::NotAnObject)?;
    // SAFETY: live slots hold initialised cells; the exclusive pool borrow is
    // held for the lifetime of the reference.
    Ok(unsafe { cell.as_mut() })
}

// ============================================================================
// Heap - the public handle
// ============================================================================

/// Handle to a garbage-collected heap. Cloning yields another handle to the
/// same heap.
///
/// A heap belongs to the thread that created it. Other threads contribute
/// roots through [`Heap::register_thread`] and [`Heap::shared_roots`].
pub struct Heap {
    inner: Rc<RefCell<Space>>,
    roots: Rc<RootSet>,
}

impl Heap {
    pub fn new() -> Self {
        Self::from_space(Space::new(HeapConfig::default()))
    }

    pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        Ok(Self::from_space(Space::new(config)))
    }

    fn from_space(space: Space) -> Self {
        log::debug!("heap {} created", space.id);
        Heap {
            inner: Rc::new(RefCell::new(space)),
            roots: Rc::new(RootSet::new()),
        }
    }

    fn space(&self) -> Ref<'_, Space> {
        match self.inner.try_borrow() {
            Ok(space) => space,
            Err(_) => fatal("heap accessed during allocation or collection"),
        }
    }

    fn space_mut(&self) -> RefMut<'_, Space> {
        match self.inner.try_borrow_mut() {
            Ok(space) => space,
            Err(_) => fatal("heap re-entered during allocation or collection"),
        }
    }

    pub fn config(&self) -> HeapConfig {
        self.space().config.clone()
    }

    /// Set the collection trigger (0 = disable automatic collection)
    pub fn set_allocations_per_collection(&self, allocations: usize) {
        self.space_mut().config.allocations_per_collection = allocations;
    }

    /// True while an allocation or collection is running.
    pub fn is_busy(&self) -> bool {
        self.inner
            .try_borrow()
            .map_or(true, |space| space.operation != OperationInProgress::Idle)
    }

    // ── Shapes ─────────────────────────────────────────────────────

    pub fn create_shape(&self, prototype: Value, type_info: TypeInfo) -> ShapeId {
        self.space_mut().shapes.create(prototype, type_info)
    }

    pub fn shapes(&self) -> Ref<'_, ShapeArena> {
        Ref::map(self.space(), |space| &space.shapes)
    }

    pub fn shapes_mut(&self) -> RefMut<'_, ShapeArena> {
        RefMut::map(self.space_mut(), |space| &mut space.shapes)
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocate an object cell of `shape` with every slot undefined.
    ///
    /// A dictionary shape is copied, since a dictionary has a single owner.
    /// May collect first; the shape's prototype survives that collection.
    ///
    /// `shape` must be live. A dictionary id taken from a cell that has
    /// since died or transitioned away is stale, and using it is fatal.
    /// Check with [`ShapeArena::contains`] when in doubt.
    pub fn allocate_object(&self, shape: ShapeId) -> Value {
        let mut graveyard = Vec::new();
        let value = {
            let mut guard = self.space_mut();
            let space = &mut *guard;
            space.begin(OperationInProgress::Allocating);
            let shape = if space.shapes.is_dictionary(shape) {
                space.shapes.duplicate_dictionary(shape)
            } else {
                shape
            };
            let prototype = space.shapes.prototype(shape);
            let storage_size = space.shapes.storage_size(shape);
            let slot = space.take_slot(primary_pool, &self.roots, prototype, &mut graveyard);
            // SAFETY: a slot fresh off the free list is ours to initialise.
            unsafe { slot.as_ptr().write(ObjectCell::new(shape, storage_size)) };
            space.end();
            Value::from_cell_address(slot.as_ptr() as usize)
        };
        drop(graveyard);
        value
    }

    /// Box `value` in the number pool, whether or not it has an immediate
    /// form. Use [`Heap::number`] to prefer the immediate.
    pub fn allocate_number(&self, value: f64) -> Value {
        let mut graveyard = Vec::new();
        let result = {
            let mut guard = self.space_mut();
            let space = &mut *guard;
            space.begin(OperationInProgress::Allocating);
            let slot = space.take_slot(number_pool, &self.roots, Value::UNDEFINED, &mut graveyard);
            // SAFETY: as in `allocate_object`.
            unsafe { slot.as_ptr().write(NumberCell { value }) };
            space.end();
            Value::from_cell_address(slot.as_ptr() as usize)
        };
        drop(graveyard);
        result
    }

    /// `value` as an immediate integer when exact, otherwise boxed.
    pub fn number(&self, value: f64) -> Value {
        Value::from_f64(value).unwrap_or_else(|| self.allocate_number(value))
    }

    // ── Value inspection ───────────────────────────────────────────

    /// Classify `value`. `None` for a word that is neither an immediate nor
    /// a live cell of this heap.
    pub fn decode(&self, value: Value) -> Option<DecodedValue> {
        if let Some(kind) = value.immediate_kind() {
            return Some(match kind {
                ImmediateKind::Integer(i) => DecodedValue::Integer(i),
                ImmediateKind::Boolean(b) => DecodedValue::Boolean(b),
                ImmediateKind::Undefined => DecodedValue::Undefined,
                ImmediateKind::Null => DecodedValue::Null,
            });
        }
        let space = self.space();
        if let Some(number) = space.number_value(value) {
            return Some(DecodedValue::Double(number));
        }
        space.object(value).ok().map(|_| DecodedValue::Cell(value))
    }

    /// Numeric value of an immediate or boxed number. Objects yield `None`.
    pub fn to_number(&self, value: Value) -> Option<f64> {
        if value.is_immediate() {
            return value.to_f64();
        }
        self.space().number_value(value)
    }

    pub fn to_boolean(&self, value: Value) -> bool {
        if value.is_immediate() {
            return value.to_boolean();
        }
        match self.space().number_value(value) {
            Some(number) => number != 0.0 && !number.is_nan(),
            None => true,
        }
    }

    pub fn is_object(&self, value: Value) -> bool {
        self.space().object(value).is_ok()
    }

    // ── Collection ─────────────────────────────────────────────────

    /// Run a full collection. Returns the number of cells reclaimed.
    pub fn collect(&self) -> usize {
        let mut graveyard = Vec::new();
        let freed = {
            let mut space = self.space_mut();
            space.begin(OperationInProgress::Collecting);
            let freed = space.collect(&self.roots, &[], &mut graveyard);
            space.end();
            freed
        };
        // Host payloads may use the heap in Drop.
        drop(graveyard);
        freed
    }

    /// Account for memory held outside the heap on behalf of cells. Large
    /// costs bring the next collection forward.
    pub fn report_extra_memory_cost(&self, cost: usize) {
        self.space_mut().add_extra_cost(cost);
    }

    // ── Roots ──────────────────────────────────────────────────────

    /// Keep `value` alive until a matching [`Heap::unprotect`].
    /// Immediates are ignored.
    pub fn protect(&self, value: Value) {
        self.roots.protect(value);
    }

    pub fn unprotect(&self, value: Value) {
        self.roots.unprotect(value);
    }

    /// Put the protected set behind a lock so other threads can use
    /// [`Heap::shared_roots`]. Cannot be undone.
    pub fn set_gc_protect_needs_locking(&self) {
        self.roots.enable_locking();
    }

    /// Thread-safe protect handle, once locking is enabled.
    pub fn shared_roots(&self) -> Option<SharedRoots> {
        self.roots.shared()
    }

    /// The owning thread's scanned word range.
    pub fn stack(&self) -> &MachineStack {
        self.roots.stack()
    }

    /// A word range for another thread, scanned until the registration is
    /// dropped.
    pub fn register_thread(&self) -> ThreadRegistration {
        self.roots.register_thread()
    }

    /// Scan `provider` on every collection while it is alive. Held weakly.
    pub fn add_root_provider(&self, provider: &Rc<dyn RootProvider>) {
        self.roots.add_provider(provider);
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn stats(&self) -> HeapStatistics {
        let space = self.space();
        HeapStatistics {
            primary: PoolStatistics::of(&space.primary),
            numbers: PoolStatistics::of(&space.numbers),
            shapes: space.shapes.len(),
            dictionary_shapes: space.shapes.dictionary_count(),
            protected_values: self.roots.protected_values().len(),
            extra_cost: space.extra_cost,
            collections: space.collections,
        }
    }

    /// Live cells in both pools.
    pub fn size(&self) -> usize {
        let space = self.space();
        space.primary.live_objects() + space.numbers.live_objects()
    }

    /// Whether `value` is a live cell of this heap.
    pub fn contains(&self, value: Value) -> bool {
        if !value.is_cell() {
            return false;
        }
        let space = self.space();
        space.primary.cell_at(value.raw()).is_some() || space.numbers.cell_at(value.raw()).is_some()
    }

    /// Whether `value` was marked by the most recent collection.
    pub fn is_cell_marked(&self, value: Value) -> bool {
        if !value.is_cell() {
            return false;
        }
        let space = self.space();
        space.primary.is_marked(value.raw()) || space.numbers.is_marked(value.raw())
    }

    pub fn protected_object_count(&self) -> usize {
        self.roots.protected_values().len()
    }

    /// Protections held on `value`.
    pub fn protect_count(&self, value: Value) -> usize {
        self.roots.protect_count(value)
    }

    pub fn global_object_count(&self) -> usize {
        let space = self.space();
        let mut count = 0;
        space.primary.for_each_live(|cell| {
            if space.shapes.type_info(cell.shape).cell_type == CellType::GlobalObject {
                count += 1;
            }
        });
        count
    }

    pub fn protected_global_object_count(&self) -> usize {
        let space = self.space();
        self.roots
            .protected_values()
            .into_iter()
            .filter_map(|value| space.object(value).ok())
            .filter(|cell| space.shapes.type_info(cell.shape).cell_type == CellType::GlobalObject)
            .count()
    }

    /// Protected values grouped by class name.
    pub fn protected_object_type_counts(&self) -> FxHashMap<&'static str, usize> {
        let space = self.space();
        let mut counts = FxHashMap::default();
        for value in self.roots.protected_values() {
            let name = match space.object(value) {
                Ok(cell) => cell.class_name(&space.shapes),
                Err(_) if space.number_value(value).is_some() => "Number",
                Err(_) => continue,
            };
            *counts.entry(name).or_insert(0) += 1;
        }
        counts
    }

    /// Live [`ThreadRegistration`]s.
    pub fn registered_thread_count(&self) -> usize {
        self.roots.registered_threads()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Heap {
    fn clone(&self) -> Self {
        Heap {
            inner: self.inner.clone(),
            roots: self.roots.clone(),
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(space) => f
                .debug_struct("Heap")
                .field("id", &space.id)
                .field("live", &(space.primary.live_objects() + space.numbers.live_objects()))
                .finish(),
            Err(_) => f.write_str("Heap { <busy> }"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
