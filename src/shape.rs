//! Shapes (hidden classes) and the transition graph.
//!
//! Cells with the same prototype that received the same properties in the
//! same order share a shape. A shape owns the [`PropertyTable`] mapping
//! names to storage offsets, so cells carry only their slot array.
//!
//! Shared shapes are immutable once created, apart from growing their
//! transition map, and live as long as the arena. A shape leaves the shared
//! graph by becoming a *dictionary*: a private record owned by exactly one
//! cell that is mutated in place and released when its owner dies or
//! transitions back with [`ShapeArena::from_dictionary_transition`].

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::config::ShapeConfig;
use crate::enumeration::EnumerationCache;
use crate::error::{HeapError, fatal};
use crate::identifier::Identifier;
use crate::property_table::{Attributes, PropertyEntry, PropertyStorage, PropertyTable};
use crate::value::{CheapClone, Value};

/// Handle to a shape record in a [`ShapeArena`].
///
/// Dictionary records are freed when their owner dies and their slot is
/// reused. The generation changes on every release, so an id kept past its
/// record no longer resolves: [`ShapeArena::contains`] reports false and any
/// other query on it is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct ShapeId {
    index: u32,
    generation: u32,
}

impl ShapeId {
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Stored in the cached-transition-offset word when there is none.
pub const NOT_FOUND_OFFSET: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Object,
    GlobalObject,
    Function,
    Array,
    Host,
}

impl CellType {
    pub fn name(self) -> &'static str {
        match self {
            CellType::Object => "Object",
            CellType::GlobalObject => "GlobalObject",
            CellType::Function => "Function",
            CellType::Array => "Array",
            CellType::Host => "Host",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u8 {
        const MASQUERADES_AS_UNDEFINED = 1 << 0;
        const IMPLEMENTS_HAS_INSTANCE = 1 << 1;
        const OVERRIDES_HAS_INSTANCE = 1 << 2;
        const NEEDS_THIS_CONVERSION = 1 << 3;
    }
}

/// Type facts shared by every cell of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub cell_type: CellType,
    pub flags: TypeFlags,
}

impl TypeInfo {
    pub const fn new(cell_type: CellType, flags: TypeFlags) -> Self {
        Self { cell_type, flags }
    }

    pub const fn object() -> Self {
        Self::new(CellType::Object, TypeFlags::empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeLayout {
    Shared,
    Dictionary,
}

/// Result of [`ShapeArena::add_property_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub shape: ShapeId,
    /// Storage offset of the added property.
    pub offset: usize,
}

/// Edge label in a shape's transition map.
#[derive(Clone, PartialEq, Eq, Hash)]
enum TransitionKey {
    Property(Identifier, Attributes),
    Prototype(Value),
    GetterSetter,
}

#[derive(Clone)]
struct AddedProperty {
    name: Identifier,
    attributes: Attributes,
    offset: usize,
}

#[repr(C)]
pub(crate) struct ShapeRecord {
    /// Offset of the property added by the edge into this shape, or
    /// [`NOT_FOUND_OFFSET`]. First field so compiled code can read it.
    pub(crate) cached_transition_offset: usize,
    prototype: Value,
    type_info: TypeInfo,
    layout: ShapeLayout,
    previous: Option<ShapeId>,
    added: Option<AddedProperty>,
    transition_count: usize,
    transitions: FxHashMap<TransitionKey, ShapeId>,
    table: PropertyTable,
    has_getter_setter: bool,
    stamp: u64,
    pub(crate) enumeration_cache: Option<EnumerationCache>,
}

impl ShapeRecord {
    fn is_dictionary(&self) -> bool {
        self.layout == ShapeLayout::Dictionary
    }

    /// A shared copy of `self` reached by a non-addition edge.
    fn derived(&self, from: ShapeId, stamp: u64) -> ShapeRecord {
        ShapeRecord {
            cached_transition_offset: NOT_FOUND_OFFSET,
            prototype: self.prototype,
            type_info: self.type_info,
            layout: ShapeLayout::Shared,
            previous: Some(from),
            added: None,
            transition_count: self.transition_count + 1,
            transitions: FxHashMap::default(),
            table: self.table.clone(),
            has_getter_setter: self.has_getter_setter,
            stamp,
            enumeration_cache: None,
        }
    }
}

/// Owner of all shape records.
pub struct ShapeArena {
    records: Vec<Option<ShapeRecord>>,
    /// Current generation of each record slot.
    generations: Vec<u32>,
    free: Vec<u32>,
    /// Roots used when flattening dictionaries, so flattened cells share.
    flatten_roots: FxHashMap<(Value, TypeInfo), ShapeId>,
    config: ShapeConfig,
    last_stamp: u64,
}

impl ShapeArena {
    pub fn new(config: ShapeConfig) -> Self {
        Self {
            records: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            flatten_roots: FxHashMap::default(),
            config,
            last_stamp: 0,
        }
    }

    pub fn config(&self) -> &ShapeConfig {
        &self.config
    }

    /// Live records, shared and dictionary.
    pub fn len(&self) -> usize {
        self.records.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dictionary_count(&self) -> usize {
        self.records
            .iter()
            .flatten()
            .filter(|r| r.is_dictionary())
            .count()
    }

    fn next_stamp(&mut self) -> u64 {
        self.last_stamp += 1;
        self.last_stamp
    }

    fn is_current(&self, id: ShapeId) -> bool {
        self.generations.get(id.index as usize) == Some(&id.generation)
    }

    fn lookup(&self, id: ShapeId) -> Option<&ShapeRecord> {
        if !self.is_current(id) {
            return None;
        }
        self.records.get(id.index as usize).and_then(Option::as_ref)
    }

    pub(crate) fn record(&self, id: ShapeId) -> &ShapeRecord {
        match self.lookup(id) {
            Some(record) => record,
            None => fatal("dangling shape id"),
        }
    }

    fn record_mut(&mut self, id: ShapeId) -> &mut ShapeRecord {
        if !self.is_current(id) {
            fatal("dangling shape id");
        }
        match self.records.get_mut(id.index as usize).and_then(Option::as_mut) {
            Some(record) => record,
            None => fatal("dangling shape id"),
        }
    }

    fn insert(&mut self, record: ShapeRecord) -> ShapeId {
        if let Some(index) = self.free.pop() {
            if let (Some(slot), Some(&generation)) = (
                self.records.get_mut(index as usize),
                self.generations.get(index as usize),
            ) {
                *slot = Some(record);
                return ShapeId { index, generation };
            }
        }
        self.records.push(Some(record));
        self.generations.push(0);
        ShapeId {
            index: (self.records.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Whether `id` names a live record.
    pub fn contains(&self, id: ShapeId) -> bool {
        self.lookup(id).is_some()
    }

    // ── Creation and transitions ───────────────────────────────────

    /// A fresh root shape with no properties.
    pub fn create(&mut self, prototype: Value, type_info: TypeInfo) -> ShapeId {
        let stamp = self.next_stamp();
        self.insert(ShapeRecord {
            cached_transition_offset: NOT_FOUND_OFFSET,
            prototype,
            type_info,
            layout: ShapeLayout::Shared,
            previous: None,
            added: None,
            transition_count: 0,
            transitions: FxHashMap::default(),
            table: PropertyTable::new(&self.config),
            has_getter_setter: false,
            stamp,
            enumeration_cache: None,
        })
    }

    /// Shape reached from `parent` by adding `name` with `attributes`.
    ///
    /// `parent` must be shared. Existing transitions are reused. Once the
    /// chain from the root is longer than the configured cap the result is a
    /// private dictionary shape instead.
    pub fn add_property_transition(
        &mut self,
        parent: ShapeId,
        name: &Identifier,
        attributes: Attributes,
    ) -> Transition {
        let record = self.record(parent);
        if record.is_dictionary() {
            fatal("property transition from a dictionary shape");
        }
        if let Some(offset) = record.table.get_offset(name) {
            return Transition {
                shape: parent,
                offset,
            };
        }
        let key = TransitionKey::Property(name.cheap_clone(), attributes);
        if let Some(&child) = record.transitions.get(&key) {
            return Transition {
                shape: child,
                offset: self.record(child).cached_transition_offset,
            };
        }

        if record.transition_count > self.config.max_transition_length {
            log::trace!(
                "shape {:?} exceeded {} transitions, switching to dictionary",
                parent,
                self.config.max_transition_length
            );
            let shape = self.to_dictionary_transition(parent);
            let offset = self.put_unchecked(shape, name, attributes);
            return Transition { shape, offset };
        }

        let mut table = record.table.clone();
        let offset = match table.put(name, attributes, false, None) {
            Ok(offset) => offset,
            Err(_) => fatal("unchecked put rejected"),
        };
        let child = ShapeRecord {
            cached_transition_offset: offset,
            prototype: record.prototype,
            type_info: record.type_info,
            layout: ShapeLayout::Shared,
            previous: Some(parent),
            added: Some(AddedProperty {
                name: name.cheap_clone(),
                attributes,
                offset,
            }),
            transition_count: record.transition_count + 1,
            transitions: FxHashMap::default(),
            table,
            has_getter_setter: record.has_getter_setter
                || attributes.contains(Attributes::GETTER_SETTER),
            stamp: 0,
            enumeration_cache: None,
        };
        let shape = self.insert(child);
        let stamp = self.next_stamp();
        self.record_mut(shape).stamp = stamp;
        self.record_mut(parent).transitions.insert(key, shape);
        Transition { shape, offset }
    }

    fn put_unchecked(&mut self, shape: ShapeId, name: &Identifier, attributes: Attributes) -> usize {
        match self.record_mut(shape).table.put(name, attributes, false, None) {
            Ok(offset) => offset,
            Err(_) => fatal("unchecked put rejected"),
        }
    }

    /// Shape identical to `shape` but with a different prototype. A
    /// dictionary shape is updated in place. The edge is cached, so the same
    /// change from the same shape always yields the same child.
    pub fn change_prototype_transition(&mut self, shape: ShapeId, prototype: Value) -> ShapeId {
        if self.is_dictionary(shape) {
            self.bump(shape).prototype = prototype;
            return shape;
        }
        if self.prototype(shape) == prototype {
            return shape;
        }
        self.derived_transition(shape, TransitionKey::Prototype(prototype), |record| {
            record.prototype = prototype;
        })
    }

    /// Shape identical to `shape` but flagged as holding accessors. Cached
    /// like a prototype change.
    pub fn getter_setter_transition(&mut self, shape: ShapeId) -> ShapeId {
        if self.is_dictionary(shape) {
            self.bump(shape).has_getter_setter = true;
            return shape;
        }
        if self.has_getter_setter_properties(shape) {
            return shape;
        }
        self.derived_transition(shape, TransitionKey::GetterSetter, |record| {
            record.has_getter_setter = true;
        })
    }

    fn derived_transition(
        &mut self,
        shape: ShapeId,
        key: TransitionKey,
        change: impl FnOnce(&mut ShapeRecord),
    ) -> ShapeId {
        if let Some(&child) = self.record(shape).transitions.get(&key) {
            return child;
        }
        let stamp = self.next_stamp();
        let mut record = self.record(shape).derived(shape, stamp);
        change(&mut record);
        let child = self.insert(record);
        self.record_mut(shape).transitions.insert(key, child);
        child
    }

    /// A private dictionary copy of `shape`. Dictionaries are returned as is.
    pub fn to_dictionary_transition(&mut self, shape: ShapeId) -> ShapeId {
        if self.is_dictionary(shape) {
            return shape;
        }
        log::trace!("shape {:?} -> dictionary", shape);
        self.copy_as_dictionary(shape)
    }

    /// A second private copy of a dictionary shape, for a new owner.
    pub(crate) fn duplicate_dictionary(&mut self, shape: ShapeId) -> ShapeId {
        self.copy_as_dictionary(shape)
    }

    fn copy_as_dictionary(&mut self, shape: ShapeId) -> ShapeId {
        let stamp = self.next_stamp();
        let source = self.record(shape);
        let record = ShapeRecord {
            cached_transition_offset: NOT_FOUND_OFFSET,
            prototype: source.prototype,
            type_info: source.type_info,
            layout: ShapeLayout::Dictionary,
            previous: if source.is_dictionary() {
                source.previous
            } else {
                Some(shape)
            },
            added: None,
            transition_count: source.transition_count,
            transitions: FxHashMap::default(),
            table: source.table.clone(),
            has_getter_setter: source.has_getter_setter,
            stamp,
            enumeration_cache: None,
        };
        self.insert(record)
    }

    /// Turn a dictionary back into a shared lineage.
    ///
    /// Replays the surviving properties in definition order from a root for
    /// the same prototype, so cells flattened to the same property list
    /// share shapes, and rewrites `storage` to the new offsets. The
    /// dictionary record is released. Dictionaries with more properties than
    /// the transition cap stay dictionaries (compacted).
    pub fn from_dictionary_transition(
        &mut self,
        shape: ShapeId,
        storage: &mut PropertyStorage,
    ) -> ShapeId {
        if !self.is_dictionary(shape) {
            return shape;
        }
        let max = self.config.max_transition_length;
        let record = self.bump(shape);
        let size = record.table.size();
        record.table.rehash(size, Some(storage));
        let entries = record.table.entries();
        if entries.len() > max {
            log::trace!("dictionary {:?} too large to flatten ({} properties)", shape, entries.len());
            return shape;
        }
        let prototype = record.prototype;
        let type_info = record.type_info;
        let has_getter_setter = record.has_getter_setter;

        let old_storage = std::mem::take(storage);
        storage.resize(entries.len(), Value::UNDEFINED);
        let mut current = self.flatten_root(prototype, type_info);
        for entry in &entries {
            let transition = self.add_property_transition(current, &entry.name, entry.attributes);
            current = transition.shape;
            if storage.len() <= transition.offset {
                storage.resize(transition.offset + 1, Value::UNDEFINED);
            }
            if let Some(slot) = storage.get_mut(transition.offset) {
                *slot = old_storage
                    .get(entry.offset)
                    .copied()
                    .unwrap_or(Value::UNDEFINED);
            }
        }
        if has_getter_setter && !self.has_getter_setter_properties(current) {
            current = self.getter_setter_transition(current);
        }
        log::trace!("dictionary {:?} flattened to {:?}", shape, current);
        self.release(shape);
        current
    }

    fn flatten_root(&mut self, prototype: Value, type_info: TypeInfo) -> ShapeId {
        if let Some(&root) = self.flatten_roots.get(&(prototype, type_info)) {
            return root;
        }
        let root = self.create(prototype, type_info);
        self.flatten_roots.insert((prototype, type_info), root);
        root
    }

    /// Forget flatten roots whose prototype cell is no longer live, so a
    /// later cell at the same address starts a fresh lineage.
    pub(crate) fn forget_dead_prototypes(&mut self, is_live: impl Fn(Value) -> bool) {
        self.flatten_roots
            .retain(|(prototype, _), _| !prototype.is_cell() || is_live(*prototype));
    }

    #[cfg(test)]
    pub(crate) fn flatten_root_count(&self) -> usize {
        self.flatten_roots.len()
    }

    /// Free a dictionary record. Shared shapes are immortal and ignored, as
    /// are stale ids.
    pub fn release(&mut self, shape: ShapeId) {
        let is_dictionary = self.lookup(shape).is_some_and(ShapeRecord::is_dictionary);
        if !is_dictionary {
            return;
        }
        let index = shape.index as usize;
        if let (Some(slot), Some(generation)) =
            (self.records.get_mut(index), self.generations.get_mut(index))
        {
            *slot = None;
            *generation = generation.wrapping_add(1);
            self.free.push(shape.index);
        }
    }

    // ── In-place dictionary mutation ───────────────────────────────

    fn bump(&mut self, shape: ShapeId) -> &mut ShapeRecord {
        let stamp = self.next_stamp();
        let record = self.record_mut(shape);
        record.stamp = stamp;
        record
    }

    fn dictionary_mut(&mut self, shape: ShapeId) -> Result<&mut ShapeRecord, HeapError> {
        if !self.is_dictionary(shape) {
            return Err(HeapError::NotDictionary);
        }
        Ok(self.bump(shape))
    }

    pub fn dictionary_put(
        &mut self,
        shape: ShapeId,
        name: &Identifier,
        attributes: Attributes,
        check_read_only: bool,
        storage: &mut PropertyStorage,
    ) -> Result<usize, HeapError> {
        let record = self.dictionary_mut(shape)?;
        if attributes.contains(Attributes::GETTER_SETTER) {
            record.has_getter_setter = true;
        }
        record
            .table
            .put(name, attributes, check_read_only, Some(storage))
    }

    pub fn dictionary_remove(
        &mut self,
        shape: ShapeId,
        name: &Identifier,
        storage: &mut PropertyStorage,
    ) -> Result<Option<usize>, HeapError> {
        let record = self.dictionary_mut(shape)?;
        Ok(record.table.remove(name, Some(storage)))
    }

    pub fn set_dictionary_prototype(
        &mut self,
        shape: ShapeId,
        prototype: Value,
    ) -> Result<(), HeapError> {
        self.dictionary_mut(shape)?.prototype = prototype;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_offset(&self, shape: ShapeId, name: &Identifier) -> Option<usize> {
        self.record(shape).table.get_offset(name)
    }

    pub fn get_offset_and_attributes(
        &self,
        shape: ShapeId,
        name: &Identifier,
    ) -> Option<(usize, Attributes)> {
        self.record(shape).table.get_offset_and_attributes(name)
    }

    /// Slot count a cell of this shape needs.
    pub fn storage_size(&self, shape: ShapeId) -> usize {
        self.record(shape).table.storage_size()
    }

    pub fn property_count(&self, shape: ShapeId) -> usize {
        self.record(shape).table.len()
    }

    pub fn is_dictionary(&self, shape: ShapeId) -> bool {
        self.record(shape).is_dictionary()
    }

    pub fn layout(&self, shape: ShapeId) -> ShapeLayout {
        self.record(shape).layout
    }

    pub fn prototype(&self, shape: ShapeId) -> Value {
        self.record(shape).prototype
    }

    pub fn type_info(&self, shape: ShapeId) -> TypeInfo {
        self.record(shape).type_info
    }

    pub fn has_getter_setter_properties(&self, shape: ShapeId) -> bool {
        self.record(shape).has_getter_setter
    }

    pub fn transition_count(&self, shape: ShapeId) -> usize {
        self.record(shape).transition_count
    }

    pub fn previous(&self, shape: ShapeId) -> Option<ShapeId> {
        self.record(shape).previous
    }

    pub fn cached_transition_offset(&self, shape: ShapeId) -> Option<usize> {
        match self.record(shape).cached_transition_offset {
            NOT_FOUND_OFFSET => None,
            offset => Some(offset),
        }
    }

    /// Changes whenever the shape's property set or prototype changes.
    pub fn stamp(&self, shape: ShapeId) -> u64 {
        self.record(shape).stamp
    }

    /// Live properties of `shape` in insertion order.
    pub fn entries(&self, shape: ShapeId) -> Vec<PropertyEntry> {
        self.record(shape).table.entries()
    }

    /// First shape of the `previous` chain.
    pub fn root_of(&self, shape: ShapeId) -> ShapeId {
        let mut current = shape;
        while let Some(previous) = self.record(current).previous {
            current = previous;
        }
        current
    }

    /// Properties added along the `previous` chain, oldest first. For a
    /// dictionary the current table is reported instead, since it no longer
    /// follows its lineage.
    pub fn property_additions(&self, shape: ShapeId) -> Vec<PropertyEntry> {
        if self.is_dictionary(shape) {
            return self.entries(shape);
        }
        let mut additions = Vec::new();
        let mut current = Some(shape);
        while let Some(id) = current {
            let record = self.record(id);
            if let Some(added) = &record.added {
                additions.push(PropertyEntry {
                    name: added.name.cheap_clone(),
                    offset: added.offset,
                    attributes: added.attributes,
                });
            }
            current = record.previous;
        }
        additions.reverse();
        additions
    }

    pub(crate) fn record_mut_for_cache(&mut self, shape: ShapeId) -> &mut ShapeRecord {
        self.record_mut(shape)
    }

    pub(crate) fn table(&self, shape: ShapeId) -> &PropertyTable {
        &self.record(shape).table
    }
}
