//! Open-addressed property table.
//!
//! Maps property names to storage offsets and attributes. The table is a
//! power-of-two index vector probed with double hashing, pointing into an
//! entry vector kept in allocation order. Index slot values:
//!
//! * `0` - empty, terminates a probe sequence
//! * `1` - deleted sentinel, points at the keyless entry 0 and never matches
//! * `n` - live or dead entry at `entries[n - 1]`, storage offset `n - 2`
//!
//! Storage offsets are therefore dense over the entry vector. Removing a
//! property leaves a dead entry behind whose offset is reused by the next
//! insertion that lands on a deleted sentinel. A rehash drops dead entries,
//! renumbers offsets and permutes the owner's storage to match.

use bitflags::bitflags;

use crate::config::ShapeConfig;
use crate::error::HeapError;
use crate::identifier::Identifier;
use crate::value::{CheapClone, Value};

bitflags! {
    /// Per-property attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u8 {
        const READ_ONLY = 1 << 1;
        const DONT_ENUM = 1 << 2;
        const DONT_DELETE = 1 << 3;
        const FUNCTION = 1 << 4;
        const GETTER_SETTER = 1 << 5;
    }
}

/// Slot array of an object cell, indexed by storage offset.
pub type PropertyStorage = Vec<Value>;

const EMPTY_ENTRY_INDEX: u32 = 0;
const DELETED_SENTINEL_INDEX: u32 = 1;

#[derive(Clone)]
struct Entry {
    key: Option<Identifier>,
    attributes: Attributes,
    /// Insertion order, for enumeration.
    index: u32,
}

impl Entry {
    const SENTINEL: Entry = Entry {
        key: None,
        attributes: Attributes::empty(),
        index: 0,
    };
}

/// A live property as reported by [`PropertyTable::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEntry {
    pub name: Identifier,
    pub offset: usize,
    pub attributes: Attributes,
}

#[derive(Clone)]
pub struct PropertyTable {
    size: usize,
    size_mask: usize,
    key_count: usize,
    deleted_sentinel_count: usize,
    last_index_used: u32,
    indices: Vec<u32>,
    /// `entries[0]` is the permanent keyless sentinel.
    entries: Vec<Entry>,
    max_load_factor: f64,
}

/// Secondary hash for the probe step.
#[inline]
fn double_hash(key: u32) -> u32 {
    let mut key = (!key).wrapping_add(key >> 23);
    key ^= key << 12;
    key ^= key >> 7;
    key ^= key << 2;
    key ^= key >> 20;
    key
}

enum Probe {
    Found { slot: usize, position: usize },
    Missing { slot: usize, first_deleted: Option<usize> },
}

impl PropertyTable {
    pub fn new(config: &ShapeConfig) -> Self {
        Self::with_size(config.initial_table_size, config.max_load_factor)
    }

    fn with_size(size: usize, max_load_factor: f64) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            size,
            size_mask: size - 1,
            key_count: 0,
            deleted_sentinel_count: 0,
            last_index_used: 0,
            indices: vec![EMPTY_ENTRY_INDEX; size],
            entries: vec![Entry::SENTINEL],
            max_load_factor,
        }
    }

    /// Number of live properties.
    pub fn len(&self) -> usize {
        self.key_count
    }

    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Slot count of the index vector.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn deleted_sentinel_count(&self) -> usize {
        self.deleted_sentinel_count
    }

    /// Storage slots an owner needs: every offset handed out is below this.
    pub fn storage_size(&self) -> usize {
        self.entries.len() - 1
    }

    fn probe(&self, name: &Identifier) -> Probe {
        let hash = name.computed_hash() as usize;
        let mut i = hash;
        let mut step = 0usize;
        let mut first_deleted = None;
        loop {
            let slot = i & self.size_mask;
            let entry_index = self
                .indices
                .get(slot)
                .copied()
                .unwrap_or(EMPTY_ENTRY_INDEX);
            if entry_index == EMPTY_ENTRY_INDEX {
                return Probe::Missing {
                    slot,
                    first_deleted,
                };
            }
            if entry_index == DELETED_SENTINEL_INDEX {
                first_deleted.get_or_insert(slot);
            } else {
                let position = entry_index as usize - 1;
                let matches = self
                    .entries
                    .get(position)
                    .and_then(|e| e.key.as_ref())
                    .is_some_and(|k| k == name);
                if matches {
                    return Probe::Found { slot, position };
                }
            }
            if step == 0 {
                step = 1 | double_hash(hash as u32) as usize;
            }
            i = i.wrapping_add(step);
        }
    }

    pub fn get_offset(&self, name: &Identifier) -> Option<usize> {
        match self.probe(name) {
            Probe::Found { position, .. } => Some(position - 1),
            Probe::Missing { .. } => None,
        }
    }

    pub fn get_offset_and_attributes(&self, name: &Identifier) -> Option<(usize, Attributes)> {
        match self.probe(name) {
            Probe::Found { position, .. } => {
                let attributes = self.entries.get(position)?.attributes;
                Some((position - 1, attributes))
            }
            Probe::Missing { .. } => None,
        }
    }

    /// Insert `name` or find its existing offset.
    ///
    /// An existing property keeps its attributes. With `check_read_only`, an
    /// existing read-only property is an error. A new property takes the
    /// storage offset of a dead entry when it lands on a deleted sentinel,
    /// otherwise the next unused offset. `storage` is resized to cover the
    /// offset and is permuted if the insertion triggers a rehash; it must be
    /// supplied whenever the table has had removals.
    pub fn put(
        &mut self,
        name: &Identifier,
        attributes: Attributes,
        check_read_only: bool,
        mut storage: Option<&mut PropertyStorage>,
    ) -> Result<usize, HeapError> {
        let (slot, first_deleted) = match self.probe(name) {
            Probe::Found { position, .. } => {
                let offset = position - 1;
                let existing = self
                    .entries
                    .get(position)
                    .map(|e| e.attributes)
                    .unwrap_or_default();
                if check_read_only && existing.contains(Attributes::READ_ONLY) {
                    return Err(HeapError::read_only(offset));
                }
                return Ok(offset);
            }
            Probe::Missing {
                slot,
                first_deleted,
            } => (slot, first_deleted),
        };

        self.last_index_used += 1;
        let entry = Entry {
            key: Some(name.cheap_clone()),
            attributes,
            index: self.last_index_used,
        };

        let position = match first_deleted {
            Some(deleted_slot) => {
                // Reuse the sentinel and the most recent dead entry.
                let position = self.last_dead_entry();
                if let Some(index_slot) = self.indices.get_mut(deleted_slot) {
                    *index_slot = (position + 1) as u32;
                }
                if let Some(dead) = self.entries.get_mut(position) {
                    *dead = entry;
                }
                self.deleted_sentinel_count -= 1;
                position
            }
            None => {
                self.entries.push(entry);
                let position = self.entries.len() - 1;
                if let Some(index_slot) = self.indices.get_mut(slot) {
                    *index_slot = (position + 1) as u32;
                }
                position
            }
        };
        self.key_count += 1;

        let mut offset = position - 1;
        if let Some(storage) = storage.as_deref_mut() {
            if storage.len() <= offset {
                storage.resize(offset + 1, Value::UNDEFINED);
            }
        }

        if (self.key_count + self.deleted_sentinel_count) as f64
            >= self.size as f64 * self.max_load_factor
        {
            self.expand(storage);
            // Compaction may have renumbered offsets.
            offset = self.get_offset(name).unwrap_or(offset);
        }

        self.check_consistency_if_enabled();
        Ok(offset)
    }

    fn last_dead_entry(&self) -> usize {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, e)| e.key.is_none())
            .map(|(position, _)| position)
            .unwrap_or_else(|| crate::error::fatal("deleted sentinel without a dead entry"))
    }

    /// Remove `name`, clearing its storage slot. Returns the freed offset.
    pub fn remove(
        &mut self,
        name: &Identifier,
        mut storage: Option<&mut PropertyStorage>,
    ) -> Option<usize> {
        let Probe::Found { slot, position } = self.probe(name) else {
            return None;
        };
        let offset = position - 1;

        if let Some(index_slot) = self.indices.get_mut(slot) {
            *index_slot = DELETED_SENTINEL_INDEX;
        }
        if let Some(entry) = self.entries.get_mut(position) {
            entry.key = None;
            entry.attributes = Attributes::empty();
            entry.index = 0;
        }
        if let Some(value) = storage.as_deref_mut().and_then(|s| s.get_mut(offset)) {
            *value = Value::UNDEFINED;
        }

        self.key_count -= 1;
        self.deleted_sentinel_count += 1;
        if self.deleted_sentinel_count * 4 >= self.size {
            self.rehash(self.size, storage);
        }

        self.check_consistency_if_enabled();
        Some(offset)
    }

    /// Grow, or compact at the same size when most of the load is sentinels.
    /// The new size always brings the live keys under the load bound.
    fn expand(&mut self, storage: Option<&mut PropertyStorage>) {
        let mut new_size = if self.deleted_sentinel_count * 4 >= self.size {
            self.size
        } else {
            self.size * 2
        };
        // Sentinels do not survive the rehash.
        while self.key_count as f64 >= new_size as f64 * self.max_load_factor {
            new_size *= 2;
        }
        self.rehash(new_size, storage);
    }

    /// Drop dead entries and sentinels, keeping insertion indices. Storage
    /// values follow their properties to the new offsets.
    pub fn rehash(&mut self, new_size: usize, storage: Option<&mut PropertyStorage>) {
        log::trace!(
            "rehash property table: {} keys, {} sentinels, size {} -> {}",
            self.key_count,
            self.deleted_sentinel_count,
            self.size,
            new_size
        );
        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::SENTINEL]);
        let old_storage = storage.as_ref().map(|s| s.to_vec());

        self.size = new_size;
        self.size_mask = new_size - 1;
        self.indices = vec![EMPTY_ENTRY_INDEX; new_size];
        self.key_count = 0;
        self.deleted_sentinel_count = 0;

        let mut new_storage = Vec::with_capacity(old_entries.len());
        for (old_position, entry) in old_entries.into_iter().enumerate().skip(1) {
            let Some(key) = entry.key.as_ref() else {
                continue;
            };
            let Probe::Missing { slot, .. } = self.probe(key) else {
                continue;
            };
            self.entries.push(entry.clone());
            if let Some(index_slot) = self.indices.get_mut(slot) {
                *index_slot = self.entries.len() as u32;
            }
            self.key_count += 1;
            if let Some(old) = &old_storage {
                new_storage.push(
                    old.get(old_position - 1)
                        .copied()
                        .unwrap_or(Value::UNDEFINED),
                );
            }
        }

        if let Some(storage) = storage {
            *storage = new_storage;
        }
    }

    /// Names without `DONT_ENUM`, in insertion order, appended to `into`.
    pub fn enumerable_names(&self, into: &mut Vec<Identifier>) {
        let mut live: Vec<&Entry> = self
            .entries
            .iter()
            .skip(1)
            .filter(|e| e.key.is_some() && !e.attributes.contains(Attributes::DONT_ENUM))
            .collect();
        live.sort_by_key(|e| e.index);
        into.extend(live.into_iter().filter_map(|e| e.key.clone()));
    }

    /// Live properties in insertion order.
    pub fn entries(&self) -> Vec<PropertyEntry> {
        let mut live: Vec<(u32, PropertyEntry)> = self
            .entries
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(position, e)| {
                e.key.as_ref().map(|name| {
                    (
                        e.index,
                        PropertyEntry {
                            name: name.cheap_clone(),
                            offset: position - 1,
                            attributes: e.attributes,
                        },
                    )
                })
            })
            .collect();
        live.sort_by_key(|(index, _)| *index);
        live.into_iter().map(|(_, entry)| entry).collect()
    }

    /// True if any live property is an accessor.
    pub fn has_getter_setter(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.key.is_some() && e.attributes.contains(Attributes::GETTER_SETTER))
    }

    /// Verify counters against the index and entry vectors.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut live_slots = 0;
        let mut deleted_slots = 0;
        for (slot, &entry_index) in self.indices.iter().enumerate() {
            match entry_index {
                EMPTY_ENTRY_INDEX => {}
                DELETED_SENTINEL_INDEX => deleted_slots += 1,
                n => {
                    live_slots += 1;
                    let position = n as usize - 1;
                    let Some(key) = self.entries.get(position).and_then(|e| e.key.as_ref()) else {
                        return Err(format!("index slot {} points at dead entry {}", slot, position));
                    };
                    match self.probe(key) {
                        Probe::Found { slot: found, .. } if found == slot => {}
                        _ => return Err(format!("entry {} not reachable by probing", position)),
                    }
                }
            }
        }
        if live_slots != self.key_count {
            return Err(format!("key count {} but {} live slots", self.key_count, live_slots));
        }
        if deleted_slots != self.deleted_sentinel_count {
            return Err(format!(
                "sentinel count {} but {} deleted slots",
                self.deleted_sentinel_count, deleted_slots
            ));
        }
        let dead = self.entries.iter().skip(1).filter(|e| e.key.is_none()).count();
        if dead != self.deleted_sentinel_count {
            return Err(format!(
                "{} dead entries for {} sentinels",
                dead, self.deleted_sentinel_count
            ));
        }
        if (self.key_count + self.deleted_sentinel_count) as f64
            >= self.size as f64 * self.max_load_factor
        {
            return Err("load factor exceeded".to_string());
        }
        if self.entries.iter().any(|e| e.index > self.last_index_used) {
            return Err("entry index beyond last index used".to_string());
        }
        Ok(())
    }

    #[inline]
    fn check_consistency_if_enabled(&self) {
        #[cfg(feature = "consistency-checks")]
        if let Err(message) = self.check_consistency() {
            crate::error::fatal(&message);
        }
    }
}
