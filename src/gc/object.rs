//! Property access on object cells.
//!
//! Every operation takes the cell as a [`Value`] and fails with
//! [`HeapError::NotAnObject`] when it is not a live object cell of this heap.
//! Shape transitions happen here: adding a property moves a cell along the
//! shared transition graph, deleting one moves it to a private dictionary.

use std::mem::size_of;
use std::rc::Rc;

use super::{Heap, object_mut};
use crate::cell::HostObject;
use crate::error::HeapError;
use crate::identifier::Identifier;
use crate::property_table::Attributes;
use crate::shape::ShapeId;
use crate::value::Value;

impl Heap {
    /// Current shape of `cell`. A dictionary shape id is only valid while
    /// the cell keeps it: once the cell transitions away or dies the id goes
    /// stale and [`crate::ShapeArena::contains`] reports false for it.
    pub fn shape_of(&self, cell: Value) -> Result<ShapeId, HeapError> {
        Ok(self.space().object(cell)?.shape)
    }

    /// Copy of the cell's slot array.
    pub fn storage_of(&self, cell: Value) -> Result<Vec<Value>, HeapError> {
        Ok(self.space().object(cell)?.storage.clone())
    }

    pub fn prototype_of(&self, cell: Value) -> Result<Value, HeapError> {
        let space = self.space();
        let shape = space.object(cell)?.shape;
        Ok(space.shapes.prototype(shape))
    }

    /// Own property lookup.
    pub fn get_direct(&self, cell: Value, name: &Identifier) -> Result<Option<Value>, HeapError> {
        let space = self.space();
        let object = space.object(cell)?;
        Ok(space
            .shapes
            .get_offset(object.shape, name)
            .and_then(|offset| object.storage.get(offset).copied()))
    }

    /// Lookup along the prototype chain. A cyclic chain ends the search
    /// after at most one hop per live object.
    pub fn get(&self, cell: Value, name: &Identifier) -> Result<Option<Value>, HeapError> {
        let space = self.space();
        let mut object = space.object(cell)?;
        // An acyclic chain visits each live object at most once.
        let mut hops_left = space.primary.live_objects();
        loop {
            if let Some(offset) = space.shapes.get_offset(object.shape, name) {
                return Ok(object.storage.get(offset).copied());
            }
            if hops_left == 0 {
                return Ok(None);
            }
            hops_left -= 1;
            match space.object(space.shapes.prototype(object.shape)) {
                Ok(next) => object = next,
                Err(_) => return Ok(None),
            }
        }
    }

    /// Add or overwrite an own property without read-only checks. An
    /// existing property keeps its attributes. Returns the storage offset.
    pub fn put_direct(
        &self,
        cell: Value,
        name: &Identifier,
        value: Value,
        attributes: Attributes,
    ) -> Result<usize, HeapError> {
        self.put_own(cell, name, value, attributes, false)
    }

    /// Assignment: like [`Heap::put_direct`] with default attributes, but an
    /// existing read-only property is an error.
    pub fn put(&self, cell: Value, name: &Identifier, value: Value) -> Result<(), HeapError> {
        self.put_own(cell, name, value, Attributes::empty(), true)?;
        Ok(())
    }

    fn put_own(
        &self,
        cell: Value,
        name: &Identifier,
        value: Value,
        attributes: Attributes,
        check_read_only: bool,
    ) -> Result<usize, HeapError> {
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let object = object_mut(&mut space.primary, cell)?;
        let shapes = &mut space.shapes;
        let capacity_before = object.storage.capacity();

        let offset = if shapes.is_dictionary(object.shape) {
            shapes.dictionary_put(object.shape, name, attributes, check_read_only, &mut object.storage)?
        } else {
            if let Some((offset, existing)) = shapes.get_offset_and_attributes(object.shape, name) {
                if check_read_only && existing.contains(Attributes::READ_ONLY) {
                    return Err(HeapError::read_only(offset));
                }
            }
            let transition = shapes.add_property_transition(object.shape, name, attributes);
            object.shape = transition.shape;
            if object.storage.len() <= transition.offset {
                object.storage.resize(transition.offset + 1, Value::UNDEFINED);
            }
            transition.offset
        };
        if let Some(slot) = object.storage.get_mut(offset) {
            *slot = value;
        }
        let grown = object.storage.capacity().saturating_sub(capacity_before);
        space.add_extra_cost(grown * size_of::<Value>());
        Ok(offset)
    }

    /// Remove an own property. Returns false when it is `DONT_DELETE`.
    /// Deleting from a shared shape moves the cell to a dictionary first.
    pub fn delete_property(&self, cell: Value, name: &Identifier) -> Result<bool, HeapError> {
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let object = object_mut(&mut space.primary, cell)?;
        let shapes = &mut space.shapes;

        match shapes.get_offset_and_attributes(object.shape, name) {
            None => return Ok(true),
            Some((_, attributes)) if attributes.contains(Attributes::DONT_DELETE) => {
                return Ok(false);
            }
            Some(_) => {}
        }
        object.shape = shapes.to_dictionary_transition(object.shape);
        shapes.dictionary_remove(object.shape, name, &mut object.storage)?;
        Ok(true)
    }

    pub fn set_prototype(&self, cell: Value, prototype: Value) -> Result<(), HeapError> {
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let object = object_mut(&mut space.primary, cell)?;
        if space.shapes.is_dictionary(object.shape) {
            space.shapes.set_dictionary_prototype(object.shape, prototype)?;
        } else {
            object.shape = space.shapes.change_prototype_transition(object.shape, prototype);
        }
        Ok(())
    }

    /// Store an accessor under `name` and flag the shape as holding
    /// accessors. `accessor` is whatever cell the interpreter uses for a
    /// getter/setter pair.
    pub fn define_getter_setter(
        &self,
        cell: Value,
        name: &Identifier,
        accessor: Value,
    ) -> Result<(), HeapError> {
        self.put_own(cell, name, accessor, Attributes::GETTER_SETTER, false)?;
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let object = object_mut(&mut space.primary, cell)?;
        if !space.shapes.has_getter_setter_properties(object.shape) {
            object.shape = space.shapes.getter_setter_transition(object.shape);
        }
        Ok(())
    }

    /// Move a dictionary cell back onto a shared shape, compacting its
    /// storage. No-op for shared shapes.
    pub fn flatten_dictionary(&self, cell: Value) -> Result<(), HeapError> {
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let object = object_mut(&mut space.primary, cell)?;
        object.shape = space
            .shapes
            .from_dictionary_transition(object.shape, &mut object.storage);
        Ok(())
    }

    /// Attach a native payload, returning the previous one.
    pub fn set_host_object(
        &self,
        cell: Value,
        host: Box<dyn HostObject>,
    ) -> Result<Option<Box<dyn HostObject>>, HeapError> {
        let mut space = self.space_mut();
        let object = object_mut(&mut space.primary, cell)?;
        Ok(object.host.replace(host))
    }

    /// Run `f` on the cell's payload if it is a `T`. `f` must not use the
    /// heap.
    pub fn host_object<T: HostObject + 'static, R>(
        &self,
        cell: Value,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<Option<R>, HeapError> {
        let mut space = self.space_mut();
        let object = object_mut(&mut space.primary, cell)?;
        Ok(object.host_as_mut::<T>().map(f))
    }

    /// Enumerable names of `cell` and its prototypes, own names first.
    pub fn enumerable_property_names(&self, cell: Value) -> Result<Rc<[Identifier]>, HeapError> {
        let mut guard = self.space_mut();
        let space = &mut *guard;
        let shape = space.object(cell)?.shape;
        let primary = &space.primary;
        let resolver = |prototype: Value| {
            if !prototype.is_cell() {
                return None;
            }
            // SAFETY: live slots hold initialised cells.
            primary
                .cell_at(prototype.raw())
                .map(|object| unsafe { object.as_ref() }.shape)
        };
        Ok(space.shapes.enumerable_property_names(shape, &resolver))
    }
}
