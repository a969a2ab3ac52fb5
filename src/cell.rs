//! Heap cell bodies and the marking interface.
//!
//! Object cells store a shape id and a slot array; everything else about the
//! object lives in its shape. Embedders attach native state through a
//! [`HostObject`], which reports its outgoing references to the collector via
//! [`Trace`].

use std::any::Any;

use crate::property_table::PropertyStorage;
use crate::shape::{ShapeArena, ShapeId};
use crate::value::Value;

/// Body of a primary-pool cell.
///
/// `repr(C)` keeps the shape id at offset 0 for compiled code.
#[repr(C)]
pub struct ObjectCell {
    pub(crate) shape: ShapeId,
    pub(crate) storage: PropertyStorage,
    pub(crate) host: Option<Box<dyn HostObject>>,
}

impl ObjectCell {
    pub(crate) fn new(shape: ShapeId, storage_size: usize) -> Self {
        Self {
            shape,
            storage: vec![Value::UNDEFINED; storage_size],
            host: None,
        }
    }

    /// Push every value this cell keeps alive.
    pub(crate) fn visit_children(&self, shapes: &ShapeArena, tracer: &mut Tracer<'_>) {
        tracer.mark(shapes.prototype(self.shape));
        tracer.mark_all(self.storage.iter().copied());
        if let Some(host) = &self.host {
            host.trace(tracer);
        }
    }

    pub(crate) fn class_name(&self, shapes: &ShapeArena) -> &'static str {
        match &self.host {
            Some(host) => host.class_name(),
            None => shapes.type_info(self.shape).cell_type.name(),
        }
    }

    pub(crate) fn host_as<T: HostObject + 'static>(&self) -> Option<&T> {
        self.host.as_deref().and_then(|h| h.as_any().downcast_ref::<T>())
    }

    pub(crate) fn host_as_mut<T: HostObject + 'static>(&mut self) -> Option<&mut T> {
        self.host
            .as_deref_mut()
            .and_then(|h| h.as_any_mut().downcast_mut::<T>())
    }
}

/// Body of a number-pool cell: a double that has no immediate encoding.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct NumberCell {
    pub(crate) value: f64,
}

/// Collects outgoing references during marking.
pub struct Tracer<'a> {
    pending: &'a mut Vec<Value>,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(pending: &'a mut Vec<Value>) -> Self {
        Self { pending }
    }

    /// Report a reference. Immediates are ignored.
    #[inline]
    pub fn mark(&mut self, value: Value) {
        if value.is_cell() {
            self.pending.push(value);
        }
    }

    pub fn mark_all(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.mark(value);
        }
    }
}

/// Types that hold heap references.
pub trait Trace {
    /// Report every [`Value`] held, via [`Tracer::mark`].
    ///
    /// Runs during a collection; it must not call back into the heap.
    fn trace(&self, tracer: &mut Tracer<'_>);
}

#[doc(hidden)]
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Native payload attached to an object cell.
///
/// Dropped when its cell is swept, after the collection has finished, so a
/// `Drop` impl may use the heap.
pub trait HostObject: Trace + AsAny {
    fn class_name(&self) -> &'static str;
}
