//! Cached `for-in` name lists.
//!
//! A list is valid only while the owning shape and every shape on its
//! prototype chain are unchanged. Validity is checked by comparing a
//! [`PrototypeChain`] snapshot of `(shape, stamp)` pairs taken when the list
//! was built against one taken now.

use std::rc::Rc;

use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashSet};

use crate::identifier::Identifier;
use crate::shape::{ShapeArena, ShapeId};
use crate::value::{CheapClone, Value};

/// Snapshot of the shapes on a prototype chain, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrototypeChain(Vec<(ShapeId, u64)>);

impl PrototypeChain {
    pub fn shapes(&self) -> impl Iterator<Item = ShapeId> + '_ {
        self.0.iter().map(|&(shape, _)| shape)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub(crate) struct EnumerationCache {
    names: Rc<[Identifier]>,
    chain: PrototypeChain,
}

impl ShapeArena {
    /// Snapshot the chain above `shape`. `resolver` maps a prototype value to
    /// the shape of that cell, or `None` where the chain ends. Cycles end the
    /// walk at the first repeated prototype.
    pub fn prototype_chain(
        &self,
        shape: ShapeId,
        resolver: &dyn Fn(Value) -> Option<ShapeId>,
    ) -> PrototypeChain {
        let mut chain = Vec::new();
        let mut seen = FxHashSet::default();
        let mut prototype = self.prototype(shape);
        while seen.insert(prototype.raw()) {
            let Some(proto_shape) = resolver(prototype) else {
                break;
            };
            chain.push((proto_shape, self.stamp(proto_shape)));
            prototype = self.prototype(proto_shape);
        }
        PrototypeChain(chain)
    }

    /// Enumerable names of a cell with `shape`: its own names in insertion
    /// order, then those of each prototype not already listed.
    pub fn enumerable_property_names(
        &mut self,
        shape: ShapeId,
        resolver: &dyn Fn(Value) -> Option<ShapeId>,
    ) -> Rc<[Identifier]> {
        let chain = self.prototype_chain(shape, resolver);
        let cacheable = !self.is_dictionary(shape);
        if cacheable {
            if let Some(cache) = &self.record(shape).enumeration_cache {
                if cache.chain == chain {
                    return cache.names.cheap_clone();
                }
            }
        }

        let mut names: IndexSet<Identifier, FxBuildHasher> = IndexSet::default();
        let mut scratch = Vec::new();
        for source in std::iter::once(shape).chain(chain.shapes()) {
            scratch.clear();
            self.table(source).enumerable_names(&mut scratch);
            names.extend(scratch.drain(..));
        }
        let names: Rc<[Identifier]> = names.into_iter().collect();

        if cacheable {
            self.record_mut_for_cache(shape).enumeration_cache = Some(EnumerationCache {
                names: names.cheap_clone(),
                chain,
            });
        }
        names
    }

    pub fn has_enumeration_cache(&self, shape: ShapeId) -> bool {
        self.record(shape).enumeration_cache.is_some()
    }

    pub fn clear_enumeration_cache(&mut self, shape: ShapeId) {
        self.record_mut_for_cache(shape).enumeration_cache = None;
    }
}
