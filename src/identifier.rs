//! Interned property names.
//!
//! The object model never looks at the characters of a property name. It only
//! needs a stable hash and an identity comparison, both of which
//! [`Identifier`] provides in O(1). [`IdentifierTable`] guarantees that equal
//! text interned through the same table yields the same handle.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHasher};

use crate::value::CheapClone;

struct IdentifierInner {
    text: Box<str>,
    hash: u32,
}

/// Reference-counted, hashable property name handle.
///
/// Equality is pointer identity. Two identifiers created separately with
/// [`Identifier::new`] are distinct even if their text matches; intern through
/// an [`IdentifierTable`] to get canonical handles.
#[derive(Clone)]
pub struct Identifier(Rc<IdentifierInner>);

impl CheapClone for Identifier {}

impl Identifier {
    /// Create a fresh, uninterned identifier.
    pub fn new(text: &str) -> Self {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        // Fold to 32 bits so table probing is identical on every target.
        let wide = hasher.finish();
        let hash = (wide ^ (wide >> 32)) as u32;
        Identifier(Rc::new(IdentifierInner {
            text: text.into(),
            hash,
        }))
    }

    /// Hash computed once at creation.
    #[inline]
    pub fn computed_hash(&self) -> u32 {
        self.0.hash
    }

    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Identifier) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Identifier {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.hash);
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Interner mapping text to canonical [`Identifier`] handles.
pub struct IdentifierTable {
    /// Box<str> keys avoid a double indirection through the Rc.
    identifiers: FxHashMap<Box<str>, Identifier>,
}

impl IdentifierTable {
    pub fn new() -> Self {
        Self {
            identifiers: FxHashMap::default(),
        }
    }

    /// Create a table pre-populated with names every object model touches.
    pub fn with_common_names() -> Self {
        let mut table = Self::new();
        for name in COMMON_NAMES {
            table.intern(name);
        }
        table
    }

    /// Get the canonical identifier for `text`, creating it on first use.
    pub fn intern(&mut self, text: &str) -> Identifier {
        if let Some(existing) = self.identifiers.get(text) {
            return existing.cheap_clone();
        }
        let id = Identifier::new(text);
        self.identifiers.insert(text.into(), id.cheap_clone());
        id
    }

    /// Look up without inserting.
    pub fn get(&self, text: &str) -> Option<Identifier> {
        self.identifiers.get(text).map(CheapClone::cheap_clone)
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

impl Default for IdentifierTable {
    fn default() -> Self {
        Self::new()
    }
}

const COMMON_NAMES: &[&str] = &[
    "length",
    "prototype",
    "constructor",
    "__proto__",
    "name",
    "message",
    "toString",
    "valueOf",
    "hasOwnProperty",
    "arguments",
    "callee",
    "caller",
    "get",
    "set",
    "value",
];
