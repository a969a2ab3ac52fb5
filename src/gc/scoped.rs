//! RAII protection of a single value.

use super::Heap;
use super::roots::SharedRoots;
use crate::value::Value;

/// Something that can pin values for the collector.
pub trait ProtectRoots {
    fn protect(&self, value: Value);
    fn unprotect(&self, value: Value);
}

impl ProtectRoots for Heap {
    fn protect(&self, value: Value) {
        Heap::protect(self, value);
    }

    fn unprotect(&self, value: Value) {
        Heap::unprotect(self, value);
    }
}

impl ProtectRoots for SharedRoots {
    fn protect(&self, value: Value) {
        SharedRoots::protect(self, value);
    }

    fn unprotect(&self, value: Value) {
        SharedRoots::unprotect(self, value);
    }
}

/// Keeps its value protected for as long as it lives.
///
/// Protection is counted, so nested guards on the same value compose.
pub struct ScopedReference<R: ProtectRoots = Heap> {
    roots: R,
    value: Value,
}

impl<R: ProtectRoots> ScopedReference<R> {
    pub fn new(roots: R, value: Value) -> Self {
        roots.protect(value);
        Self { roots, value }
    }

    pub fn get(&self) -> Value {
        self.value
    }

    /// Replace the guarded value. The new value is protected before the old
    /// one is released.
    pub fn set(&mut self, value: Value) {
        self.roots.protect(value);
        self.roots.unprotect(self.value);
        self.value = value;
    }
}

impl<R: ProtectRoots + Clone> Clone for ScopedReference<R> {
    fn clone(&self) -> Self {
        Self::new(self.roots.clone(), self.value)
    }
}

impl<R: ProtectRoots> Drop for ScopedReference<R> {
    fn drop(&mut self) {
        self.roots.unprotect(self.value);
    }
}

impl<R: ProtectRoots> std::fmt::Debug for ScopedReference<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ScopedReference").field(&self.value).finish()
    }
}
