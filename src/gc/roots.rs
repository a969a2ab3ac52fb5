//! Root sources for the collector.
//!
//! A collection starts from:
//!
//! * the protected set, a counted multiset of values pinned by `protect`
//! * the owning thread's [`MachineStack`] and the stacks of every live
//!   [`ThreadRegistration`]
//! * every registered [`RootProvider`]
//!
//! Stack and provider words are scanned conservatively: anything that looks
//! like a live cell address keeps that cell alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::value::Value;

/// A source of root words, visited at the start of every collection.
///
/// Visiting runs while the heap is collecting; implementations must not call
/// back into the heap.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value));
}

// ============================================================================
// Protected values
// ============================================================================

/// Multiset of protected values. Immediates are never stored.
#[derive(Debug, Default)]
pub struct ProtectCountSet {
    counts: FxHashMap<Value, usize>,
}

impl ProtectCountSet {
    pub fn add(&mut self, value: Value) {
        if value.is_cell() {
            *self.counts.entry(value).or_insert(0) += 1;
        }
    }

    /// Drop one protection. Returns false if `value` was not protected.
    pub fn remove(&mut self, value: Value) -> bool {
        let Some(count) = self.counts.get_mut(&value) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&value);
        }
        true
    }

    /// Distinct protected values.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, value: Value) -> usize {
        self.counts.get(&value).copied().unwrap_or(0)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.counts.keys().copied()
    }
}

enum ProtectedValues {
    Local(ProtectCountSet),
    Locked(Arc<Mutex<ProtectCountSet>>),
}

/// Thread-safe handle to a heap's protected set, available once locking has
/// been enabled with
/// [`Heap::set_gc_protect_needs_locking`](crate::Heap::set_gc_protect_needs_locking).
#[derive(Clone)]
pub struct SharedRoots {
    set: Arc<Mutex<ProtectCountSet>>,
}

impl SharedRoots {
    pub fn protect(&self, value: Value) {
        self.set.lock().add(value);
    }

    pub fn unprotect(&self, value: Value) {
        self.set.lock().remove(value);
    }

    pub fn protected_count(&self) -> usize {
        self.set.lock().len()
    }
}

impl std::fmt::Debug for SharedRoots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRoots")
            .field("protected", &self.protected_count())
            .finish()
    }
}

// ============================================================================
// MachineStack - registered word range
// ============================================================================

/// A growable range of words scanned conservatively on every collection.
///
/// Interpreter code pushes the values it is working with; anything in the
/// range keeps what it points at alive, including words that only look like
/// pointers.
#[derive(Debug, Default)]
pub struct MachineStack {
    words: Mutex<Vec<Value>>,
}

impl MachineStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: Value) {
        self.words.lock().push(value);
    }

    pub fn pop(&self) -> Option<Value> {
        self.words.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.words.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.lock().is_empty()
    }

    pub fn truncate(&self, len: usize) {
        self.words.lock().truncate(len);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.words.lock().get(index).copied()
    }

    /// Scope guard that restores the current depth when dropped.
    pub fn frame(&self) -> StackFrame<'_> {
        StackFrame {
            stack: self,
            depth: self.len(),
        }
    }

    pub(crate) fn scan(&self, visitor: &mut dyn FnMut(Value)) {
        for &word in self.words.lock().iter() {
            visitor(word);
        }
    }
}

/// Pops everything pushed after it was created.
pub struct StackFrame<'a> {
    stack: &'a MachineStack,
    depth: usize,
}

impl StackFrame<'_> {
    pub fn push(&self, value: Value) {
        self.stack.push(value);
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        self.stack.truncate(self.depth);
    }
}

// ============================================================================
// Thread registry
// ============================================================================

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    next_id: AtomicU64,
    stacks: Mutex<Vec<(u64, Arc<MachineStack>)>>,
}

impl ThreadRegistry {
    fn unregister(&self, id: u64) {
        self.stacks.lock().retain(|(other, _)| *other != id);
        log::debug!("unregistered thread stack {}", id);
    }

    pub(crate) fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    fn scan(&self, visitor: &mut dyn FnMut(Value)) {
        let stacks: Vec<Arc<MachineStack>> =
            self.stacks.lock().iter().map(|(_, s)| Arc::clone(s)).collect();
        for stack in stacks {
            stack.scan(visitor);
        }
    }
}

/// A worker thread's root stack, scanned until the registration is dropped.
pub struct ThreadRegistration {
    registry: Arc<ThreadRegistry>,
    id: u64,
    stack: Arc<MachineStack>,
}

impl ThreadRegistration {
    pub fn stack(&self) -> &MachineStack {
        &self.stack
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

// ============================================================================
// RootSet
// ============================================================================

/// Everything a collection marks from, owned by the heap handle.
pub(crate) struct RootSet {
    protected: RefCell<ProtectedValues>,
    stack: Arc<MachineStack>,
    threads: Arc<ThreadRegistry>,
    providers: RefCell<Vec<Weak<dyn RootProvider>>>,
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self {
            protected: RefCell::new(ProtectedValues::Local(ProtectCountSet::default())),
            stack: Arc::new(MachineStack::new()),
            threads: Arc::new(ThreadRegistry::default()),
            providers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn protect(&self, value: Value) {
        if !value.is_cell() {
            return;
        }
        match &mut *self.protected.borrow_mut() {
            ProtectedValues::Local(set) => set.add(value),
            ProtectedValues::Locked(set) => set.lock().add(value),
        }
    }

    pub(crate) fn unprotect(&self, value: Value) {
        if !value.is_cell() {
            return;
        }
        match &mut *self.protected.borrow_mut() {
            ProtectedValues::Local(set) => set.remove(value),
            ProtectedValues::Locked(set) => set.lock().remove(value),
        };
    }

    /// Move the protected set behind a mutex. Idempotent.
    pub(crate) fn enable_locking(&self) {
        let mut protected = self.protected.borrow_mut();
        if let ProtectedValues::Local(set) = &mut *protected {
            let set = std::mem::take(set);
            log::debug!("protected set now locked ({} values)", set.len());
            *protected = ProtectedValues::Locked(Arc::new(Mutex::new(set)));
        }
    }

    pub(crate) fn shared(&self) -> Option<SharedRoots> {
        match &*self.protected.borrow() {
            ProtectedValues::Local(_) => None,
            ProtectedValues::Locked(set) => Some(SharedRoots {
                set: Arc::clone(set),
            }),
        }
    }

    pub(crate) fn protected_values(&self) -> Vec<Value> {
        match &*self.protected.borrow() {
            ProtectedValues::Local(set) => set.values().collect(),
            ProtectedValues::Locked(set) => set.lock().values().collect(),
        }
    }

    pub(crate) fn protect_count(&self, value: Value) -> usize {
        match &*self.protected.borrow() {
            ProtectedValues::Local(set) => set.count(value),
            ProtectedValues::Locked(set) => set.lock().count(value),
        }
    }

    pub(crate) fn stack(&self) -> &MachineStack {
        &self.stack
    }

    pub(crate) fn register_thread(&self) -> ThreadRegistration {
        let id = self.threads.next_id.fetch_add(1, Ordering::Relaxed);
        let stack = Arc::new(MachineStack::new());
        self.threads.stacks.lock().push((id, Arc::clone(&stack)));
        log::debug!("registered thread stack {}", id);
        ThreadRegistration {
            registry: Arc::clone(&self.threads),
            id,
            stack,
        }
    }

    pub(crate) fn registered_threads(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn add_provider(&self, provider: &Rc<dyn RootProvider>) {
        self.providers.borrow_mut().push(Rc::downgrade(provider));
    }

    /// Feed every root word to `visitor`. Dead providers are dropped.
    pub(crate) fn visit(&self, visitor: &mut dyn FnMut(Value)) {
        for value in self.protected_values() {
            visitor(value);
        }
        self.stack.scan(visitor);
        self.threads.scan(visitor);

        let providers: Vec<Rc<dyn RootProvider>> = {
            let mut providers = self.providers.borrow_mut();
            providers.retain(|p| p.strong_count() > 0);
            providers.iter().filter_map(Weak::upgrade).collect()
        };
        for provider in providers {
            provider.visit_roots(visitor);
        }
    }
}
