//! Interpreter register file.
//!
//! One fixed reservation holds the globals and the stack of call frames:
//!
//! ```text
//! | <- globals |        call frames        |   spare capacity   |
//! 0        start                         end                  start + capacity
//! ```
//!
//! Globals grow downward from `start`, so the index of an existing global
//! stays valid when more are added. Frame registers are addressed from
//! `start`. The whole used range is scanned conservatively as a root.

use std::cell::Cell;

use crate::error::HeapError;
use crate::gc::roots::RootProvider;
use crate::value::Value;

pub const DEFAULT_CAPACITY: usize = 512 * 1024;
pub const DEFAULT_MAX_GLOBALS: usize = 8 * 1024;

/// Slots of a call frame header, as offsets below the frame's first
/// argument register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFrameHeaderEntry {
    CodeBlock,
    ScopeChain,
    CallerRegisters,
    ReturnPc,
    ReturnValueRegister,
    ArgumentCount,
    Callee,
    OptionalCalleeActivation,
    OptionalCalleeArguments,
}

impl CallFrameHeaderEntry {
    pub const HEADER_SIZE: usize = 9;

    pub const fn offset(self) -> isize {
        match self {
            CallFrameHeaderEntry::CodeBlock => -9,
            CallFrameHeaderEntry::ScopeChain => -8,
            CallFrameHeaderEntry::CallerRegisters => -7,
            CallFrameHeaderEntry::ReturnPc => -6,
            CallFrameHeaderEntry::ReturnValueRegister => -5,
            CallFrameHeaderEntry::ArgumentCount => -4,
            CallFrameHeaderEntry::Callee => -3,
            CallFrameHeaderEntry::OptionalCalleeActivation => -2,
            CallFrameHeaderEntry::OptionalCalleeArguments => -1,
        }
    }
}

pub struct RegisterFile {
    registers: Box<[Cell<Value>]>,
    max_globals: usize,
    num_globals: Cell<usize>,
    /// Frame registers in use, measured from `start`.
    len: Cell<usize>,
    capacity: usize,
    global_object: Cell<Value>,
}

impl RegisterFile {
    pub fn new(capacity: usize, max_globals: usize) -> Self {
        let registers = (0..capacity + max_globals)
            .map(|_| Cell::new(Value::UNDEFINED))
            .collect();
        Self {
            registers,
            max_globals,
            num_globals: Cell::new(0),
            len: Cell::new(0),
            capacity,
            global_object: Cell::new(Value::UNDEFINED),
        }
    }

    fn start(&self) -> usize {
        self.max_globals
    }

    /// Frame registers in use.
    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Extend the in-use range to `new_len` registers. Shrinking requests
    /// are ignored.
    pub fn grow(&self, new_len: usize) -> Result<(), HeapError> {
        if new_len > self.len() {
            if new_len > self.capacity {
                return Err(HeapError::register_file_exhausted(new_len, self.capacity));
            }
            self.len.set(new_len);
        }
        Ok(())
    }

    /// Cut the in-use range back to `new_len`. Growing requests are ignored.
    pub fn shrink(&self, new_len: usize) {
        if new_len < self.len() {
            let start = self.start();
            for register in self.registers.get(start + new_len..start + self.len()).into_iter().flatten() {
                register.set(Value::UNDEFINED);
            }
            self.len.set(new_len);
        }
    }

    pub fn num_globals(&self) -> usize {
        self.num_globals.get()
    }

    pub fn max_globals(&self) -> usize {
        self.max_globals
    }

    pub fn set_num_globals(&self, count: usize) -> Result<(), HeapError> {
        if count > self.max_globals {
            return Err(HeapError::TooManyGlobals {
                requested: count,
                max: self.max_globals,
            });
        }
        self.num_globals.set(count);
        Ok(())
    }

    fn global_slot(&self, index: usize) -> Option<&Cell<Value>> {
        if index >= self.num_globals() {
            return None;
        }
        self.registers.get(self.start() - 1 - index)
    }

    pub fn global(&self, index: usize) -> Option<Value> {
        self.global_slot(index).map(Cell::get)
    }

    /// Returns false if `index` is not a declared global.
    pub fn set_global(&self, index: usize, value: Value) -> bool {
        self.global_slot(index).map(|slot| slot.set(value)).is_some()
    }

    fn frame_slot(&self, index: usize) -> Option<&Cell<Value>> {
        if index >= self.len() {
            return None;
        }
        self.registers.get(self.start() + index)
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.frame_slot(index).map(Cell::get)
    }

    /// Returns false if `index` is past the in-use range.
    pub fn set(&self, index: usize, value: Value) -> bool {
        self.frame_slot(index).map(|slot| slot.set(value)).is_some()
    }

    pub fn global_object(&self) -> Value {
        self.global_object.get()
    }

    pub fn set_global_object(&self, global: Value) {
        self.global_object.set(global);
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_GLOBALS)
    }
}

impl RootProvider for RegisterFile {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value)) {
        visitor(self.global_object());
        let start = self.start();
        let globals = start - self.num_globals()..start;
        let frames = start..start + self.len();
        for range in [globals, frames] {
            for register in self.registers.get(range).into_iter().flatten() {
                visitor(register.get());
            }
        }
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile")
            .field("num_globals", &self.num_globals())
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
