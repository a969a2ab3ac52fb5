//! Tagged value representation
//!
//! A [`Value`] is one machine word. Cell references are word aligned, so the
//! low two bits of a cell address are always `00`; every other pattern is an
//! immediate whose type is recoverable from the bits alone.
//!
//! ```text
//! cell reference   pppp...pppppp00   (address of a heap cell)
//! integer          iiii...iiiiiii1   (31-bit signed payload, shift 1)
//! null             0000...00000010
//! boolean          0000...000V0110   (V = value bit at payload shift 4)
//! undefined        0000...00001010
//! ```
//!
//! Integers are limited to 31 bits on every target so that compiled fast
//! paths behave identically on 32- and 64-bit hosts. Numbers that do not fit
//! (including negative zero) are boxed in the heap's number pool.

use std::fmt;

/// Trait for types that have cheap (O(1), reference-counted) clones.
///
/// Makes it explicit at call sites that a clone only bumps a reference count,
/// as with [`Identifier`](crate::Identifier) or shared name lists.
pub trait CheapClone: Clone {
    /// Semantically identical to `clone()`, but documents that it is O(1).
    fn cheap_clone(&self) -> Self {
        self.clone()
    }
}

impl<T: ?Sized> CheapClone for std::rc::Rc<T> {}

// ============================================================================
// Bit layout
// ============================================================================

/// Primary tag is the low two bits.
pub const TAG_MASK: usize = 0x3;
/// Low bit set: 31-bit integer. Dominates the next bit.
pub const TAG_BIT_TYPE_INTEGER: usize = 0x1;
/// Second bit set: immediate other than an integer.
pub const TAG_BIT_TYPE_OTHER: usize = 0x2;

pub const EXTENDED_TAG_MASK: usize = 0xC;
pub const EXTENDED_TAG_BIT_BOOL: usize = 0x4;
pub const EXTENDED_TAG_BIT_UNDEFINED: usize = 0x8;

pub const FULL_TAG_TYPE_MASK: usize = TAG_MASK | EXTENDED_TAG_MASK;
pub const FULL_TAG_TYPE_BOOL: usize = TAG_BIT_TYPE_OTHER | EXTENDED_TAG_BIT_BOOL;
pub const FULL_TAG_TYPE_UNDEFINED: usize = TAG_BIT_TYPE_OTHER | EXTENDED_TAG_BIT_UNDEFINED;
pub const FULL_TAG_TYPE_NULL: usize = TAG_BIT_TYPE_OTHER;

pub const INTEGER_PAYLOAD_SHIFT: u32 = 1;
pub const EXTENDED_PAYLOAD_SHIFT: u32 = 4;
pub const EXTENDED_PAYLOAD_BIT_BOOL_VALUE: usize = 1 << EXTENDED_PAYLOAD_SHIFT;

/// Smallest integer representable as an immediate (-2^30).
pub const MIN_IMMEDIATE_INT: i32 = i32::MIN >> INTEGER_PAYLOAD_SHIFT;
/// Largest integer representable as an immediate (2^30 - 1).
pub const MAX_IMMEDIATE_INT: i32 = i32::MAX >> INTEGER_PAYLOAD_SHIFT;

const SIGN_BIT: usize = 1 << (usize::BITS - 1);

/// Integer tag plus every bit at or above bit 30. A value passes the
/// additive guard only when all of those bits except the tag are clear,
/// i.e. a non-negative integer below 2^29, so a sum of two never overflows.
const FAST_ADDITIVE_MASK: usize = !((1usize << 30) - 1) | TAG_BIT_TYPE_INTEGER;

// ============================================================================
// Value
// ============================================================================

/// A tagged machine word: either an immediate or the address of a heap cell.
///
/// Equality is bit-pattern equality, so `true`, `false`, `undefined` and
/// `null` are singletons and cells compare by identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(usize);

/// Decoded form of an immediate [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmediateKind {
    Integer(i32),
    Boolean(bool),
    Undefined,
    Null,
}

impl Value {
    pub const UNDEFINED: Value = Value(FULL_TAG_TYPE_UNDEFINED);
    pub const NULL: Value = Value(FULL_TAG_TYPE_NULL);
    pub const TRUE: Value = Value(FULL_TAG_TYPE_BOOL | EXTENDED_PAYLOAD_BIT_BOOL_VALUE);
    pub const FALSE: Value = Value(FULL_TAG_TYPE_BOOL);
    pub const ZERO: Value = Value::make_int(0);
    pub const ONE: Value = Value::make_int(1);

    /// Reinterpret a raw word. Any word is a valid `Value`; whether a cell
    /// address is live is only ever decided by the heap.
    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Value(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub(crate) fn from_cell_address(address: usize) -> Self {
        debug_assert_eq!(address & TAG_MASK, 0, "cell address not aligned");
        Value(address)
    }

    #[inline(always)]
    pub const fn boolean(b: bool) -> Self {
        Value(((b as usize) << EXTENDED_PAYLOAD_SHIFT) | FULL_TAG_TYPE_BOOL)
    }

    #[inline(always)]
    const fn make_int(value: i32) -> Self {
        Value((((value as isize) << INTEGER_PAYLOAD_SHIFT) as usize) | TAG_BIT_TYPE_INTEGER)
    }

    // ── Predicates ─────────────────────────────────────────────────

    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        self.0 & TAG_MASK != 0
    }

    /// A non-zero word with a clear tag. Whether it names a live cell is a
    /// question for the heap.
    #[inline(always)]
    pub const fn is_cell(self) -> bool {
        (self.0 & TAG_MASK == 0) & (self.0 != 0)
    }

    /// True for immediate integers. Boxed doubles are cells.
    #[inline(always)]
    pub const fn is_number(self) -> bool {
        self.0 & TAG_BIT_TYPE_INTEGER != 0
    }

    #[inline(always)]
    pub const fn is_positive_number(self) -> bool {
        self.0 & (SIGN_BIT | TAG_BIT_TYPE_INTEGER) == TAG_BIT_TYPE_INTEGER
    }

    #[inline(always)]
    pub const fn is_boolean(self) -> bool {
        self.0 & FULL_TAG_TYPE_MASK == FULL_TAG_TYPE_BOOL
    }

    #[inline(always)]
    pub const fn is_undefined_or_null(self) -> bool {
        self.0 & !EXTENDED_TAG_BIT_UNDEFINED == FULL_TAG_TYPE_NULL
    }

    #[inline(always)]
    pub const fn is_undefined(self) -> bool {
        self.0 == FULL_TAG_TYPE_UNDEFINED
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == FULL_TAG_TYPE_NULL
    }

    #[inline(always)]
    pub const fn is_either_immediate(a: Value, b: Value) -> bool {
        (a.0 | b.0) & TAG_MASK != 0
    }

    #[inline(always)]
    pub const fn are_both_immediate(a: Value, b: Value) -> bool {
        a.is_immediate() & b.is_immediate()
    }

    #[inline(always)]
    pub const fn are_both_immediate_numbers(a: Value, b: Value) -> bool {
        a.0 & b.0 & TAG_BIT_TYPE_INTEGER != 0
    }

    /// Guard for the additive fast paths: a non-negative integer below 2^29.
    #[inline(always)]
    pub const fn can_do_fast_additive_operations(self) -> bool {
        self.0 & FAST_ADDITIVE_MASK == TAG_BIT_TYPE_INTEGER
    }

    // ── Construction from numbers ──────────────────────────────────

    #[inline]
    pub const fn from_i32(i: i32) -> Option<Self> {
        if (i < MIN_IMMEDIATE_INT) | (i > MAX_IMMEDIATE_INT) {
            return None;
        }
        Some(Value::make_int(i))
    }

    #[inline]
    pub const fn from_u32(i: u32) -> Option<Self> {
        if i > MAX_IMMEDIATE_INT as u32 {
            return None;
        }
        Some(Value::make_int(i as i32))
    }

    #[inline]
    pub const fn from_i64(i: i64) -> Option<Self> {
        if (i < MIN_IMMEDIATE_INT as i64) | (i > MAX_IMMEDIATE_INT as i64) {
            return None;
        }
        Some(Value::make_int(i as i32))
    }

    #[inline]
    pub const fn from_u64(i: u64) -> Option<Self> {
        if i > MAX_IMMEDIATE_INT as u64 {
            return None;
        }
        Some(Value::make_int(i as i32))
    }

    /// Encode a double as an immediate integer when that loses nothing.
    ///
    /// Fails for fractional values, NaN, infinities, values outside the
    /// 31-bit range and negative zero (whose sign must survive).
    #[inline]
    pub fn from_f64(d: f64) -> Option<Self> {
        let int_val = d as i32;
        if (int_val < MIN_IMMEDIATE_INT) | (int_val > MAX_IMMEDIATE_INT) {
            return None;
        }
        if int_val as f64 != d || (int_val == 0 && d.is_sign_negative()) {
            return None;
        }
        Some(Value::make_int(int_val))
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Integer payload, or `None` if this is not an immediate integer.
    #[inline]
    pub const fn as_i32(self) -> Option<i32> {
        if self.is_number() {
            Some(self.int_value())
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_u32(self) -> Option<u32> {
        if self.is_positive_number() {
            Some(self.int_value() as u32)
        } else {
            None
        }
    }

    #[inline]
    pub const fn as_bool(self) -> Option<bool> {
        if self.is_boolean() {
            Some(self.0 & EXTENDED_PAYLOAD_BIT_BOOL_VALUE != 0)
        } else {
            None
        }
    }

    #[inline(always)]
    const fn int_value(self) -> i32 {
        ((self.0 as isize) >> INTEGER_PAYLOAD_SHIFT) as i32
    }

    /// Numeric value of an immediate. Cells yield `None`.
    pub fn to_f64(self) -> Option<f64> {
        if !self.is_immediate() {
            return None;
        }
        if self.is_number() {
            return Some(self.int_value() as f64);
        }
        if self.0 == FULL_TAG_TYPE_UNDEFINED {
            return Some(f64::NAN);
        }
        Some((self.0 >> EXTENDED_PAYLOAD_SHIFT) as f64)
    }

    /// ToBoolean for immediates. Cells are truthy, except that boxed numbers
    /// need the heap ([`Heap::to_boolean`](crate::Heap::to_boolean)).
    pub const fn to_boolean(self) -> bool {
        if !self.is_immediate() {
            return true;
        }
        if self.0 & TAG_BIT_TYPE_INTEGER != 0 {
            self.0 != TAG_BIT_TYPE_INTEGER
        } else {
            self.0 == FULL_TAG_TYPE_BOOL | EXTENDED_PAYLOAD_BIT_BOOL_VALUE
        }
    }

    pub const fn immediate_kind(self) -> Option<ImmediateKind> {
        if self.is_number() {
            return Some(ImmediateKind::Integer(self.int_value()));
        }
        match self.0 {
            FULL_TAG_TYPE_NULL => Some(ImmediateKind::Null),
            FULL_TAG_TYPE_UNDEFINED => Some(ImmediateKind::Undefined),
            _ if self.is_boolean() => Some(ImmediateKind::Boolean(
                self.0 & EXTENDED_PAYLOAD_BIT_BOOL_VALUE != 0,
            )),
            _ => None,
        }
    }

    // ── Fast paths ─────────────────────────────────────────────────
    //
    // These operate on tagged words directly. The caller must have checked
    // the guard named in each doc comment.

    /// Requires `can_do_fast_additive_operations` on both operands.
    #[inline(always)]
    pub fn add_immediate_numbers(a: Value, b: Value) -> Value {
        debug_assert!(a.can_do_fast_additive_operations());
        debug_assert!(b.can_do_fast_additive_operations());
        Value(a.0.wrapping_add(b.0).wrapping_sub(TAG_BIT_TYPE_INTEGER))
    }

    /// Requires `can_do_fast_additive_operations` on both operands.
    #[inline(always)]
    pub fn sub_immediate_numbers(a: Value, b: Value) -> Value {
        debug_assert!(a.can_do_fast_additive_operations());
        debug_assert!(b.can_do_fast_additive_operations());
        Value(a.0.wrapping_sub(b.0).wrapping_add(TAG_BIT_TYPE_INTEGER))
    }

    /// Requires `can_do_fast_additive_operations`.
    #[inline(always)]
    pub fn increment(self) -> Value {
        debug_assert!(self.can_do_fast_additive_operations());
        Value(self.0.wrapping_add(1 << INTEGER_PAYLOAD_SHIFT))
    }

    /// Requires `can_do_fast_additive_operations`.
    #[inline(always)]
    pub fn decrement(self) -> Value {
        debug_assert!(self.can_do_fast_additive_operations());
        Value(self.0.wrapping_sub(1 << INTEGER_PAYLOAD_SHIFT))
    }

    /// Requires `are_both_immediate_numbers`.
    #[inline(always)]
    pub fn and_immediate_numbers(a: Value, b: Value) -> Value {
        debug_assert!(Value::are_both_immediate_numbers(a, b));
        Value(a.0 & b.0)
    }

    /// Requires `are_both_immediate_numbers`.
    #[inline(always)]
    pub fn or_immediate_numbers(a: Value, b: Value) -> Value {
        debug_assert!(Value::are_both_immediate_numbers(a, b));
        Value(a.0 | b.0)
    }

    /// Requires `are_both_immediate_numbers`.
    #[inline(always)]
    pub fn xor_immediate_numbers(a: Value, b: Value) -> Value {
        debug_assert!(Value::are_both_immediate_numbers(a, b));
        Value((a.0 ^ b.0) | TAG_BIT_TYPE_INTEGER)
    }

    /// Arithmetic right shift by the low five bits of `shift`.
    /// Requires `are_both_immediate_numbers`.
    #[inline(always)]
    pub fn right_shift_immediate_numbers(value: Value, shift: Value) -> Value {
        debug_assert!(Value::are_both_immediate_numbers(value, shift));
        let amount = (shift.0 >> INTEGER_PAYLOAD_SHIFT) & 0x1f;
        Value((((value.0 as isize) >> amount) as usize) | TAG_BIT_TYPE_INTEGER)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::UNDEFINED
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::boolean(b)
    }
}

impl From<i8> for Value {
    fn from(i: i8) -> Self {
        Value::make_int(i as i32)
    }
}

impl From<u8> for Value {
    fn from(i: u8) -> Self {
        Value::make_int(i as i32)
    }
}

impl From<i16> for Value {
    fn from(i: i16) -> Self {
        Value::make_int(i as i32)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::make_int(i as i32)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.immediate_kind() {
            Some(ImmediateKind::Integer(i)) => write!(f, "{}", i),
            Some(ImmediateKind::Boolean(b)) => write!(f, "{}", b),
            Some(ImmediateKind::Undefined) => write!(f, "undefined"),
            Some(ImmediateKind::Null) => write!(f, "null"),
            None if self.is_cell() => write!(f, "Cell(0x{:x})", self.0),
            None => write!(f, "Raw(0x{:x})", self.0),
        }
    }
}
