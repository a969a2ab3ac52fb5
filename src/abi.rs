//! Layout facts for compiled fast paths.
//!
//! Everything here is fixed at build time. Generated code may hard-code
//! these values; the assertions below catch layout drift.

use std::mem::{offset_of, size_of};

use crate::cell::ObjectCell;
use crate::gc::block::{NumberBlock, PrimaryBlock};
use crate::shape::{ShapeId, ShapeRecord};

pub use crate::gc::block::{BLOCK_MASK, BLOCK_SIZE, CELL_SIZE, SMALL_CELL_SIZE};
pub use crate::shape::NOT_FOUND_OFFSET;
pub use crate::value::{
    EXTENDED_PAYLOAD_BIT_BOOL_VALUE, EXTENDED_PAYLOAD_SHIFT, EXTENDED_TAG_BIT_BOOL,
    EXTENDED_TAG_BIT_UNDEFINED, EXTENDED_TAG_MASK, FULL_TAG_TYPE_BOOL, FULL_TAG_TYPE_MASK,
    FULL_TAG_TYPE_NULL, FULL_TAG_TYPE_UNDEFINED, INTEGER_PAYLOAD_SHIFT, TAG_BIT_TYPE_INTEGER,
    TAG_BIT_TYPE_OTHER, TAG_MASK,
};

/// Byte offset of the shape id in an object cell.
pub const CELL_SHAPE_OFFSET: usize = offset_of!(ObjectCell, shape);

/// Width of the shape id at [`CELL_SHAPE_OFFSET`].
pub const CELL_SHAPE_SIZE: usize = size_of::<ShapeId>();

/// Byte offset of the cached transition offset in a shape record. Holds
/// [`NOT_FOUND_OFFSET`] when the shape was not reached by adding a property.
pub const SHAPE_CACHED_TRANSITION_OFFSET: usize = offset_of!(ShapeRecord, cached_transition_offset);

/// Offset of the first cell from its block base, per pool.
pub const PRIMARY_CELLS_OFFSET: usize = offset_of!(PrimaryBlock, slots);
pub const NUMBER_CELLS_OFFSET: usize = offset_of!(NumberBlock, slots);

const _: () = assert!(CELL_SHAPE_OFFSET == 0);
const _: () = assert!(SHAPE_CACHED_TRANSITION_OFFSET == 0);
const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(PRIMARY_CELLS_OFFSET < BLOCK_SIZE && NUMBER_CELLS_OFFSET < BLOCK_SIZE);
