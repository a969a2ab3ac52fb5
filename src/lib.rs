//! Object representation and memory management for a dynamic-language engine
//!
//! - [`Value`]: one machine word holding an immediate (31-bit integer,
//!   boolean, undefined, null) or a cell address
//! - [`ShapeArena`]: hidden classes mapping property names to storage
//!   offsets, shared between cells built the same way
//! - [`Heap`]: conservative mark-sweep collector over aligned cell blocks
//! - [`ScopedReference`]: keeps a value alive for a lexical scope
//!
//! # Example
//!
//! ```
//! use jsheap::{Attributes, Heap, IdentifierTable, ScopedReference, TypeInfo, Value};
//!
//! let heap = Heap::new();
//! let mut names = IdentifierTable::new();
//! let shape = heap.create_shape(Value::NULL, TypeInfo::object());
//!
//! let point = ScopedReference::new(heap.clone(), heap.allocate_object(shape));
//! let x = names.intern("x");
//! heap.put_direct(point.get(), &x, Value::from(3u8), Attributes::empty()).unwrap();
//!
//! heap.collect();
//! assert_eq!(heap.get(point.get(), &x).unwrap(), Some(Value::from(3u8)));
//! ```

pub mod abi;
pub mod cell;
pub mod config;
pub mod enumeration;
pub mod error;
pub mod gc;
pub mod identifier;
pub mod property_table;
pub mod register_file;
pub mod shape;
pub mod value;

pub use cell::{HostObject, Trace, Tracer};
pub use config::{HeapConfig, ShapeConfig};
pub use enumeration::PrototypeChain;
pub use error::HeapError;
pub use gc::roots::{MachineStack, RootProvider, SharedRoots, StackFrame, ThreadRegistration};
pub use gc::scoped::{ProtectRoots, ScopedReference};
pub use gc::{DecodedValue, Heap, HeapStatistics, PoolStatistics};
pub use identifier::{Identifier, IdentifierTable};
pub use property_table::{Attributes, PropertyEntry, PropertyStorage, PropertyTable};
pub use register_file::RegisterFile;
pub use shape::{CellType, ShapeArena, ShapeId, ShapeLayout, Transition, TypeFlags, TypeInfo};
pub use value::{CheapClone, ImmediateKind, Value};
