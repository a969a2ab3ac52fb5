//! Error types for the heap and object model

use thiserror::Error;

/// Recoverable errors raised by the object model and its configuration.
///
/// Lookup misses and non-representable numbers are not errors; they are
/// reported as `None` by the operations that produce them. Resource
/// exhaustion and re-entrancy are not recoverable and go through [`fatal`].
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("TypeError: cannot assign to read-only property at offset {offset}")]
    ReadOnly { offset: usize },

    #[error("TypeError: value is not an object cell")]
    NotAnObject,

    #[error("TypeError: shape is shared and cannot be mutated in place")]
    NotDictionary,

    #[error("RangeError: register file exhausted: requested {requested} registers, capacity {capacity}")]
    RegisterFileExhausted { requested: usize, capacity: usize },

    #[error("RangeError: {requested} globals exceed the reserved maximum of {max}")]
    TooManyGlobals { requested: usize, max: usize },

    #[error("ConfigError: {message}")]
    Config { message: String },

    #[error("ConfigError: {0}")]
    ConfigJson(#[from] serde_json::Error),
}

impl HeapError {
    pub fn read_only(offset: usize) -> Self {
        HeapError::ReadOnly { offset }
    }

    pub fn config(message: impl Into<String>) -> Self {
        HeapError::Config {
            message: message.into(),
        }
    }

    pub fn register_file_exhausted(requested: usize, capacity: usize) -> Self {
        HeapError::RegisterFileExhausted {
            requested,
            capacity,
        }
    }
}

/// Abort the engine on an unrecoverable condition.
///
/// Used for heap reservation exhaustion and for re-entering allocation or
/// collection. Release builds are compiled with `panic = "abort"`.
#[cold]
#[track_caller]
pub(crate) fn fatal(message: &str) -> ! {
    log::error!("fatal heap error: {}", message);
    #[allow(clippy::panic)]
    {
        panic!("fatal heap error: {}", message)
    }
}
