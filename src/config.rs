//! Heap and shape tunables.
//!
//! Every field has a default matching the collector's historical constants, so
//! `HeapConfig::default()` is the normal starting point. Configurations can
//! also be loaded from JSON; missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::HeapError;

/// Default number of allocations between automatic collections.
pub const DEFAULT_ALLOCATIONS_PER_COLLECTION: usize = 4000;

/// Default cap on blocks per pool (64 KiB each, so 1 GiB per pool).
pub const DEFAULT_MAX_BLOCKS: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Allocations (plus reported extra cost) between automatic collections.
    /// 0 disables automatic collection.
    pub allocations_per_collection: usize,
    /// Reservation cap per pool. Growing beyond it is fatal.
    pub max_blocks: usize,
    /// Empty blocks kept per pool after a sweep.
    pub spare_empty_blocks: usize,
    /// Extra memory costs at or below this are ignored.
    pub min_extra_cost: usize,
    pub shapes: ShapeConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            allocations_per_collection: DEFAULT_ALLOCATIONS_PER_COLLECTION,
            max_blocks: DEFAULT_MAX_BLOCKS,
            spare_empty_blocks: 2,
            min_extra_cost: 256,
            shapes: ShapeConfig::default(),
        }
    }
}

impl HeapConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, HeapError> {
        let config: HeapConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HeapError> {
        if self.max_blocks == 0 {
            return Err(HeapError::config("max_blocks must be at least 1"));
        }
        self.shapes.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeConfig {
    /// Transitions a shape may accumulate before additions fall back to
    /// dictionary mode.
    pub max_transition_length: usize,
    /// Maximum fraction of table slots holding keys or deletion sentinels.
    pub max_load_factor: f64,
    /// Slot count of a freshly created table. Must be a power of two.
    pub initial_table_size: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            max_transition_length: 64,
            max_load_factor: 0.5,
            initial_table_size: 16,
        }
    }
}

impl ShapeConfig {
    pub fn validate(&self) -> Result<(), HeapError> {
        if !(self.max_load_factor > 0.0 && self.max_load_factor <= 0.5) {
            return Err(HeapError::config(format!(
                "max_load_factor must be in (0, 0.5], got {}",
                self.max_load_factor
            )));
        }
        if self.initial_table_size < 4 || !self.initial_table_size.is_power_of_two() {
            return Err(HeapError::config(format!(
                "initial_table_size must be a power of two >= 4, got {}",
                self.initial_table_size
            )));
        }
        Ok(())
    }
}
