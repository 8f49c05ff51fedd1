//! Sizing limits for the handle table and continuation store

use crate::errors::{HandleError, Result};
use serde::{Deserialize, Serialize};

/// Bits of an id available for the (segment, slot) index. The bits above
/// carry the slot generation.
pub(crate) const INDEX_BITS: u32 = 24;
pub(crate) const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Geometry of one segmented id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaLimits {
    /// Slots per lazily allocated segment. Must be a power of two.
    pub slots_per_segment: u32,
    /// Hard ceiling on allocated segments.
    pub max_segments: u32,
}

impl Default for ArenaLimits {
    fn default() -> Self {
        Self {
            slots_per_segment: 1024,
            max_segments: 64,
        }
    }
}

impl ArenaLimits {
    pub fn new(slots_per_segment: u32, max_segments: u32) -> Self {
        Self {
            slots_per_segment,
            max_segments,
        }
    }

    /// Total number of ids that can be live at once.
    pub fn capacity(&self) -> u32 {
        self.slots_per_segment.saturating_mul(self.max_segments)
    }

    pub fn validate(&self, label: &str) -> Result<()> {
        if self.slots_per_segment == 0 || !self.slots_per_segment.is_power_of_two() {
            return Err(HandleError::InvalidLimits {
                reason: format!(
                    "{label}.slots_per_segment must be a non-zero power of two, got {}",
                    self.slots_per_segment
                ),
            });
        }
        if self.max_segments == 0 {
            return Err(HandleError::InvalidLimits {
                reason: format!("{label}.max_segments must be greater than zero"),
            });
        }
        let capacity = u64::from(self.slots_per_segment) * u64::from(self.max_segments);
        // Index zero is reserved, so the largest encoded index is `capacity`.
        if capacity > u64::from(INDEX_MASK) {
            return Err(HandleError::InvalidLimits {
                reason: format!(
                    "{label} capacity {capacity} exceeds the {INDEX_MASK} ids an id can encode"
                ),
            });
        }
        Ok(())
    }
}

/// Limits for a [`HandleTable`](crate::HandleTable) and its continuation store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableLimits {
    pub handles: ArenaLimits,
    pub continuations: ArenaLimits,
    /// Live handle count at which a client is reported as accumulating
    /// handles. Crossing it is a diagnostic, not an error.
    pub client_high_water: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            handles: ArenaLimits::default(),
            continuations: ArenaLimits::new(256, 16),
            client_high_water: 4096,
        }
    }
}

impl TableLimits {
    pub fn validate(&self) -> Result<()> {
        self.handles.validate("handles")?;
        self.continuations.validate("continuations")?;
        if self.client_high_water == 0 {
            return Err(HandleError::InvalidLimits {
                reason: "client_high_water must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
