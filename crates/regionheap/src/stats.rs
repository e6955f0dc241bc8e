//! Heap Statistics
//!
//! Point-in-time snapshots of the region heap, serializable to JSON for
//! monitoring endpoints and test diagnostics.

use serde::Serialize;

/// Totals for one region list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListStats {
    /// List name, e.g. `RecentFull` or `FixedPinned(3)`
    pub list: String,
    pub regions: usize,
    pub units: usize,
    pub allocated_bytes: usize,
}

/// Heap-wide snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct HeapStats {
    pub unit_size: usize,
    pub total_units: usize,

    /// Units handed out at least once since the heap was created
    pub inactive_zone: usize,

    /// Bytes of all regions currently in a list
    pub used_region_bytes: usize,
    pub allocated_bytes: usize,
    pub survived_bytes: usize,

    /// Free bytes still backed by memory
    pub dirty_cached_bytes: usize,
    /// Free bytes returned to the OS
    pub released_bytes: usize,
    pub reclaimed_units: usize,

    pub arena_used_bytes: usize,
    pub arena_mapped_bytes: usize,

    /// Completed collection cycles
    pub gc_count: u64,

    /// Non-empty lists only
    pub lists: Vec<ListStats>,
}

impl HeapStats {
    /// Fraction of the arena's units handed out at least once
    pub fn utilization(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            self.inactive_zone as f64 / self.total_units as f64
        }
    }

    /// Units neither handed out nor cached
    pub fn untouched_units(&self) -> usize {
        self.total_units.saturating_sub(self.inactive_zone)
    }

    /// Stats of one list by name
    pub fn list(&self, name: &str) -> Option<&ListStats> {
        self.lists.iter().find(|l| l.list == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
