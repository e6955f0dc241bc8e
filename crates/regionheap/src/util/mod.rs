//! Util Module - Shared Utilities
//!
//! Utilities and constants used throughout the region heap.

pub mod alignment;

pub use alignment::Alignment;

/// Constants for the region heap
pub mod constants {
    /// 1 Kilobyte
    pub const KB: usize = 1024;
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
    /// 1 Gigabyte
    pub const GB: usize = 1024 * 1024 * 1024;

    /// Granule of region allocation: 256KB
    ///
    /// Every region spans a whole number of units.
    pub const UNIT_SIZE: usize = 256 * KB;

    /// Objects above this size get a dedicated large region
    pub const LARGE_OBJECT_THRESHOLD: usize = UNIT_SIZE / 2;

    /// Size-class granularity of fixed-size pinned regions: 8 bytes
    pub const FIXED_PINNED_GRANULE: usize = 8;

    /// Number of fixed-size pinned size classes
    ///
    /// Class `i` holds objects of exactly `(i + 1) * 8` bytes.
    pub const FIXED_PINNED_CLASS_COUNT: usize = 128;

    /// Largest object served from a fixed-size pinned class: 1KB
    pub const FIXED_PINNED_MAX_SIZE: usize = FIXED_PINNED_GRANULE * FIXED_PINNED_CLASS_COUNT;

    /// Default object alignment: 8 bytes
    pub const DEFAULT_ALIGNMENT: usize = 8;

    /// Window size for 4 GiB-aligned arenas
    pub const FOUR_GB: usize = 4 * GB;
}
