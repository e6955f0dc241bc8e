//! Alignment Utilities
//!
//! Helper functions for memory alignment.

/// Alignment - utility for alignment operations
///
/// All alignments must be powers of two.
pub struct Alignment;

impl Alignment {
    /// Align value up to boundary
    ///
    /// Returns `None` when rounding up would overflow.
    ///
    /// # Examples
    /// ```
    /// use regionheap::util::Alignment;
    ///
    /// assert_eq!(Alignment::align_up(100, 8), Some(104));
    /// assert_eq!(Alignment::align_up(64, 8), Some(64));
    /// assert_eq!(Alignment::align_up(usize::MAX, 8), None);
    /// ```
    pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
        debug_assert!(alignment.is_power_of_two());
        value
            .checked_add(alignment - 1)
            .map(|v| v & !(alignment - 1))
    }

    /// Align value down to boundary
    pub fn align_down(value: usize, alignment: usize) -> usize {
        debug_assert!(alignment.is_power_of_two());
        value & !(alignment - 1)
    }

    /// Check if value is aligned
    pub fn is_aligned(value: usize, alignment: usize) -> bool {
        value & (alignment - 1) == 0
    }

    /// Round an object size up to the default object alignment
    ///
    /// Zero-sized requests still occupy one granule so every object has a
    /// distinct address.
    pub fn object_size(size: usize) -> Option<usize> {
        Self::align_up(size.max(1), Self::DEFAULT)
    }

    /// Default object alignment (8 bytes)
    pub const DEFAULT: usize = super::constants::DEFAULT_ALIGNMENT;
}
