//! GC Phase Module - Collector Phase Seen by the Heap
//!
//! The heap does not run collections itself. It only needs to know which
//! phase the collector is in, to tag freshly taken regions and to check
//! that to-space regions are only produced while a collection is running.

use std::sync::atomic::{AtomicU8, Ordering};

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub enum GcPhase {
    /// No collection in progress
    #[default]
    Idle = 0,
    /// Root enumeration
    Enum = 1,
    /// Concurrent marking
    Mark = 2,
    /// Remark of SATB buffers
    RemarkSatb = 3,
    /// Work after marking completes
    PostMark = 4,
    /// Preparing forwarding
    Precopy = 5,
    /// Evacuation of from-space
    Copy = 6,
    /// Reference fixing
    Fix = 7,
}

impl GcPhase {
    pub fn from_u8(value: u8) -> GcPhase {
        match value {
            1 => GcPhase::Enum,
            2 => GcPhase::Mark,
            3 => GcPhase::RemarkSatb,
            4 => GcPhase::PostMark,
            5 => GcPhase::Precopy,
            6 => GcPhase::Copy,
            7 => GcPhase::Fix,
            _ => GcPhase::Idle,
        }
    }

    /// Check if a collection has started
    pub fn is_gc_started(self) -> bool {
        self != GcPhase::Idle
    }

    /// Phases whose new regions need a trace line
    pub fn is_tracing(self) -> bool {
        matches!(
            self,
            GcPhase::Enum | GcPhase::Mark | GcPhase::RemarkSatb | GcPhase::PostMark
        )
    }

    /// Phases whose new regions need a copy line
    pub fn is_copying(self) -> bool {
        matches!(self, GcPhase::Precopy | GcPhase::Copy)
    }

    pub fn is_fixing(self) -> bool {
        self == GcPhase::Fix
    }
}

/// Shared, atomically updated phase cell
#[derive(Debug, Default)]
pub struct AtomicGcPhase(AtomicU8);

impl AtomicGcPhase {
    pub fn new(phase: GcPhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    #[inline]
    pub fn load(&self) -> GcPhase {
        GcPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, phase: GcPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_classes() {
        assert!(!GcPhase::Idle.is_gc_started());
        assert!(GcPhase::Enum.is_tracing());
        assert!(GcPhase::PostMark.is_tracing());
        assert!(!GcPhase::Precopy.is_tracing());
        assert!(GcPhase::Precopy.is_copying());
        assert!(GcPhase::Copy.is_copying());
        assert!(GcPhase::Fix.is_fixing());
        assert!(!GcPhase::Fix.is_copying());
    }

    #[test]
    fn test_atomic_phase_round_trip() {
        let phase = AtomicGcPhase::default();
        assert_eq!(phase.load(), GcPhase::Idle);

        for p in [GcPhase::Mark, GcPhase::Copy, GcPhase::Fix, GcPhase::Idle] {
            phase.store(p);
            assert_eq!(phase.load(), p);
        }
    }
}
