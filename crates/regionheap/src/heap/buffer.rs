//! Allocation Buffer - Per-Thread Region Bump Allocation
//!
//! Each mutator thread (and each collector thread that copies objects)
//! owns an [`AllocBuffer`]: one `ThreadLocal` region it bump-allocates into
//! without taking locks.
//!
//! ## How it works
//!
//! 1. Allocate by bumping the current region's pointer
//! 2. Region full: retire it and take a fresh region
//! 3. Objects above the large threshold bypass the buffer
//! 4. Buffer dropped: current region retired
//!
//! A retired mutator region becomes `RecentFull`. A retired collector region
//! holds evacuated objects and becomes `ToSpace`. Regions with outstanding
//! raw pointers become `RawPointerPinned` either way.

use crate::gc::GcPhase;
use crate::heap::manager::RegionManager;
use crate::heap::region::{RegionRole, NO_UNIT};
use crate::heap::region_list::ListId;
use crate::{heap_check, heap_fatal};
use crate::util::constants::LARGE_OBJECT_THRESHOLD;
use crate::util::Alignment;
use std::sync::Arc;

/// Who owns a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Mutator,
    Collector,
}

/// Thread-owned bump allocation buffer
#[derive(Debug)]
pub struct AllocBuffer {
    manager: Arc<RegionManager>,
    kind: BufferKind,
    region: u32,
    last_phase: GcPhase,
    allocated: usize,
}

impl AllocBuffer {
    pub fn new(manager: Arc<RegionManager>, kind: BufferKind) -> Self {
        Self {
            manager,
            kind,
            region: NO_UNIT,
            last_phase: GcPhase::Idle,
            allocated: 0,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Head unit of the current region, if any
    pub fn region(&self) -> Option<u32> {
        (self.region != NO_UNIT).then_some(self.region)
    }

    /// Bytes allocated through this buffer over its lifetime
    pub fn allocated_bytes(&self) -> usize {
        self.allocated
    }

    /// Allocate `size` bytes, rounded up to 8
    ///
    /// Mutator buffers may ask for a collection (`allow_gc`); collector
    /// buffers never do. Returns `None` when no region can be found.
    pub fn allocate(&mut self, size: usize, phase: GcPhase) -> Option<usize> {
        let size = Alignment::object_size(size)?;
        self.last_phase = phase;
        let allow_gc = self.kind == BufferKind::Mutator;

        if size > LARGE_OBJECT_THRESHOLD {
            let addr = self.manager.alloc_large(size, allow_gc, phase)?;
            self.allocated += size;
            return Some(addr);
        }

        if self.region != NO_UNIT {
            if let Some(addr) = self.manager.table().try_bump(self.region, size) {
                self.allocated += size;
                return Some(addr);
            }
        }

        self.refill(phase, allow_gc)?;
        let addr = self.manager.table().try_bump(self.region, size)?;
        self.allocated += size;
        Some(addr)
    }

    fn refill(&mut self, phase: GcPhase, allow_gc: bool) -> Option<()> {
        self.retire(phase);

        let head = self
            .manager
            .take_region(1, RegionRole::ThreadLocal, true, allow_gc)?;
        self.manager.tag_new_region(head, phase);
        self.manager
            .list(ListId::ThreadLocal)
            .prepend(self.manager.table(), head);
        self.region = head;
        Some(())
    }

    /// Give up the current region
    ///
    /// # Panics
    /// Retiring a collector buffer while no collection runs is an invariant
    /// violation.
    pub fn retire(&mut self, phase: GcPhase) {
        if self.region == NO_UNIT {
            return;
        }
        let head = std::mem::replace(&mut self.region, NO_UNIT);

        let unpinned = match self.kind {
            BufferKind::Mutator => ListId::RecentFull,
            BufferKind::Collector => {
                heap_check!(
                    phase.is_gc_started(),
                    "collector region {} retired outside a collection",
                    head
                );
                ListId::ToSpace
            },
        };

        if self
            .manager
            .move_by_raw_pointers(ListId::ThreadLocal, unpinned, head)
            .is_none()
        {
            heap_fatal!("buffer region {} left the thread-local list", head);
        }
    }
}

impl Drop for AllocBuffer {
    fn drop(&mut self) {
        let phase = self.last_phase;
        self.retire(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::util::constants::UNIT_SIZE;

    fn manager(units: usize) -> Arc<RegionManager> {
        let config = HeapConfig {
            heap_size: units * UNIT_SIZE,
            ..Default::default()
        };
        Arc::new(RegionManager::new(&config).unwrap())
    }

    #[test]
    fn test_bump_within_region() {
        let mgr = manager(4);
        let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Mutator);

        let a = buf.allocate(10, GcPhase::Idle).unwrap();
        let b = buf.allocate(16, GcPhase::Idle).unwrap();
        assert_eq!(b, a + 16);
        assert_eq!(buf.allocated_bytes(), 32);
        assert_eq!(mgr.list_of(buf.region().unwrap()), Some(ListId::ThreadLocal));
    }

    #[test]
    fn test_mutator_region_retires_to_recent_full() {
        let mgr = manager(4);
        let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Mutator);
        let first = buf.allocate(64 * 1024, GcPhase::Idle).unwrap();
        let first_region = mgr.table().region_of(first).unwrap();

        for _ in 0..4 {
            buf.allocate(64 * 1024, GcPhase::Idle).unwrap();
        }

        assert_ne!(buf.region(), Some(first_region));
        assert_eq!(mgr.list_of(first_region), Some(ListId::RecentFull));
    }

    #[test]
    fn test_collector_region_retires_to_to_space() {
        let mgr = manager(4);
        let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Collector);
        buf.allocate(64, GcPhase::Copy).unwrap();
        let region = buf.region().unwrap();
        assert_eq!(mgr.table().get(region).copy_line(), mgr.table().region_start(region));

        buf.retire(GcPhase::Copy);
        assert_eq!(mgr.list_of(region), Some(ListId::ToSpace));
        assert_eq!(buf.region(), None);
    }

    #[test]
    #[should_panic(expected = "retired outside a collection")]
    fn test_collector_retire_outside_gc_is_fatal() {
        let mgr = manager(4);
        let mut buf = AllocBuffer::new(mgr, BufferKind::Collector);
        buf.allocate(64, GcPhase::Idle).unwrap();
        buf.retire(GcPhase::Idle);
    }

    #[test]
    fn test_large_objects_bypass_buffer() {
        let mgr = manager(8);
        let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Mutator);
        let addr = buf.allocate(LARGE_OBJECT_THRESHOLD + 1, GcPhase::Idle).unwrap();

        assert_eq!(buf.region(), None);
        let head = mgr.table().region_of(addr).unwrap();
        assert_eq!(mgr.list_of(head), Some(ListId::RecentLarge));
    }

    #[test]
    fn test_raw_pointer_region_retires_pinned() {
        let mgr = manager(4);
        let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Mutator);
        let addr = buf.allocate(32, GcPhase::Idle).unwrap();
        let region = buf.region().unwrap();
        assert!(mgr.register_raw_pointer(addr));

        buf.retire(GcPhase::Idle);
        assert_eq!(mgr.list_of(region), Some(ListId::RawPointerPinned));
    }

    #[test]
    fn test_drop_retires_region() {
        let mgr = manager(4);
        let region = {
            let mut buf = AllocBuffer::new(mgr.clone(), BufferKind::Mutator);
            buf.allocate(8, GcPhase::Idle).unwrap();
            buf.region().unwrap()
        };
        assert_eq!(mgr.list_of(region), Some(ListId::RecentFull));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mgr = manager(1);
        let mut buf = AllocBuffer::new(mgr, BufferKind::Mutator);
        assert!(buf.allocate(UNIT_SIZE / 2, GcPhase::Idle).is_some());
        assert!(buf.allocate(UNIT_SIZE / 2, GcPhase::Idle).is_some());
        assert!(buf.allocate(8, GcPhase::Idle).is_none());
    }
}
