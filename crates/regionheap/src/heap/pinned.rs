//! Pinned Space - Unmovable and Large Object Allocation
//!
//! Objects that the concurrent collector must not move are allocated here:
//!
//! - **Fixed classes**: sizes up to 1KB, one region list per 8-byte size
//!   class. Dead cells go onto a per-region free-slot list and are reused
//!   for the same size only.
//! - **Recent pinned**: other pinned objects up to the large threshold,
//!   bump-allocated.
//! - **Large**: objects above the large threshold get a region of their own.
//!
//! Each class has a current region bumped lock-free. Refilling, free-slot
//! reuse and slot release go through the class lock. List byte totals pick
//! up target bumps when the target changes lists or statistics are read.

use crate::gc::GcPhase;
use crate::heap::manager::RegionManager;
use crate::heap::region::{RegionRole, NO_UNIT};
use crate::heap::region_list::ListId;
use crate::heap_fatal;
use crate::util::constants::{
    FIXED_PINNED_CLASS_COUNT, FIXED_PINNED_GRANULE, FIXED_PINNED_MAX_SIZE, LARGE_OBJECT_THRESHOLD,
    UNIT_SIZE,
};
use crate::util::Alignment;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
struct AllocTarget {
    lock: Mutex<()>,
    current: AtomicU32,
}

impl AllocTarget {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            current: AtomicU32::new(NO_UNIT),
        }
    }

    fn forget(&self, head: u32) {
        let _ = self
            .current
            .compare_exchange(head, NO_UNIT, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Current allocation targets of the pinned space
#[derive(Debug)]
pub(crate) struct PinnedSpace {
    recent: AllocTarget,
    classes: Box<[AllocTarget]>,
}

impl PinnedSpace {
    pub(crate) fn new() -> Self {
        Self {
            recent: AllocTarget::new(),
            classes: (0..FIXED_PINNED_CLASS_COUNT).map(|_| AllocTarget::new()).collect(),
        }
    }

    /// Check if a region is some pinned class's current bump target
    pub(crate) fn is_alloc_target(&self, head: u32) -> bool {
        self.recent.current.load(Ordering::Acquire) == head
            || self
                .classes
                .iter()
                .any(|c| c.current.load(Ordering::Acquire) == head)
    }

    /// Regions currently serving as bump targets
    pub(crate) fn alloc_targets(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(&self.recent)
            .chain(self.classes.iter())
            .map(|t| t.current.load(Ordering::Acquire))
            .filter(|&head| head != NO_UNIT)
    }

    pub(crate) fn forget_alloc_target(&self, head: u32) {
        self.recent.forget(head);
        for class in self.classes.iter() {
            class.forget(head);
        }
    }
}

/// Size class of a fixed pinned object, `size` already rounded to 8 bytes
#[inline]
pub fn fixed_class_of(size: usize) -> usize {
    size / FIXED_PINNED_GRANULE - 1
}

impl RegionManager {
    /// Allocate an object that the concurrent collector never moves
    ///
    /// # Arguments
    /// * `size` - Object size in bytes, rounded up to 8
    /// * `allow_gc` - Whether the caller may collect and retry on failure
    /// * `phase` - Current collector phase, used to tag new regions
    ///
    /// # Returns
    /// Zeroed memory, or `None` if no region could be found
    pub fn alloc_pinned(&self, size: usize, allow_gc: bool, phase: GcPhase) -> Option<usize> {
        let size = Alignment::object_size(size)?;
        if size > LARGE_OBJECT_THRESHOLD {
            return self.alloc_large(size, allow_gc, phase);
        }

        if size <= FIXED_PINNED_MAX_SIZE {
            let class = fixed_class_of(size);
            self.alloc_from_target(
                &self.pinned.classes[class],
                ListId::FixedPinned(class as u8),
                size,
                allow_gc,
                phase,
            )
        } else {
            self.alloc_from_target(&self.pinned.recent, ListId::RecentPinned, size, allow_gc, phase)
        }
    }

    /// Allocate an object in a region of its own
    ///
    /// The region spans as many units as `size` needs.
    pub fn alloc_large(&self, size: usize, allow_gc: bool, phase: GcPhase) -> Option<usize> {
        let size = Alignment::object_size(size)?;
        let units = u32::try_from(size.div_ceil(UNIT_SIZE)).ok()?;
        let head = self.take_region(units, RegionRole::RecentLarge, true, allow_gc)?;

        self.tag_new_region(head, phase);
        let Some(addr) = self.table.try_bump(head, size) else {
            heap_fatal!("fresh large region {} cannot hold {} bytes", head, size);
        };
        self.list(ListId::RecentLarge).prepend(&self.table, head);
        Some(addr)
    }

    fn alloc_from_target(
        &self,
        target: &AllocTarget,
        list_id: ListId,
        size: usize,
        allow_gc: bool,
        phase: GcPhase,
    ) -> Option<usize> {
        if let Some(addr) = self.bump_target(target, size) {
            return Some(addr);
        }

        let _guard = target.lock.lock();
        if let Some(addr) = self.bump_target(target, size) {
            return Some(addr);
        }

        if let ListId::FixedPinned(_) = list_id {
            if let Some(addr) = self.reuse_free_slot(list_id, size) {
                return Some(addr);
            }
        }

        let role = list_id.role();
        let head = self.take_region(1, role, true, allow_gc)?;
        if role == RegionRole::FixedPinned {
            self.table.get(head).set_cell_size(size as u32);
        }
        self.tag_new_region(head, phase);

        let Some(addr) = self.table.try_bump(head, size) else {
            heap_fatal!("fresh pinned region {} cannot hold {} bytes", head, size);
        };
        self.list(list_id).prepend(&self.table, head);
        target.current.store(head, Ordering::Release);
        Some(addr)
    }

    fn bump_target(&self, target: &AllocTarget, size: usize) -> Option<usize> {
        let head = target.current.load(Ordering::Acquire);
        if head == NO_UNIT {
            return None;
        }
        self.table.try_bump(head, size)
    }

    /// Fold bytes bumped into pinned targets into their lists' totals
    pub(crate) fn refresh_pinned_accounting(&self) {
        for head in self.pinned.alloc_targets() {
            if let Some(list_id) = self.list_of(head) {
                self.list(list_id).refresh_allocation(&self.table, head);
            }
        }
    }

    /// Caller holds the class lock
    fn reuse_free_slot(&self, list_id: ListId, size: usize) -> Option<usize> {
        let table = &self.table;
        let head = self
            .list(list_id)
            .find(table, |h| table.get(h).free_slot_count() > 0)?;

        // SAFETY: the class lock is held; slots on the list are dead cells.
        let cell = unsafe { table.get(head).pop_free_slot() }?;
        // SAFETY: the cell lies inside a live pinned region and has no owner.
        unsafe { std::ptr::write_bytes(cell as *mut u8, 0, size) };
        Some(cell)
    }

    /// Hand a dead fixed-size pinned object's cell back for reuse
    ///
    /// Returns false if `addr` is not the start of an allocated cell in a
    /// fixed pinned region.
    ///
    /// # Panics
    /// Debug builds panic when a cell is freed twice.
    pub fn free_pinned_slot(&self, addr: usize) -> bool {
        let Some(head) = self.table.region_of(addr) else {
            return false;
        };
        let desc = self.table.get(head);
        if desc.role() != RegionRole::FixedPinned {
            return false;
        }

        let cell = desc.cell_size() as usize;
        let start = self.table.region_start(head);
        if cell == 0 || (addr - start) % cell != 0 || addr >= desc.alloc_ptr() {
            return false;
        }

        let _guard = self.pinned.classes[fixed_class_of(cell)].lock.lock();
        #[cfg(debug_assertions)]
        {
            // SAFETY: the class lock is held.
            if unsafe { desc.has_free_slot(addr) } {
                heap_fatal!("pinned cell {:#x} in region {} freed twice", addr, head);
            }
        }
        // SAFETY: the class lock is held and `addr` is an allocated cell
        // whose object the caller reports dead.
        unsafe { desc.push_free_slot(addr) };
        true
    }
}
