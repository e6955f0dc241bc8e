//! Free Region Index - Dirty and Released Unit Pools
//!
//! Units given back by reclaimed regions are kept in two interval trees:
//!
//! - **dirty**: memory still backed by physical pages, holding stale
//!   contents. Cheap to reuse, but has to be zeroed first.
//! - **released**: memory whose pages went back to the OS. Reading it
//!   yields zeroes; the first touch faults pages back in.
//!
//! A unit range sits in at most one tree, and never in a tree while a live
//! region covers it. Each tree has its own lock. Allocation only ever
//! try-locks: a contended tree is skipped after a short bounded spin, and
//! the caller grows the heap instead of waiting.

use crate::heap::arena::VirtualMemoryArena;
use crate::heap::region::{RegionRole, RegionTable};
use crate::heap::unit_tree::UnitIntervalTree;
use crate::heap::page;
use crate::heap_fatal;
use crate::util::constants::UNIT_SIZE;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::Arc;

/// Which pool a unit range came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSource {
    Dirty,
    Released,
}

/// Two-tree index of free unit ranges
pub struct FreeRegionIndex {
    table: Arc<RegionTable>,
    dirty: Mutex<UnitIntervalTree>,
    released: Mutex<UnitIntervalTree>,
}

impl FreeRegionIndex {
    /// Create an index for every unit of `table`
    pub fn new(table: Arc<RegionTable>) -> Self {
        let units = table.unit_count() as usize;
        let mut dirty = UnitIntervalTree::new(units);
        let mut released = UnitIntervalTree::new(units);
        dirty.set_free_marker(table.clone());
        released.set_free_marker(table.clone());

        Self {
            table,
            dirty: Mutex::new(dirty),
            released: Mutex::new(released),
        }
    }

    /// Take a `units`-unit region and initialize its descriptor with `role`
    ///
    /// Tries the dirty tree first, then the released tree. Dirty memory is
    /// zeroed before it is handed out. Released memory is recommitted and,
    /// with `want_physical`, touched so its pages are resident.
    ///
    /// # Returns
    /// * `Some(head)` - Head unit of the new region
    /// * `None` - Neither tree holds a large enough range, or both stayed
    ///   contended
    pub fn take_region(
        &self,
        units: u32,
        role: RegionRole,
        want_physical: bool,
        arena: &VirtualMemoryArena,
    ) -> Option<u32> {
        let (head, source) = self.take_units(units)?;
        let start = self.table.unit_address(head);
        let len = units as usize * UNIT_SIZE;

        match source {
            FreeSource::Dirty => {
                // SAFETY: dirty units lie below the arena's used end and no
                // region owns them until `init_region` below.
                unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
            },
            FreeSource::Released => {
                if let Err(e) = arena.commit(start, len) {
                    log::warn!("recommit of units {}..{} failed: {}", head, head + units, e);
                    self.add_release_units(head, units);
                    return None;
                }
                if want_physical {
                    touch_pages(start, len);
                }
            },
        }

        self.table.init_region(head, units, role);
        log::trace!(
            "took {} units at {} from {:?} tree as {:?}",
            units,
            head,
            source,
            role
        );
        Some(head)
    }

    /// Take `units` units from whichever tree can serve them
    pub fn take_units(&self, units: u32) -> Option<(u32, FreeSource)> {
        if units == 0 {
            return None;
        }

        let backoff = Backoff::new();
        let mut dirty_tried = false;
        let mut released_tried = false;

        loop {
            if !dirty_tried {
                if let Some(mut tree) = self.dirty.try_lock() {
                    dirty_tried = true;
                    if let Some(head) = tree.take_units(units, true) {
                        return Some((head, FreeSource::Dirty));
                    }
                }
            }

            if !released_tried {
                if let Some(mut tree) = self.released.try_lock() {
                    released_tried = true;
                    if let Some(head) = tree.take_units(units, true) {
                        return Some((head, FreeSource::Released));
                    }
                }
            }

            if (dirty_tried && released_tried) || backoff.is_completed() {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Return units with stale contents to the dirty tree
    pub fn add_garbage_units(&self, index: u32, count: u32) {
        let mut tree = self.dirty.lock();
        if !tree.merge_insert(index, count, true) {
            heap_fatal!(
                "dirty units {}..{} clash with existing free ranges",
                index,
                index as u64 + count as u64
            );
        }
    }

    /// Return units whose pages went back to the OS to the released tree
    pub fn add_release_units(&self, index: u32, count: u32) {
        let mut tree = self.released.lock();
        if !tree.merge_insert(index, count, true) {
            heap_fatal!(
                "released units {}..{} clash with existing free ranges",
                index,
                index as u64 + count as u64
            );
        }
    }

    pub fn dirty_unit_count(&self) -> usize {
        self.dirty.lock().total_count()
    }

    pub fn released_unit_count(&self) -> usize {
        self.released.lock().total_count()
    }

    /// Bytes cached in the dirty tree
    pub fn dirty_bytes(&self) -> usize {
        self.dirty_unit_count() * UNIT_SIZE
    }

    pub fn released_bytes(&self) -> usize {
        self.released_unit_count() * UNIT_SIZE
    }

    /// Bytes of dirty memory above the cache budget
    ///
    /// Rounded down to whole units, so at least `target_cached` bytes stay
    /// cached whenever that much is available.
    pub fn calculate_bytes_to_release(&self, target_cached: usize) -> usize {
        let excess = self.dirty_bytes().saturating_sub(target_cached);
        excess / UNIT_SIZE * UNIT_SIZE
    }

    /// Decommit dirty units above the cache budget, moving them to the
    /// released tree
    ///
    /// Carves from the highest addresses first. Returns the number of
    /// bytes released.
    pub fn release_garbage_regions(
        &self,
        target_cached: usize,
        arena: &VirtualMemoryArena,
    ) -> usize {
        let mut remaining = (self.calculate_bytes_to_release(target_cached) / UNIT_SIZE) as u32;
        let mut released_units = 0usize;

        while remaining > 0 {
            let carved = self.dirty.lock().take_highest(remaining, true);
            let Some((index, count)) = carved else {
                break;
            };

            let start = self.table.unit_address(index);
            if let Err(e) = arena.decommit(start, count as usize * UNIT_SIZE) {
                log::warn!("decommit of units {}..{} failed: {}", index, index + count, e);
                self.add_garbage_units(index, count);
                break;
            }

            self.add_release_units(index, count);
            remaining -= count;
            released_units += count as usize;
        }

        if released_units > 0 {
            log::debug!(
                "released {} units to the OS, {} dirty bytes cached",
                released_units,
                self.dirty_bytes()
            );
        }
        released_units * UNIT_SIZE
    }

    /// Check both trees' invariants
    pub fn verify(&self) {
        self.dirty.lock().verify();
        self.released.lock().verify();
    }

    /// Free ranges of both trees in address order
    pub fn ranges(&self) -> (Vec<(u32, u32)>, Vec<(u32, u32)>) {
        (self.dirty.lock().ranges(), self.released.lock().ranges())
    }
}

impl std::fmt::Debug for FreeRegionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeRegionIndex")
            .field("dirty_units", &self.dirty_unit_count())
            .field("released_units", &self.released_unit_count())
            .finish()
    }
}

fn touch_pages(start: usize, len: usize) {
    let ps = page::get_page_size();
    let mut addr = start;
    while addr < start + len {
        // SAFETY: the range is committed and accessible read/write.
        unsafe { std::ptr::write_volatile(addr as *mut u8, 0) };
        addr += ps;
    }
}
