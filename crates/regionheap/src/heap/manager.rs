//! Region Manager - Region Allocation and Recycling
//!
//! Owns the arena, the per-unit descriptor table, the free region index and
//! one list per region role. Regions come from the free index when it can
//! serve them, otherwise from the inactive zone, the never-used tail of the
//! arena:
//!
//! ```text
//! region_heap_start        inactive_zone                 region_heap_end
//!  │◄──── handed out at least once ──►│◄──── never touched ────►│
//!  └──────────────────────────────────┴─────────────────────────┘
//! ```
//!
//! The inactive zone only moves up, by CAS, so two threads never receive
//! the same units.
//!
//! ## Region Lifecycle
//!
//! ```text
//! inactive / free ──► ThreadLocal ──► RecentFull ──► FromSpace ──► Garbage
//!                          │                                          │
//!                          └──► ToSpace (collector buffers)           │
//!                 ──► Recent{Pinned,Large} ──► Old{Pinned,Large}      │
//!                                                                     ▼
//!                                              reclaim ──► dirty free tree
//! ```
//!
//! New regions are tagged with the current phase's marker line before they
//! are linked into any list.

use crate::config::HeapConfig;
use crate::error::Result;
use crate::gc::GcPhase;
use crate::heap::arena::{MapOptions, Protection, VirtualMemoryArena};
use crate::heap::free_index::FreeRegionIndex;
use crate::heap::pinned::PinnedSpace;
use crate::heap::region::{RegionHandle, RegionRole, RegionTable, NO_LIST};
use crate::heap::region_list::{ListId, RegionList, LIST_COUNT};
use crate::heap_check;
use crate::heap_fatal;
use crate::stats::{HeapStats, ListStats};
use crate::util::constants::{FIXED_PINNED_CLASS_COUNT, UNIT_SIZE};
use crate::worker::GcThreadPool;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocation backpressure owned by the collector
///
/// Called before the heap grows into the inactive zone on behalf of an
/// allocation that may trigger a collection. Implementations may block the
/// calling thread.
pub trait AllocationThrottle: Send + Sync {
    fn request_for_region(&self, _bytes: usize) {}
}

/// Throttle that never blocks
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottle;

impl AllocationThrottle for NoThrottle {}

/// Object model hook used to walk the objects of a region
pub trait ObjectSizer {
    /// Size in bytes of the object starting at `addr`, or 0 if no object
    /// starts there
    fn object_size(&self, addr: usize) -> usize;
}

/// RegionManager - hands out and recycles regions
pub struct RegionManager {
    pub(super) arena: VirtualMemoryArena,
    pub(super) table: Arc<RegionTable>,
    pub(super) free_index: FreeRegionIndex,
    pub(super) lists: Box<[RegionList]>,
    pub(super) pinned: PinnedSpace,
    region_heap_start: u32,
    inactive_zone: AtomicU32,
    region_heap_end: u32,
    cache_size: usize,
    throttle: Arc<dyn AllocationThrottle>,
    reclaimed_units: AtomicUsize,
}

impl RegionManager {
    /// Map the arena and build an empty manager
    ///
    /// # Errors
    /// - `Configuration` if `config` does not validate
    /// - `ArenaMapping` if the arena cannot be reserved
    pub fn new(config: &HeapConfig) -> Result<Self> {
        Self::with_throttle(config, Arc::new(NoThrottle))
    }

    /// Same as [`RegionManager::new`], with a collector-provided throttle
    pub fn with_throttle(
        config: &HeapConfig,
        throttle: Arc<dyn AllocationThrottle>,
    ) -> Result<Self> {
        config.validate()?;

        let units = config.unit_count();
        let size = units * UNIT_SIZE;
        let options = MapOptions {
            tag: "regionheap",
            base_hint: config.base_hint,
            protection: Protection::ReadWrite,
            protect_all_upfront: config.protect_all_upfront,
            platform_flags: 0,
        };

        let arena = if config.within_4g {
            VirtualMemoryArena::map_within_4g_alignment(size, config.initial_used_size, options)?
        } else {
            VirtualMemoryArena::map(size, config.initial_used_size, options)?
        };

        if let Some(hook) = &config.base_addr_hook {
            hook.notify(arena.base());
        }

        let table = Arc::new(RegionTable::new(arena.base(), units));
        let free_index = FreeRegionIndex::new(Arc::clone(&table));
        let lists = (0..LIST_COUNT)
            .filter_map(ListId::from_slot)
            .map(RegionList::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::info!(
            "region heap initialized: {} units of {} KB at {:#x}",
            units,
            UNIT_SIZE / 1024,
            arena.base()
        );

        Ok(Self {
            arena,
            table,
            free_index,
            lists,
            pinned: PinnedSpace::new(),
            region_heap_start: 0,
            inactive_zone: AtomicU32::new(0),
            region_heap_end: units as u32,
            cache_size: config.cache_size,
            throttle,
            reclaimed_units: AtomicUsize::new(0),
        })
    }

    pub fn arena(&self) -> &VirtualMemoryArena {
        &self.arena
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn free_index(&self) -> &FreeRegionIndex {
        &self.free_index
    }

    #[inline]
    pub fn list(&self, id: ListId) -> &RegionList {
        &self.lists[id.slot()]
    }

    pub fn region_heap_start(&self) -> u32 {
        self.region_heap_start
    }

    pub fn inactive_zone(&self) -> u32 {
        self.inactive_zone.load(Ordering::Acquire)
    }

    pub fn region_heap_end(&self) -> u32 {
        self.region_heap_end
    }

    /// Take a region of `units` units and initialize it with `role`
    ///
    /// Tries the free index, then grows the inactive zone. With
    /// `allow_gc`, the throttle is consulted before growing. The region is
    /// not linked into any list.
    ///
    /// # Returns
    /// * `Some(head)` - Head unit of the new region
    /// * `None` - No free range fits and the arena is exhausted; the caller
    ///   collects and retries (or reports out of memory)
    pub fn take_region(
        &self,
        units: u32,
        role: RegionRole,
        expect_physical: bool,
        allow_gc: bool,
    ) -> Option<u32> {
        if units == 0 {
            return None;
        }

        if let Some(head) = self.free_index.take_region(units, role, expect_physical, &self.arena) {
            return Some(head);
        }

        if allow_gc {
            self.throttle.request_for_region(units as usize * UNIT_SIZE);
        }

        let head = self.grow_inactive_zone(units)?;
        let end = self.table.unit_address(head + units);
        if let Err(e) = self.arena.extend_used(end) {
            heap_fatal!("cannot open units {}..{}: {}", head, head + units, e);
        }

        self.table.init_region(head, units, role);
        log::trace!("took {} units at {} from inactive zone as {:?}", units, head, role);
        Some(head)
    }

    fn grow_inactive_zone(&self, units: u32) -> Option<u32> {
        let mut current = self.inactive_zone.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(units)?;
            if next > self.region_heap_end {
                log::trace!(
                    "inactive zone exhausted: {} + {} > {}",
                    current,
                    units,
                    self.region_heap_end
                );
                return None;
            }

            match self.inactive_zone.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the marker line the current phase needs on a fresh region
    pub(crate) fn tag_new_region(&self, head: u32, phase: GcPhase) {
        let start = self.table.region_start(head);
        self.table.get(head).set_phase_lines(phase, start);
    }

    /// List a region currently belongs to
    pub fn list_of(&self, head: u32) -> Option<ListId> {
        let slot = self.table.get(head).list_slot.load(Ordering::Acquire);
        if slot == NO_LIST {
            None
        } else {
            ListId::from_slot(slot as usize)
        }
    }

    fn move_to(&self, head: u32, dst: ListId) {
        loop {
            let Some(src) = self.list_of(head) else {
                heap_fatal!("region {} is not in any list", head);
            };
            if src == dst
                || RegionList::move_if_member(self.list(src), self.list(dst), &self.table, head)
            {
                return;
            }
        }
    }

    /// Move a region out of `src` by its raw pointer count
    ///
    /// Pinned regions go to `RawPointerPinned`, the rest to `unpinned`. The
    /// count is checked with both lists locked. Returns the list the region
    /// landed in, or `None` if another thread took it out of `src` first.
    pub(crate) fn move_by_raw_pointers(
        &self,
        src: ListId,
        unpinned: ListId,
        head: u32,
    ) -> Option<ListId> {
        let desc = self.table.get(head);
        loop {
            let pinned = desc.raw_pointer_count() > 0;
            let dst = if pinned { ListId::RawPointerPinned } else { unpinned };
            let moved = RegionList::move_if(self.list(src), self.list(dst), &self.table, head, || {
                (desc.raw_pointer_count() > 0) == pinned
            });
            if moved {
                return Some(dst);
            }
            if self.list_of(head) != Some(src) {
                return None;
            }
        }
    }

    /// Handle of the live region containing `addr`
    pub fn region_of(&self, addr: usize) -> Option<RegionHandle> {
        let head = self.table.region_of(addr)?;
        Some(self.table.handle(head))
    }

    // ------------------------------------------------------------------
    // Collector-facing operations
    // ------------------------------------------------------------------

    /// Record a live object found by marking
    pub fn record_live(&self, addr: usize, size: usize) -> bool {
        let Some(head) = self.table.region_of(addr) else {
            return false;
        };
        let desc = self.table.get(head);
        desc.set_marked();
        desc.add_live_bytes(size);
        true
    }

    /// Turn full mutator regions and last cycle's to-space into from-space
    ///
    /// Regions with outstanding raw pointers are pinned instead. Returns the
    /// number of regions enlisted.
    pub fn enlist_from_space(&self) -> usize {
        let mut enlisted = 0;
        for src in [ListId::RecentFull, ListId::ToSpace] {
            for head in self.list(src).regions(&self.table) {
                let dst = self.move_by_raw_pointers(src, ListId::FromSpace, head);
                if dst == Some(ListId::FromSpace) {
                    enlisted += 1;
                }
            }
        }
        log::debug!("enlisted {} regions into from-space", enlisted);
        enlisted
    }

    /// Collect dead unmovable regions and age the survivors
    ///
    /// A region is dead when it is unmarked and has no live bytes or raw
    /// pointers. Current pinned allocation targets and regions that received
    /// objects above a marker line during this cycle always survive. Returns
    /// the number of regions moved to garbage.
    pub fn sweep_unmovable_regions(&self) -> usize {
        let mut collected = 0;

        let mut sources = vec![
            (ListId::RecentPinned, ListId::OldPinned),
            (ListId::OldPinned, ListId::OldPinned),
            (ListId::RecentLarge, ListId::OldLarge),
            (ListId::OldLarge, ListId::OldLarge),
            (ListId::RawPointerPinned, ListId::RawPointerPinned),
        ];
        for class in 0..FIXED_PINNED_CLASS_COUNT as u8 {
            sources.push((ListId::FixedPinned(class), ListId::FixedPinned(class)));
        }

        for (src, survivor) in sources {
            for head in self.list(src).regions(&self.table) {
                let desc = self.table.get(head);
                let is_dead = || {
                    !desc.is_marked()
                        && desc.live_bytes() == 0
                        && desc.raw_pointer_count() == 0
                        && !desc.allocated_this_cycle()
                        && !self.pinned.is_alloc_target(head)
                };

                let garbage = self.list(ListId::Garbage);
                if RegionList::move_if(self.list(src), garbage, &self.table, head, is_dead) {
                    collected += 1;
                } else if survivor != src {
                    RegionList::move_if_member(
                        self.list(src),
                        self.list(survivor),
                        &self.table,
                        head,
                    );
                }
            }
        }

        log::debug!("swept {} unmovable regions", collected);
        collected
    }

    /// Move one region into the garbage list
    ///
    /// Returns false for a stale handle. The region is sealed so no
    /// further allocation lands in it.
    pub fn collect_region(&self, handle: RegionHandle) -> bool {
        let resolved = self.table.resolve(handle);
        debug_assert!(resolved.is_some(), "collecting stale region {:?}", handle);
        let Some(head) = resolved else {
            return false;
        };

        self.pinned.forget_alloc_target(head);
        self.table.seal(head);
        if self.list_of(head) != Some(ListId::Garbage) {
            self.move_to(head, ListId::Garbage);
        }
        true
    }

    /// Move the whole from-space into the garbage list
    ///
    /// Regions with outstanding raw pointers are pinned instead. Returns the
    /// number of regions turned into garbage.
    pub fn reclaim_from_space(&self) -> usize {
        let from = self.list(ListId::FromSpace);
        let mut moved = 0;
        while let Some(head) = from.find(&self.table, |_| true) {
            if self.move_by_raw_pointers(ListId::FromSpace, ListId::Garbage, head)
                == Some(ListId::Garbage)
            {
                moved += 1;
            }
        }
        moved
    }

    /// Return every garbage region's units to the dirty free tree
    ///
    /// Returns the number of units reclaimed.
    pub fn reclaim_garbage_regions(&self) -> usize {
        let heads = self.list(ListId::Garbage).drain(&self.table);
        let units = self.reclaim_batch(&heads);
        if units > 0 {
            log::debug!("reclaimed {} regions ({} units)", heads.len(), units);
        }
        units
    }

    /// Parallel form of [`reclaim_garbage_regions`](Self::reclaim_garbage_regions)
    ///
    /// Splits the garbage list into one batch per active worker and runs
    /// the batches on `pool`.
    pub fn reclaim_garbage_regions_parallel(self: &Arc<Self>, pool: &GcThreadPool) -> usize {
        let heads = self.list(ListId::Garbage).drain(&self.table);
        if heads.is_empty() {
            return 0;
        }

        let workers = pool.max_active_thread_num().max(1);
        let batch = heads.len().div_ceil(workers);
        let total = Arc::new(AtomicUsize::new(0));

        pool.start();
        for chunk in heads.chunks(batch) {
            let chunk = chunk.to_vec();
            let manager = Arc::clone(self);
            let total = Arc::clone(&total);
            pool.add_work(move |_| {
                let units = manager.reclaim_batch(&chunk);
                total.fetch_add(units, Ordering::Relaxed);
            });
        }
        pool.wait_finish();

        let units = total.load(Ordering::Relaxed);
        log::debug!(
            "reclaimed {} regions ({} units) on {} workers",
            heads.len(),
            units,
            workers
        );
        units
    }

    fn reclaim_batch(&self, heads: &[u32]) -> usize {
        let mut units = 0;
        for &head in heads {
            heap_check!(
                self.table.get(head).role() == RegionRole::Garbage,
                "reclaiming region {} with role {:?}",
                head,
                self.table.get(head).role()
            );
            self.pinned.forget_alloc_target(head);
            let count = self.table.reset_region(head);
            self.free_index.add_garbage_units(head, count);
            units += count as usize;
        }
        self.reclaimed_units.fetch_add(units, Ordering::Relaxed);
        units
    }

    /// Return dirty memory above the cache budget to the OS
    pub fn release_cached_memory(&self) -> usize {
        self.free_index.release_garbage_regions(self.cache_size, &self.arena)
    }

    /// Reset marker lines, mark bits and live bytes of every listed region
    pub fn clear_gc_marks(&self) {
        for list in self.lists.iter() {
            list.for_each(&self.table, |head| self.table.get(head).clear_gc_marks());
        }
    }

    /// Pin the region containing `addr` against evacuation
    pub fn register_raw_pointer(&self, addr: usize) -> bool {
        let Some(head) = self.table.region_of(addr) else {
            return false;
        };

        let desc = self.table.get(head);
        if desc.inc_raw_pointers() == 1 {
            if let Some(src @ (ListId::RecentFull | ListId::ToSpace | ListId::FromSpace)) =
                self.list_of(head)
            {
                RegionList::move_if(
                    self.list(src),
                    self.list(ListId::RawPointerPinned),
                    &self.table,
                    head,
                    || desc.raw_pointer_count() > 0,
                );
            }
        }
        true
    }

    /// Drop a raw pointer pin taken by [`register_raw_pointer`](Self::register_raw_pointer)
    pub fn unregister_raw_pointer(&self, addr: usize) -> bool {
        let Some(head) = self.table.region_of(addr) else {
            return false;
        };

        let desc = self.table.get(head);
        match desc.dec_raw_pointers() {
            None => heap_fatal!("raw pointer count underflow in region {}", head),
            Some(0) => {
                RegionList::move_if(
                    self.list(ListId::RawPointerPinned),
                    self.list(ListId::RecentFull),
                    &self.table,
                    head,
                    || desc.raw_pointer_count() == 0,
                );
            },
            Some(_) => {},
        }
        true
    }

    /// Visit every region of a list
    pub fn for_each_region(&self, list: ListId, f: impl FnMut(u32)) {
        self.list(list).for_each(&self.table, f);
    }

    /// Visit every object of a region while other threads may run
    ///
    /// Holds the region's list lock, so the region cannot change lists or
    /// be reclaimed during the walk. Returns false if the handle is stale.
    pub fn for_each_object_safe(
        &self,
        handle: RegionHandle,
        sizer: &dyn ObjectSizer,
        mut f: impl FnMut(usize),
    ) -> bool {
        loop {
            let Some(head) = self.table.resolve(handle) else {
                return false;
            };
            let Some(list) = self.list_of(head) else {
                self.walk_objects(head, sizer, &mut f);
                return true;
            };
            let walked = self
                .list(list)
                .with_member(&self.table, head, || self.walk_objects(head, sizer, &mut f));
            if walked.is_some() {
                return true;
            }
        }
    }

    /// Visit every object of a region, assuming no other thread touches it
    pub fn for_each_object_unsafe(
        &self,
        handle: RegionHandle,
        sizer: &dyn ObjectSizer,
        mut f: impl FnMut(usize),
    ) -> bool {
        let Some(head) = self.table.resolve(handle) else {
            return false;
        };
        self.walk_objects(head, sizer, &mut f);
        true
    }

    fn walk_objects(&self, head: u32, sizer: &dyn ObjectSizer, f: &mut impl FnMut(usize)) {
        let desc = self.table.get(head);
        let cell = desc.cell_size() as usize;
        let end = desc.alloc_ptr();
        let mut addr = self.table.region_start(head);

        while addr < end {
            let size = if cell > 0 { cell } else { sizer.object_size(addr) };
            if size == 0 {
                break;
            }
            f(addr);
            addr += size;
        }
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Bytes of all regions that are handed out
    pub fn used_region_bytes(&self) -> usize {
        self.lists.iter().map(|l| l.unit_count()).sum::<usize>() * UNIT_SIZE
    }

    /// Bytes bump-allocated across all regions
    pub fn allocated_bytes(&self) -> usize {
        self.refresh_pinned_accounting();
        self.lists.iter().map(|l| l.allocated_bytes()).sum()
    }

    /// Bytes that survived the last collection: to-space and old regions
    pub fn survived_bytes(&self) -> usize {
        self.refresh_pinned_accounting();
        [ListId::ToSpace, ListId::OldPinned, ListId::OldLarge]
            .iter()
            .map(|&id| self.list(id).allocated_bytes())
            .sum()
    }

    /// Units reclaimed since the manager was created
    pub fn reclaimed_units(&self) -> usize {
        self.reclaimed_units.load(Ordering::Relaxed)
    }

    pub fn list_stats(&self, id: ListId) -> ListStats {
        self.refresh_pinned_accounting();
        let list = self.list(id);
        ListStats {
            list: format!("{:?}", id),
            regions: list.region_count(),
            units: list.unit_count(),
            allocated_bytes: list.allocated_bytes(),
        }
    }

    /// Snapshot of heap-wide statistics
    pub fn stats(&self) -> HeapStats {
        let lists = self
            .lists
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| self.list_stats(l.id()))
            .collect();

        HeapStats {
            unit_size: UNIT_SIZE,
            total_units: self.region_heap_end as usize,
            inactive_zone: self.inactive_zone() as usize,
            used_region_bytes: self.used_region_bytes(),
            allocated_bytes: self.allocated_bytes(),
            survived_bytes: self.survived_bytes(),
            dirty_cached_bytes: self.free_index.dirty_bytes(),
            released_bytes: self.free_index.released_bytes(),
            reclaimed_units: self.reclaimed_units(),
            arena_used_bytes: self.arena.used_size(),
            arena_mapped_bytes: self.arena.mapped_size(),
            gc_count: 0,
            lists,
        }
    }
}

impl std::fmt::Debug for RegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionManager")
            .field("arena", &self.arena)
            .field("inactive_zone", &self.inactive_zone())
            .field("region_heap_end", &self.region_heap_end)
            .field("free_index", &self.free_index)
            .finish()
    }
}
