//! Region Descriptors - Per-Unit Metadata
//!
//! The heap keeps one [`RegionDescriptor`] per unit in a flat table that
//! runs parallel to the arena. A region spanning several units is described
//! by its first ("head") unit; the remaining units are `Subordinate` and
//! point back at the head.
//!
//! ```text
//! unit:    0      1      2      3      4      5      6
//!       ┌──────┬──────┬──────┬──────┬──────┬──────┬──────┐
//! role  │ TLAB │Large │ Sub  │ Sub  │ Free │ Free │ Pin  │
//! head  │  0   │  1   │  1   │  1   │  4   │  4   │  6   │
//!       └──────┴──────┴──────┴──────┴──────┴──────┴──────┘
//! ```
//!
//! Free runs are tagged at both ends: the first unit holds the run length
//! and the last unit points back at the first.
//!
//! # Memory Ordering Model
//!
//! - **Role / unit count:** `Acquire` loads, `Release` stores. A region is
//!   fully initialized before its role is published.
//! - **Bump pointer:** CAS with `AcqRel`; concurrent allocators retry with
//!   the observed value.
//! - **Lines, mark bit, live bytes:** `Relaxed`. Written by the single
//!   owner of the region during a phase, read after a list hand-off.
//! - **List links:** only touched under the owning list's lock.

use crate::gc::GcPhase;
use crate::heap::unit_tree::FreeUnitMarker;
use crate::util::constants::UNIT_SIZE;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};

/// Sentinel for "no unit"
pub const NO_UNIT: u32 = u32::MAX;

/// Sentinel for an unset marker line
pub const NO_LINE: usize = usize::MAX;

/// Sentinel for "not in any list"
pub const NO_LIST: u16 = u16::MAX;

/// Role of a region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RegionRole {
    /// Free unit (in a free tree or the inactive zone)
    Free = 0,
    /// Non-head unit of a multi-unit region
    Subordinate = 1,
    /// Bump-allocation target of a mutator or collector buffer
    ThreadLocal = 2,
    /// Mutator buffer region that filled up
    RecentFull = 3,
    /// Region being evacuated
    FromSpace = 4,
    /// Region receiving evacuated objects
    ToSpace = 5,
    /// Region with no reachable objects, waiting for reclaim
    Garbage = 6,
    RecentPinned = 7,
    OldPinned = 8,
    /// Pinned region serving one fixed cell size
    FixedPinned = 9,
    /// Region with outstanding raw pointers, never evacuated
    RawPointerPinned = 10,
    RecentLarge = 11,
    OldLarge = 12,
    ReadOnly = 13,
    AppSpawn = 14,
}

impl RegionRole {
    pub fn from_u8(value: u8) -> RegionRole {
        match value {
            1 => RegionRole::Subordinate,
            2 => RegionRole::ThreadLocal,
            3 => RegionRole::RecentFull,
            4 => RegionRole::FromSpace,
            5 => RegionRole::ToSpace,
            6 => RegionRole::Garbage,
            7 => RegionRole::RecentPinned,
            8 => RegionRole::OldPinned,
            9 => RegionRole::FixedPinned,
            10 => RegionRole::RawPointerPinned,
            11 => RegionRole::RecentLarge,
            12 => RegionRole::OldLarge,
            13 => RegionRole::ReadOnly,
            14 => RegionRole::AppSpawn,
            _ => RegionRole::Free,
        }
    }

    /// Regions the concurrent collector never evacuates
    pub fn is_unmovable(self) -> bool {
        matches!(
            self,
            RegionRole::RecentPinned
                | RegionRole::OldPinned
                | RegionRole::FixedPinned
                | RegionRole::RawPointerPinned
                | RegionRole::RecentLarge
                | RegionRole::OldLarge
                | RegionRole::ReadOnly
                | RegionRole::AppSpawn
        )
    }

    /// Head of a live (handed out) region
    pub fn is_in_use(self) -> bool {
        !matches!(self, RegionRole::Free | RegionRole::Subordinate)
    }
}

/// Generation-checked reference to a region
///
/// The generation is bumped every time a region is reclaimed, so a handle
/// kept past reclaim no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    pub index: u32,
    pub generation: u32,
}

/// Metadata for one unit
#[derive(Debug)]
pub struct RegionDescriptor {
    role: AtomicU8,
    unit_count: AtomicU32,
    head: AtomicU32,
    generation: AtomicU32,

    /// Bump pointer (absolute address)
    alloc_ptr: AtomicUsize,
    live_bytes: AtomicUsize,

    trace_line: AtomicUsize,
    copy_line: AtomicUsize,
    fix_line: AtomicUsize,
    marked: AtomicBool,

    raw_pointer_count: AtomicU32,

    /// Cell size for fixed pinned regions, 0 otherwise
    cell_size: AtomicU32,
    /// Intrusive free-slot list threaded through dead cells
    free_slot_head: AtomicUsize,
    free_slot_count: AtomicU32,

    pub(crate) list_slot: AtomicU16,
    pub(crate) prev: AtomicU32,
    pub(crate) next: AtomicU32,
    pub(crate) listed_bytes: AtomicUsize,
}

impl RegionDescriptor {
    fn new() -> Self {
        Self {
            role: AtomicU8::new(RegionRole::Free as u8),
            unit_count: AtomicU32::new(0),
            head: AtomicU32::new(NO_UNIT),
            generation: AtomicU32::new(0),
            alloc_ptr: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            trace_line: AtomicUsize::new(NO_LINE),
            copy_line: AtomicUsize::new(NO_LINE),
            fix_line: AtomicUsize::new(NO_LINE),
            marked: AtomicBool::new(false),
            raw_pointer_count: AtomicU32::new(0),
            cell_size: AtomicU32::new(0),
            free_slot_head: AtomicUsize::new(0),
            free_slot_count: AtomicU32::new(0),
            list_slot: AtomicU16::new(NO_LIST),
            prev: AtomicU32::new(NO_UNIT),
            next: AtomicU32::new(NO_UNIT),
            listed_bytes: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn role(&self) -> RegionRole {
        RegionRole::from_u8(self.role.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_role(&self, role: RegionRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    #[inline]
    pub fn unit_count(&self) -> u32 {
        self.unit_count.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr.load(Ordering::Acquire)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn trace_line(&self) -> usize {
        self.trace_line.load(Ordering::Relaxed)
    }

    pub fn copy_line(&self) -> usize {
        self.copy_line.load(Ordering::Relaxed)
    }

    pub fn fix_line(&self) -> usize {
        self.fix_line.load(Ordering::Relaxed)
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_marked(&self) {
        self.marked.store(true, Ordering::Relaxed);
    }

    pub fn raw_pointer_count(&self) -> u32 {
        self.raw_pointer_count.load(Ordering::Acquire)
    }

    pub(crate) fn inc_raw_pointers(&self) -> u32 {
        self.raw_pointer_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the count after decrementing, or `None` if it was already 0
    pub(crate) fn dec_raw_pointers(&self) -> Option<u32> {
        self.raw_pointer_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    pub fn cell_size(&self) -> u32 {
        self.cell_size.load(Ordering::Relaxed)
    }

    pub(crate) fn set_cell_size(&self, size: u32) {
        self.cell_size.store(size, Ordering::Relaxed);
    }

    pub fn free_slot_count(&self) -> u32 {
        self.free_slot_count.load(Ordering::Relaxed)
    }

    /// Push a dead cell onto the free-slot list
    ///
    /// # Safety
    /// `addr` must be a cell of this region that no live object uses, at
    /// least a word in size. Callers hold the size-class lock.
    pub(crate) unsafe fn push_free_slot(&self, addr: usize) {
        let head = self.free_slot_head.load(Ordering::Relaxed);
        std::ptr::write(addr as *mut usize, head);
        self.free_slot_head.store(addr, Ordering::Relaxed);
        self.free_slot_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop a cell off the free-slot list
    ///
    /// # Safety
    /// Callers hold the size-class lock.
    pub(crate) unsafe fn pop_free_slot(&self) -> Option<usize> {
        let head = self.free_slot_head.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }
        let next = std::ptr::read(head as *const usize);
        self.free_slot_head.store(next, Ordering::Relaxed);
        self.free_slot_count.fetch_sub(1, Ordering::Relaxed);
        Some(head)
    }

    /// Check if a cell is already on the free-slot list
    ///
    /// # Safety
    /// Callers hold the size-class lock.
    #[cfg(debug_assertions)]
    pub(crate) unsafe fn has_free_slot(&self, addr: usize) -> bool {
        let mut cur = self.free_slot_head.load(Ordering::Relaxed);
        while cur != 0 {
            if cur == addr {
                return true;
            }
            cur = std::ptr::read(cur as *const usize);
        }
        false
    }

    /// Check if objects were allocated above a marker line set this cycle
    ///
    /// Such objects are live for the rest of the cycle whether or not
    /// marking reached them.
    pub fn allocated_this_cycle(&self) -> bool {
        let top = self.alloc_ptr();
        [self.trace_line(), self.copy_line(), self.fix_line()]
            .into_iter()
            .any(|line| line != NO_LINE && top > line)
    }

    /// Set the marker line for a phase to `line`
    ///
    /// Objects at or above a line were allocated after it was set.
    pub(crate) fn set_phase_lines(&self, phase: GcPhase, line: usize) {
        if phase.is_tracing() {
            self.trace_line.store(line, Ordering::Relaxed);
        } else if phase.is_copying() {
            self.copy_line.store(line, Ordering::Relaxed);
        } else if phase.is_fixing() {
            self.trace_line.store(line, Ordering::Relaxed);
            self.fix_line.store(line, Ordering::Relaxed);
        }
    }

    pub(crate) fn clear_gc_marks(&self) {
        self.trace_line.store(NO_LINE, Ordering::Relaxed);
        self.copy_line.store(NO_LINE, Ordering::Relaxed);
        self.fix_line.store(NO_LINE, Ordering::Relaxed);
        self.marked.store(false, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
    }
}

/// Flat metadata table covering every unit of the arena
#[derive(Debug)]
pub struct RegionTable {
    base: usize,
    descs: Box<[RegionDescriptor]>,
}

impl RegionTable {
    /// Create a table for `unit_count` units starting at `base`
    pub fn new(base: usize, unit_count: usize) -> Self {
        let descs = (0..unit_count).map(|_| RegionDescriptor::new()).collect();
        Self { base, descs }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn unit_count(&self) -> u32 {
        self.descs.len() as u32
    }

    /// First address past the last unit
    pub fn end(&self) -> usize {
        self.base + self.descs.len() * UNIT_SIZE
    }

    #[inline]
    pub fn unit_address(&self, index: u32) -> usize {
        self.base + index as usize * UNIT_SIZE
    }

    /// Unit containing `addr`
    #[inline]
    pub fn index_of(&self, addr: usize) -> Option<u32> {
        if addr < self.base || addr >= self.end() {
            return None;
        }
        Some(((addr - self.base) / UNIT_SIZE) as u32)
    }

    #[inline]
    pub fn get(&self, index: u32) -> &RegionDescriptor {
        &self.descs[index as usize]
    }

    /// Head unit of the region containing unit `index`
    pub fn head_of(&self, index: u32) -> u32 {
        let desc = self.get(index);
        if desc.role() == RegionRole::Subordinate {
            desc.head.load(Ordering::Acquire)
        } else {
            index
        }
    }

    /// Head unit of the live region containing `addr`
    pub fn region_of(&self, addr: usize) -> Option<u32> {
        let head = self.head_of(self.index_of(addr)?);
        if self.get(head).role().is_in_use() {
            Some(head)
        } else {
            None
        }
    }

    /// Start address of a region
    pub fn region_start(&self, head: u32) -> usize {
        self.unit_address(head)
    }

    /// First address past a region
    pub fn region_end(&self, head: u32) -> usize {
        self.unit_address(head) + self.get(head).unit_count() as usize * UNIT_SIZE
    }

    /// Bytes handed out from a region
    pub fn allocated_bytes(&self, head: u32) -> usize {
        self.get(head).alloc_ptr().saturating_sub(self.region_start(head))
    }

    pub fn handle(&self, head: u32) -> RegionHandle {
        RegionHandle {
            index: head,
            generation: self.get(head).generation(),
        }
    }

    /// Resolve a handle to its head unit, if the region still exists
    pub fn resolve(&self, handle: RegionHandle) -> Option<u32> {
        if handle.index >= self.unit_count() {
            return None;
        }
        let desc = self.get(handle.index);
        if desc.generation() != handle.generation || !desc.role().is_in_use() {
            log::debug!("stale region handle {:?}", handle);
            return None;
        }
        Some(handle.index)
    }

    /// Initialize the descriptors of a freshly taken region
    ///
    /// The role is written last so concurrent readers never see a
    /// half-initialized head.
    pub(crate) fn init_region(&self, head: u32, units: u32, role: RegionRole) {
        for index in head + 1..head + units {
            let desc = self.get(index);
            desc.head.store(head, Ordering::Release);
            desc.unit_count.store(0, Ordering::Release);
            desc.set_role(RegionRole::Subordinate);
        }

        let desc = self.get(head);
        desc.unit_count.store(units, Ordering::Release);
        desc.head.store(head, Ordering::Relaxed);
        desc.alloc_ptr.store(self.unit_address(head), Ordering::Release);
        desc.raw_pointer_count.store(0, Ordering::Relaxed);
        desc.cell_size.store(0, Ordering::Relaxed);
        desc.free_slot_head.store(0, Ordering::Relaxed);
        desc.free_slot_count.store(0, Ordering::Relaxed);
        desc.listed_bytes.store(0, Ordering::Relaxed);
        desc.prev.store(NO_UNIT, Ordering::Relaxed);
        desc.next.store(NO_UNIT, Ordering::Relaxed);
        desc.list_slot.store(NO_LIST, Ordering::Relaxed);
        desc.clear_gc_marks();
        desc.set_role(role);
    }

    /// Return a region's descriptors to the free state
    ///
    /// Bumps the generation so outstanding handles stop resolving.
    pub(crate) fn reset_region(&self, head: u32) -> u32 {
        let desc = self.get(head);
        let units = desc.unit_count();
        crate::heap_check!(
            desc.list_slot.load(Ordering::Acquire) == NO_LIST,
            "resetting region {} while it is still listed",
            head
        );

        desc.generation.fetch_add(1, Ordering::AcqRel);
        desc.set_role(RegionRole::Free);
        desc.clear_gc_marks();
        desc.raw_pointer_count.store(0, Ordering::Relaxed);
        desc.cell_size.store(0, Ordering::Relaxed);
        desc.free_slot_head.store(0, Ordering::Relaxed);
        desc.free_slot_count.store(0, Ordering::Relaxed);

        for index in head + 1..head + units {
            let sub = self.get(index);
            sub.set_role(RegionRole::Free);
            sub.head.store(index, Ordering::Release);
        }
        units
    }

    /// Bump-allocate `size` bytes from a region
    ///
    /// Returns `None` when the region cannot fit the request.
    pub fn try_bump(&self, head: u32, size: usize) -> Option<usize> {
        let desc = self.get(head);
        let limit = self.region_end(head);
        let mut current = desc.alloc_ptr.load(Ordering::Relaxed);

        loop {
            let new_top = current.checked_add(size)?;
            if new_top > limit {
                return None;
            }

            match desc.alloc_ptr.compare_exchange_weak(
                current,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Move the bump pointer to the region end so no further bumps succeed
    pub(crate) fn seal(&self, head: u32) {
        let end = self.region_end(head);
        self.get(head).alloc_ptr.fetch_max(end, Ordering::AcqRel);
    }
}

impl FreeUnitMarker for RegionTable {
    fn mark_free(&self, index: u32, count: u32) {
        let first = self.get(index);
        first.unit_count.store(count, Ordering::Release);
        first.head.store(index, Ordering::Release);
        first.set_role(RegionRole::Free);

        let last = self.get(index + count - 1);
        last.head.store(index, Ordering::Release);
        last.set_role(RegionRole::Free);
    }
}
