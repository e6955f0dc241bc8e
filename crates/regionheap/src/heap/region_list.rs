//! Region Lists - Role-Specific Intrusive Lists
//!
//! Every region that is handed out lives in exactly one [`RegionList`].
//! Links are unit indices stored in the region descriptors, so lists never
//! allocate. Each list keeps running totals (regions, units, allocated
//! bytes) so aggregate queries never walk regions.
//!
//! Moving a region between lists is the hand-off point between owners.
//! [`RegionList::move_region`] holds both list locks (in slot order) for the
//! whole move, so no observer sees the region in zero or two lists.

use crate::heap::region::{RegionRole, RegionTable, NO_LIST, NO_UNIT};
use crate::heap_fatal;
use crate::util::constants::FIXED_PINNED_CLASS_COUNT;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Identifies one of the manager's lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    ThreadLocal,
    RecentFull,
    FromSpace,
    ToSpace,
    Garbage,
    RecentPinned,
    OldPinned,
    RawPointerPinned,
    RecentLarge,
    OldLarge,
    ReadOnly,
    AppSpawn,
    /// Fixed-size pinned class, `(class + 1) * 8` byte cells
    FixedPinned(u8),
}

/// Number of lists a manager keeps
pub const LIST_COUNT: usize = 12 + FIXED_PINNED_CLASS_COUNT;

impl ListId {
    /// Dense slot number of this list
    pub fn slot(self) -> usize {
        match self {
            ListId::ThreadLocal => 0,
            ListId::RecentFull => 1,
            ListId::FromSpace => 2,
            ListId::ToSpace => 3,
            ListId::Garbage => 4,
            ListId::RecentPinned => 5,
            ListId::OldPinned => 6,
            ListId::RawPointerPinned => 7,
            ListId::RecentLarge => 8,
            ListId::OldLarge => 9,
            ListId::ReadOnly => 10,
            ListId::AppSpawn => 11,
            ListId::FixedPinned(class) => 12 + class as usize,
        }
    }

    pub fn from_slot(slot: usize) -> Option<ListId> {
        let id = match slot {
            0 => ListId::ThreadLocal,
            1 => ListId::RecentFull,
            2 => ListId::FromSpace,
            3 => ListId::ToSpace,
            4 => ListId::Garbage,
            5 => ListId::RecentPinned,
            6 => ListId::OldPinned,
            7 => ListId::RawPointerPinned,
            8 => ListId::RecentLarge,
            9 => ListId::OldLarge,
            10 => ListId::ReadOnly,
            11 => ListId::AppSpawn,
            s if s < LIST_COUNT => ListId::FixedPinned((s - 12) as u8),
            _ => return None,
        };
        Some(id)
    }

    /// Role regions carry while they sit in this list
    pub fn role(self) -> RegionRole {
        match self {
            ListId::ThreadLocal => RegionRole::ThreadLocal,
            ListId::RecentFull => RegionRole::RecentFull,
            ListId::FromSpace => RegionRole::FromSpace,
            ListId::ToSpace => RegionRole::ToSpace,
            ListId::Garbage => RegionRole::Garbage,
            ListId::RecentPinned => RegionRole::RecentPinned,
            ListId::OldPinned => RegionRole::OldPinned,
            ListId::RawPointerPinned => RegionRole::RawPointerPinned,
            ListId::RecentLarge => RegionRole::RecentLarge,
            ListId::OldLarge => RegionRole::OldLarge,
            ListId::ReadOnly => RegionRole::ReadOnly,
            ListId::AppSpawn => RegionRole::AppSpawn,
            ListId::FixedPinned(_) => RegionRole::FixedPinned,
        }
    }
}

#[derive(Debug)]
struct ListInner {
    head: u32,
    tail: u32,
    region_count: usize,
    unit_count: usize,
}

/// Mutex-guarded intrusive list of regions sharing a role
#[derive(Debug)]
pub struct RegionList {
    id: ListId,
    inner: Mutex<ListInner>,
    allocated_bytes: AtomicUsize,
}

impl RegionList {
    pub fn new(id: ListId) -> Self {
        Self {
            id,
            inner: Mutex::new(ListInner {
                head: NO_UNIT,
                tail: NO_UNIT,
                region_count: 0,
                unit_count: 0,
            }),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    /// Insert at the front of the list
    pub fn prepend(&self, table: &RegionTable, head: u32) {
        let mut inner = self.inner.lock();
        self.link(&mut inner, table, head, true);
    }

    /// Insert at the back of the list
    pub fn append(&self, table: &RegionTable, head: u32) {
        let mut inner = self.inner.lock();
        self.link(&mut inner, table, head, false);
    }

    /// Remove a region; it must be a member of this list
    pub fn delete(&self, table: &RegionTable, head: u32) {
        let mut inner = self.inner.lock();
        self.unlink(&mut inner, table, head);
    }

    /// Remove and return the first region
    pub fn pop_front(&self, table: &RegionTable) -> Option<u32> {
        let mut inner = self.inner.lock();
        let head = inner.head;
        if head == NO_UNIT {
            return None;
        }
        self.unlink(&mut inner, table, head);
        Some(head)
    }

    /// Unlink every region, returning them front to back
    pub fn drain(&self, table: &RegionTable) -> Vec<u32> {
        let mut inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.region_count);
        while inner.head != NO_UNIT {
            let head = inner.head;
            self.unlink(&mut inner, table, head);
            out.push(head);
        }
        out
    }

    /// Move a region from `src` to the front of `dst`, setting its role
    ///
    /// Both locks are held for the duration, taken in slot order. The region
    /// must be a member of `src`.
    pub fn move_region(src: &RegionList, dst: &RegionList, table: &RegionTable, head: u32) {
        if src.id == dst.id {
            return;
        }
        let (mut src_guard, mut dst_guard) = Self::lock_pair(src, dst);
        src.check_member(table, head);
        src.detach(&mut src_guard, table, head);
        dst.attach(&mut dst_guard, table, head, true);
    }

    /// Move a region from `src` to `dst` if it is still a member of `src`
    ///
    /// Returns false when another thread moved it first.
    pub fn move_if_member(
        src: &RegionList,
        dst: &RegionList,
        table: &RegionTable,
        head: u32,
    ) -> bool {
        Self::move_if(src, dst, table, head, || true)
    }

    /// Move a region from `src` to `dst` if it is a member of `src` and
    /// `cond` holds with both lists locked
    pub fn move_if(
        src: &RegionList,
        dst: &RegionList,
        table: &RegionTable,
        head: u32,
        cond: impl FnOnce() -> bool,
    ) -> bool {
        if src.id == dst.id {
            let _inner = src.inner.lock();
            return src.contains(table, head) && cond();
        }

        let (mut src_guard, mut dst_guard) = Self::lock_pair(src, dst);
        if !src.contains(table, head) || !cond() {
            return false;
        }
        src.detach(&mut src_guard, table, head);
        dst.attach(&mut dst_guard, table, head, true);
        true
    }

    fn lock_pair<'a>(
        src: &'a RegionList,
        dst: &'a RegionList,
    ) -> (MutexGuard<'a, ListInner>, MutexGuard<'a, ListInner>) {
        if src.id.slot() < dst.id.slot() {
            let s = src.inner.lock();
            let d = dst.inner.lock();
            (s, d)
        } else {
            let d = dst.inner.lock();
            let s = src.inner.lock();
            (s, d)
        }
    }

    /// Visit every region front to back under the list lock
    pub fn for_each(&self, table: &RegionTable, mut f: impl FnMut(u32)) {
        let inner = self.inner.lock();
        let mut cur = inner.head;
        while cur != NO_UNIT {
            let next = table.get(cur).next.load(Ordering::Relaxed);
            f(cur);
            cur = next;
        }
    }

    /// First region, front to back, for which `pred` holds
    pub fn find(&self, table: &RegionTable, mut pred: impl FnMut(u32) -> bool) -> Option<u32> {
        let inner = self.inner.lock();
        let mut cur = inner.head;
        while cur != NO_UNIT {
            if pred(cur) {
                return Some(cur);
            }
            cur = table.get(cur).next.load(Ordering::Relaxed);
        }
        None
    }

    /// Run `f` with the list locked if `head` is still a member
    ///
    /// Membership cannot change while `f` runs.
    pub fn with_member<R>(
        &self,
        table: &RegionTable,
        head: u32,
        f: impl FnOnce() -> R,
    ) -> Option<R> {
        let _inner = self.inner.lock();
        if self.contains(table, head) {
            Some(f())
        } else {
            None
        }
    }

    /// Snapshot of the member heads, front to back
    pub fn regions(&self, table: &RegionTable) -> Vec<u32> {
        let mut out = Vec::new();
        self.for_each(table, |head| out.push(head));
        out
    }

    pub fn contains(&self, table: &RegionTable, head: u32) -> bool {
        table.get(head).list_slot.load(Ordering::Acquire) as usize == self.id.slot()
    }

    /// Fold bytes bump-allocated since `head` was linked into the totals
    ///
    /// Bumps into a listed region do not take the list lock, so the totals
    /// of a region still being allocated into lag until it is refreshed or
    /// changes lists.
    pub fn refresh_allocation(&self, table: &RegionTable, head: u32) {
        let _inner = self.inner.lock();
        if !self.contains(table, head) {
            return;
        }
        let bytes = table.allocated_bytes(head);
        let prev = table.get(head).listed_bytes.swap(bytes, Ordering::Relaxed);
        if bytes >= prev {
            self.allocated_bytes.fetch_add(bytes - prev, Ordering::Relaxed);
        } else {
            self.allocated_bytes.fetch_sub(prev - bytes, Ordering::Relaxed);
        }
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().region_count
    }

    pub fn unit_count(&self) -> usize {
        self.inner.lock().unit_count
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().head == NO_UNIT
    }

    fn link(&self, inner: &mut ListInner, table: &RegionTable, head: u32, front: bool) {
        let current = table.get(head).list_slot.load(Ordering::Acquire);
        if current != NO_LIST {
            heap_fatal!(
                "region {} inserted into {:?} while in {:?}",
                head,
                self.id,
                ListId::from_slot(current as usize)
            );
        }
        self.attach(inner, table, head, front);
    }

    fn unlink(&self, inner: &mut ListInner, table: &RegionTable, head: u32) {
        self.check_member(table, head);
        self.detach(inner, table, head);
        table.get(head).list_slot.store(NO_LIST, Ordering::Release);
    }

    fn check_member(&self, table: &RegionTable, head: u32) {
        let current = table.get(head).list_slot.load(Ordering::Acquire);
        if current as usize != self.id.slot() {
            heap_fatal!(
                "region {} removed from {:?} but belongs to {:?}",
                head,
                self.id,
                ListId::from_slot(current as usize)
            );
        }
    }

    // Moves go straight from detach to attach, so `list_slot` never reads
    // as unlisted while a region changes lists.
    fn attach(&self, inner: &mut ListInner, table: &RegionTable, head: u32, front: bool) {
        let desc = table.get(head);
        if front {
            desc.prev.store(NO_UNIT, Ordering::Relaxed);
            desc.next.store(inner.head, Ordering::Relaxed);
            if inner.head != NO_UNIT {
                table.get(inner.head).prev.store(head, Ordering::Relaxed);
            } else {
                inner.tail = head;
            }
            inner.head = head;
        } else {
            desc.next.store(NO_UNIT, Ordering::Relaxed);
            desc.prev.store(inner.tail, Ordering::Relaxed);
            if inner.tail != NO_UNIT {
                table.get(inner.tail).next.store(head, Ordering::Relaxed);
            } else {
                inner.head = head;
            }
            inner.tail = head;
        }

        let bytes = table.allocated_bytes(head);
        desc.listed_bytes.store(bytes, Ordering::Relaxed);
        desc.list_slot.store(self.id.slot() as u16, Ordering::Release);
        desc.set_role(self.id.role());

        inner.region_count += 1;
        inner.unit_count += desc.unit_count() as usize;
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn detach(&self, inner: &mut ListInner, table: &RegionTable, head: u32) {
        let desc = table.get(head);
        let prev = desc.prev.load(Ordering::Relaxed);
        let next = desc.next.load(Ordering::Relaxed);
        if prev != NO_UNIT {
            table.get(prev).next.store(next, Ordering::Relaxed);
        } else {
            inner.head = next;
        }
        if next != NO_UNIT {
            table.get(next).prev.store(prev, Ordering::Relaxed);
        } else {
            inner.tail = prev;
        }

        desc.prev.store(NO_UNIT, Ordering::Relaxed);
        desc.next.store(NO_UNIT, Ordering::Relaxed);

        inner.region_count -= 1;
        inner.unit_count -= desc.unit_count() as usize;
        let bytes = desc.listed_bytes.swap(0, Ordering::Relaxed);
        self.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}
