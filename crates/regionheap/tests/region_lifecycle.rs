//! Region Lifecycle Tests
//!
//! Drive regions through the manager the way a collector would and check
//! that every unit stays accounted for at each step:
//! - inactive zone ──► lists ──► garbage ──► dirty tree
//! - dirty tree ──► released tree ──► recommitted region
//! - pinned and large regions surviving or dying in a sweep

mod common;

use common::{assert_all_addresses_unique, role_of, runtime, FixedSizer, ManagerFixture};
use regionheap::{GcPhase, HeapConfig, ListId, RegionRole, UNIT_SIZE};

#[test]
fn test_units_conserved_through_reclaim() {
    let fx = ManagerFixture::new(16);
    let mgr = &fx.manager;

    let a = fx.take_listed(2, ListId::RecentFull);
    let b = fx.take_listed(3, ListId::RecentFull);
    let c = fx.take_listed(1, ListId::RecentLarge);
    fx.assert_units_conserved();

    assert_eq!(mgr.enlist_from_space(), 2);
    assert_eq!(mgr.list_of(a), Some(ListId::FromSpace));
    assert_eq!(mgr.list_of(b), Some(ListId::FromSpace));
    fx.assert_units_conserved();

    assert_eq!(mgr.reclaim_from_space(), 2);
    assert_eq!(mgr.reclaim_garbage_regions(), 5);
    assert_eq!(mgr.free_index().ranges().0, vec![(0, 5)]);
    assert_eq!(role_of(mgr, a), RegionRole::Free);
    assert_eq!(mgr.list_of(c), Some(ListId::RecentLarge));
    fx.assert_units_conserved();
    mgr.free_index().verify();
}

#[test]
fn test_reclaimed_units_are_reused_lowest_first() {
    let fx = ManagerFixture::new(16);
    let mgr = &fx.manager;

    let heads: Vec<u32> = (0..6).map(|_| fx.take_listed(1, ListId::RecentFull)).collect();
    for &head in &[heads[1], heads[2], heads[4]] {
        assert!(mgr.collect_region(mgr.table().handle(head)));
    }
    assert_eq!(mgr.reclaim_garbage_regions(), 3);
    assert_eq!(mgr.free_index().ranges().0, vec![(1, 2), (4, 1)]);

    // No free range holds two units, so that request grows the inactive zone.
    assert_eq!(mgr.take_region(1, RegionRole::ThreadLocal, false, false), Some(1));
    assert_eq!(mgr.take_region(2, RegionRole::ThreadLocal, false, false), Some(6));
    assert_eq!(mgr.take_region(1, RegionRole::ThreadLocal, false, false), Some(2));
    assert_eq!(mgr.free_index().ranges().0, vec![(4, 1)]);
}

#[test]
fn test_release_and_recommit() {
    let fx = ManagerFixture::with_config(HeapConfig {
        cache_size: UNIT_SIZE,
        ..common::heap_config(16)
    });
    let mgr = &fx.manager;

    let head = fx.take_listed(4, ListId::RecentLarge);
    let addr = mgr.table().region_start(head);
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0xAB, 4 * UNIT_SIZE) };

    mgr.list(ListId::RecentLarge).delete(mgr.table(), head);
    mgr.list(ListId::Garbage).prepend(mgr.table(), head);
    mgr.reclaim_garbage_regions();

    assert_eq!(mgr.release_cached_memory(), 3 * UNIT_SIZE);
    assert_eq!(mgr.free_index().ranges(), (vec![(0, 1)], vec![(1, 3)]));
    fx.assert_units_conserved();

    // Dirty units come back zeroed.
    let dirty = mgr.take_region(1, RegionRole::ThreadLocal, true, false).unwrap();
    assert_eq!(dirty, 0);
    let first = unsafe { *(mgr.table().region_start(dirty) as *const u64) };
    assert_eq!(first, 0);

    // Released units are recommitted before reuse.
    let recommitted = mgr.take_region(3, RegionRole::RecentLarge, true, false).unwrap();
    assert_eq!(recommitted, 1);
    let start = mgr.table().region_start(recommitted);
    let tail = unsafe { *((start + 3 * UNIT_SIZE - 8) as *const u64) };
    assert_eq!(tail, 0);
    assert_eq!(mgr.free_index().released_unit_count(), 0);
}

#[test]
fn test_sweep_keeps_marked_and_collects_dead() {
    let fx = ManagerFixture::new(16);
    let mgr = &fx.manager;

    let live = mgr.alloc_large(UNIT_SIZE, false, GcPhase::Idle).unwrap();
    let dead = mgr.alloc_large(UNIT_SIZE, false, GcPhase::Idle).unwrap();
    let live_head = mgr.table().region_of(live).unwrap();
    let dead_head = mgr.table().region_of(dead).unwrap();

    assert!(mgr.record_live(live, UNIT_SIZE));
    assert_eq!(mgr.sweep_unmovable_regions(), 1);
    assert_eq!(mgr.list_of(live_head), Some(ListId::OldLarge));
    assert_eq!(mgr.list_of(dead_head), Some(ListId::Garbage));

    mgr.reclaim_garbage_regions();
    mgr.clear_gc_marks();
    fx.assert_units_conserved();

    // Unmarked in the next cycle, the old region dies too.
    assert_eq!(mgr.sweep_unmovable_regions(), 1);
    assert_eq!(mgr.list_of(live_head), Some(ListId::Garbage));
}

#[test]
fn test_fixed_pinned_slot_reuse() {
    let fx = ManagerFixture::new(8);
    let mgr = &fx.manager;

    let addrs: Vec<usize> = (0..16)
        .map(|_| mgr.alloc_pinned(24, true, GcPhase::Idle).unwrap())
        .collect();
    assert_all_addresses_unique(&addrs, "fixed pinned class");

    let head = mgr.table().region_of(addrs[0]).unwrap();
    assert_eq!(mgr.list_of(head), Some(ListId::FixedPinned(2)));
    assert_eq!(mgr.table().get(head).cell_size(), 24);

    assert!(mgr.free_pinned_slot(addrs[5]));
    assert!(!mgr.free_pinned_slot(addrs[5] + 8));

    // Bump space is used first; the freed cell waits for a full region.
    let next = mgr.alloc_pinned(24, true, GcPhase::Idle).unwrap();
    assert_eq!(next, addrs[15] + 24);

    let mut count = 0;
    let handle = mgr.table().handle(head);
    assert!(mgr.for_each_object_safe(handle, &FixedSizer(0), |_| count += 1));
    assert_eq!(count, 17);
}

#[test]
fn test_raw_pointer_blocks_evacuation() {
    let rt = runtime(8);
    let mut buf = rt.mutator_buffer();
    let addr = rt.allocate(&mut buf, 256, |_| {}).unwrap();
    let head = rt.manager().table().region_of(addr).unwrap();
    drop(buf);

    assert!(rt.manager().register_raw_pointer(addr));
    assert_eq!(rt.manager().list_of(head), Some(ListId::RawPointerPinned));

    rt.begin_gc_cycle();
    let summary = rt.end_gc_cycle();
    assert_eq!(summary.evacuated_regions, 0);
    assert_eq!(rt.manager().list_of(head), Some(ListId::RawPointerPinned));

    assert!(rt.manager().unregister_raw_pointer(addr));
    assert_eq!(rt.manager().list_of(head), Some(ListId::RecentFull));

    rt.begin_gc_cycle();
    let summary = rt.end_gc_cycle();
    assert_eq!(summary.evacuated_regions, 1);
    assert_eq!(rt.manager().list_of(head), None);
}

#[test]
fn test_raw_pointer_taken_mid_cycle_keeps_region() {
    let rt = runtime(8);
    let mut buf = rt.mutator_buffer();
    let addr = rt.allocate(&mut buf, 256, |_| {}).unwrap();
    let head = rt.manager().table().region_of(addr).unwrap();
    drop(buf);
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0x5A, 256) };

    rt.begin_gc_cycle();
    assert_eq!(rt.manager().list_of(head), Some(ListId::FromSpace));
    assert!(rt.manager().register_raw_pointer(addr));
    assert_eq!(rt.manager().list_of(head), Some(ListId::RawPointerPinned));

    let summary = rt.end_gc_cycle();
    assert_eq!(summary.evacuated_regions, 0);
    assert_eq!(rt.manager().list_of(head), Some(ListId::RawPointerPinned));
    assert_eq!(rt.manager().free_index().dirty_unit_count(), 0);
    assert_eq!(unsafe { *((addr + 255) as *const u8) }, 0x5A);

    assert!(rt.manager().unregister_raw_pointer(addr));
    assert_eq!(rt.manager().list_of(head), Some(ListId::RecentFull));
}

#[test]
fn test_objects_allocated_during_cycle_survive_sweep() {
    let rt = runtime(16);
    rt.begin_gc_cycle();

    let mut heads = Vec::new();
    for phase in [GcPhase::Mark, GcPhase::Copy, GcPhase::Fix] {
        rt.set_phase(phase);
        let addr = rt.allocate_large(UNIT_SIZE, |_| {}).unwrap();
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0x33, 64) };
        heads.push(rt.manager().table().region_of(addr).unwrap());
    }

    // Nothing marked these objects, but they were born in this cycle.
    let summary = rt.end_gc_cycle();
    assert_eq!(summary.swept_regions, 0);
    for &head in &heads {
        assert_eq!(rt.manager().list_of(head), Some(ListId::OldLarge));
        let first = unsafe { *(rt.manager().table().region_start(head) as *const u8) };
        assert_eq!(first, 0x33);
    }

    // Unmarked through a whole cycle, they die.
    rt.begin_gc_cycle();
    let summary = rt.end_gc_cycle();
    assert_eq!(summary.swept_regions, 3);
    for &head in &heads {
        assert_eq!(role_of(rt.manager(), head), RegionRole::Free);
    }
}

#[test]
fn test_collector_buffer_fills_to_space() {
    let rt = runtime(8);
    let mut collector = rt.collector_buffer();

    rt.begin_gc_cycle();
    rt.set_phase(GcPhase::Copy);
    let copy = rt.manager().alloc_pinned(16, false, GcPhase::Copy).unwrap();
    let evacuated = collector.allocate(64, rt.phase()).unwrap();
    let head = rt.manager().table().region_of(evacuated).unwrap();
    assert_eq!(
        rt.manager().table().get(head).copy_line(),
        rt.manager().table().region_start(head)
    );
    collector.retire(rt.phase());
    assert_eq!(rt.manager().list_of(head), Some(ListId::ToSpace));
    assert!(rt.manager().record_live(copy, 16));
    rt.end_gc_cycle();

    // Next cycle, last cycle's to-space is from-space.
    rt.begin_gc_cycle();
    assert_eq!(rt.manager().list_of(head), Some(ListId::FromSpace));
    rt.end_gc_cycle();
}

#[test]
fn test_stats_snapshot_serializes() {
    let rt = runtime(8);
    rt.allocate_large(UNIT_SIZE + 1, |_| {}).unwrap();

    let stats = rt.stats();
    assert_eq!(stats.total_units, 8);
    assert_eq!(stats.inactive_zone, 2);
    assert_eq!(stats.used_region_bytes, 2 * UNIT_SIZE);
    assert_eq!(stats.list("RecentLarge").map(|l| l.regions), Some(1));

    let json = stats.to_json().unwrap();
    assert!(json.contains("\"RecentLarge\""));
}
