//! Shared fixtures and assertion helpers for the integration tests

#![allow(dead_code)]

use regionheap::{
    HeapConfig, HeapRuntime, ListId, ObjectSizer, RegionManager, RegionRole, UNIT_SIZE,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Heap configuration of `units` units with a fixed worker count
pub fn heap_config(units: usize) -> HeapConfig {
    HeapConfig {
        heap_size: units * UNIT_SIZE,
        cache_size: 0,
        gc_threads: Some(2),
        verbose: false,
        ..Default::default()
    }
}

/// Test fixture around a manager
pub struct ManagerFixture {
    pub manager: Arc<RegionManager>,
}

impl ManagerFixture {
    pub fn new(units: usize) -> Self {
        Self::with_config(heap_config(units))
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let manager = Arc::new(
            RegionManager::new(&config).expect("manager initialization should succeed"),
        );
        Self { manager }
    }

    /// Take a region and link it into `list`
    pub fn take_listed(&self, units: u32, list: ListId) -> u32 {
        let head = self
            .manager
            .take_region(units, list.role(), false, false)
            .unwrap_or_else(|| panic!("no room for {} units", units));
        self.manager.list(list).prepend(self.manager.table(), head);
        head
    }

    /// Free-unit accounting must cover the whole arena exactly once
    #[track_caller]
    pub fn assert_units_conserved(&self) {
        let mgr = &self.manager;
        let listed: usize = (0..regionheap::heap::LIST_COUNT)
            .filter_map(ListId::from_slot)
            .map(|id| mgr.list(id).unit_count())
            .sum();
        let free = mgr.free_index().dirty_unit_count() + mgr.free_index().released_unit_count();
        let untouched = (mgr.region_heap_end() - mgr.inactive_zone()) as usize;

        assert_eq!(
            listed + free + untouched,
            mgr.region_heap_end() as usize,
            "listed {} + free {} + untouched {} does not cover the heap",
            listed,
            free,
            untouched
        );
    }
}

/// Runtime with `units` units of heap
pub fn runtime(units: usize) -> HeapRuntime {
    HeapRuntime::new(heap_config(units)).expect("runtime initialization should succeed")
}

/// Walks objects laid out back to back with one fixed size
pub struct FixedSizer(pub usize);

impl ObjectSizer for FixedSizer {
    fn object_size(&self, _addr: usize) -> usize {
        self.0
    }
}

/// Assert that no address was handed out twice
#[track_caller]
pub fn assert_all_addresses_unique(addresses: &[usize], context: &str) {
    let unique: HashSet<_> = addresses.iter().collect();
    assert_eq!(
        unique.len(),
        addresses.len(),
        "{}: {} duplicate addresses out of {}",
        context,
        addresses.len() - unique.len(),
        addresses.len()
    );
}

/// Assert that ranges are sorted, disjoint and not adjacent
#[track_caller]
pub fn assert_ranges_coalesced(ranges: &[(u32, u32)]) {
    for pair in ranges.windows(2) {
        let (a, a_len) = pair[0];
        let (b, _) = pair[1];
        assert!(
            (a + a_len) < b,
            "ranges ({}, {}) and ({}, ..) overlap or touch",
            a,
            a_len,
            b
        );
    }
}

/// Role a region has in the table
pub fn role_of(manager: &RegionManager, head: u32) -> RegionRole {
    manager.table().get(head).role()
}
