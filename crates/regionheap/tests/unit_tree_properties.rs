//! Interval Tree Property Tests
//!
//! Random take/return sequences are replayed against the tree and against
//! a plain per-unit bitmap. After every step:
//! - the tree's ranges are exactly the maximal free runs of the bitmap
//! - the tree's total matches the number of free units
//! - a take lands on the lowest-addressed run that fits

mod common;

use common::assert_ranges_coalesced;
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use regionheap::UnitIntervalTree;

const UNITS: u32 = 96;

/// Maximal runs of free units, in address order
fn runs(free: &[bool]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < free.len() {
        if free[i] {
            let start = i;
            while i < free.len() && free[i] {
                i += 1;
            }
            out.push((start as u32, (i - start) as u32));
        } else {
            i += 1;
        }
    }
    out
}

fn lowest_fit(free: &[bool], count: u32) -> Option<u32> {
    runs(free)
        .into_iter()
        .find(|&(_, len)| len >= count)
        .map(|(start, _)| start)
}

#[quickcheck]
fn prop_tree_matches_bitmap(ops: Vec<(bool, u8)>) -> bool {
    let mut tree = UnitIntervalTree::new(UNITS as usize);
    let mut free = vec![true; UNITS as usize];
    let mut taken: Vec<(u32, u32)> = Vec::new();
    assert!(tree.merge_insert(0, UNITS, false));

    for (is_take, arg) in ops {
        if is_take || taken.is_empty() {
            let count = (arg % 12) as u32 + 1;
            let expected = lowest_fit(&free, count);
            let got = tree.take_units(count, false);
            if got != expected {
                return false;
            }
            if let Some(start) = got {
                for unit in start..start + count {
                    free[unit as usize] = false;
                }
                taken.push((start, count));
            }
        } else {
            let (start, count) = taken.swap_remove(arg as usize % taken.len());
            if !tree.merge_insert(start, count, false) {
                return false;
            }
            for unit in start..start + count {
                free[unit as usize] = true;
            }
        }

        let expected = runs(&free);
        if tree.ranges() != expected {
            return false;
        }
        if tree.total_count() != free.iter().filter(|f| **f).count() {
            return false;
        }
    }

    tree.verify();
    true
}

#[quickcheck]
fn prop_overlapping_insert_is_rejected(start: u8, len: u8, probe: u8) -> TestResult {
    let start = start as u32 % UNITS;
    let len = (len as u32 % (UNITS - start)).max(1);
    let probe = probe as u32 % len;

    let mut tree = UnitIntervalTree::new(UNITS as usize);
    assert!(tree.merge_insert(start, len, false));

    let accepted = tree.merge_insert(start + probe, 1, false);
    TestResult::from_bool(!accepted && tree.ranges() == vec![(start, len)])
}

#[quickcheck]
fn prop_insert_order_does_not_matter(lens: Vec<(u8, bool)>) -> TestResult {
    // Unit-length cells, some left out, inserted forwards and backwards.
    let cells: Vec<u32> = lens
        .iter()
        .enumerate()
        .filter(|(_, (_, keep))| *keep)
        .map(|(i, _)| i as u32)
        .collect();
    if cells.is_empty() {
        return TestResult::discard();
    }
    let span = lens.len();

    let mut forward = UnitIntervalTree::new(span);
    let mut backward = UnitIntervalTree::new(span);
    for &cell in &cells {
        assert!(forward.merge_insert(cell, 1, false));
    }
    for &cell in cells.iter().rev() {
        assert!(backward.merge_insert(cell, 1, false));
    }

    let ranges = forward.ranges();
    assert_ranges_coalesced(&ranges);
    TestResult::from_bool(
        ranges == backward.ranges()
            && forward.total_count() == cells.len()
            && backward.node_count() == ranges.len(),
    )
}

#[test]
fn test_release_carves_from_the_top() {
    let mut tree = UnitIntervalTree::new(64);
    assert!(tree.merge_insert(0, 8, false));
    assert!(tree.merge_insert(20, 10, false));

    assert_eq!(tree.take_highest(4, false), Some((26, 4)));
    assert_eq!(tree.take_highest(100, false), Some((20, 6)));
    assert_eq!(tree.ranges(), vec![(0, 8)]);
    assert_eq!(tree.total_count(), 8);
}
