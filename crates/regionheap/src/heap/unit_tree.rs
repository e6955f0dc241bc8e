//! Unit Interval Tree - Free Unit Ranges
//!
//! A Cartesian tree over maximal free unit ranges `[index, index + count)`.
//! Nodes are ordered by `index` (binary search tree) and heap-ordered by
//! `count`, so the largest free run sits at the root:
//!
//! ```text
//!                 [40, +12)
//!                /         \
//!         [8, +6)           [90, +9)
//!        /       \                  \
//!   [0, +2)   [20, +3)            [120, +1)
//! ```
//!
//! Taking `n` units descends left while the left child can still serve the
//! request, which yields the lowest-addressed range that fits. Checking the
//! root alone answers "is there any range of `n` units".
//!
//! # Node Storage
//!
//! Nodes live in a slab owned by the tree and are linked by `u32` slot
//! indices. The slab and the traversal stack are sized by [`init`] for the
//! worst case (every other unit free), so tree operations never allocate.
//! The tree sits underneath the heap allocator and must not depend on it.
//!
//! [`init`]: UnitIntervalTree::init

use crate::heap_check;
use crate::heap_fatal;
use std::sync::Arc;

const NIL: u32 = u32::MAX;

/// Receives boundary tags for free ranges
///
/// Called with the final shape of every range the tree touches when the
/// caller asks for metadata refresh.
pub trait FreeUnitMarker: Send + Sync {
    fn mark_free(&self, index: u32, count: u32);
}

#[derive(Debug, Clone, Copy)]
struct Node {
    index: u32,
    count: u32,
    left: u32,
    right: u32,
    parent: u32,
}

impl Node {
    fn end(&self) -> u64 {
        self.index as u64 + self.count as u64
    }
}

/// Cartesian tree of disjoint, non-adjacent free unit ranges
pub struct UnitIntervalTree {
    nodes: Vec<Node>,
    free_slots: Vec<u32>,
    root: u32,
    total_count: usize,
    stack: Vec<u32>,
    marker: Option<Arc<dyn FreeUnitMarker>>,
}

impl UnitIntervalTree {
    /// Create a tree able to hold every range of an `expected_unit_count`
    /// unit space without allocating
    pub fn new(expected_unit_count: usize) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            root: NIL,
            total_count: 0,
            stack: Vec::new(),
            marker: None,
        };
        tree.init(expected_unit_count);
        tree
    }

    /// Reset the tree and pre-size its node slab
    ///
    /// At most `(n + 1) / 2` disjoint non-adjacent ranges fit in `n` units.
    pub fn init(&mut self, expected_unit_count: usize) {
        let max_nodes = expected_unit_count / 2 + 1;
        self.nodes = Vec::with_capacity(max_nodes);
        self.free_slots = Vec::with_capacity(max_nodes);
        self.stack = Vec::with_capacity(max_nodes);
        self.root = NIL;
        self.total_count = 0;
    }

    /// Install the sink used when metadata refresh is requested
    pub fn set_free_marker(&mut self, marker: Arc<dyn FreeUnitMarker>) {
        self.marker = Some(marker);
    }

    /// Total number of free units held
    #[inline]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    /// Number of distinct ranges held
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_slots.len()
    }

    /// Size of the largest free range, or 0 when empty
    pub fn largest_count(&self) -> u32 {
        if self.root == NIL {
            0
        } else {
            self.node(self.root).count
        }
    }

    /// Insert the free range `[index, index + count)`
    ///
    /// Merges with touching neighbours on either side. Returns false, with
    /// the tree unchanged, when `count` is zero or the range overlaps a
    /// range already in the tree.
    pub fn merge_insert(&mut self, index: u32, count: u32, refresh: bool) -> bool {
        if count == 0 {
            return false;
        }
        let end = index as u64 + count as u64;
        if end > u32::MAX as u64 {
            return false;
        }

        let (pred, succ) = self.neighbours(index);
        if pred != NIL && self.node(pred).end() > index as u64 {
            return false;
        }
        if succ != NIL && end > self.node(succ).index as u64 {
            return false;
        }

        let touches_left = pred != NIL && self.node(pred).end() == index as u64;
        let touches_right = succ != NIL && end == self.node(succ).index as u64;

        let merged = match (touches_left, touches_right) {
            (true, true) => {
                let absorbed = self.node(succ).count;
                self.remove_node(succ);
                self.node_mut(pred).count += count + absorbed;
                self.sift_up(pred);
                pred
            },
            (true, false) => {
                self.node_mut(pred).count += count;
                self.sift_up(pred);
                pred
            },
            (false, true) => {
                let node = self.node_mut(succ);
                node.index = index;
                node.count += count;
                self.sift_up(succ);
                succ
            },
            (false, false) => self.insert_leaf(index, count),
        };

        self.total_count += count as usize;
        if refresh {
            self.refresh(merged);
        }
        self.debug_verify();
        true
    }

    /// Take `count` units from the lowest-addressed range that fits
    ///
    /// Returns the first unit index of the taken range. The chosen range
    /// keeps its high remainder. Returns `None`, with the tree unchanged,
    /// when `count` is zero or no single range is large enough.
    pub fn take_units(&mut self, count: u32, refresh: bool) -> Option<u32> {
        if count == 0 || self.root == NIL || self.node(self.root).count < count {
            return None;
        }

        let mut cur = self.root;
        loop {
            let left = self.node(cur).left;
            if left != NIL && self.node(left).count >= count {
                cur = left;
            } else {
                break;
            }
        }

        let taken = self.node(cur).index;
        self.shrink_low(cur, count);
        if refresh && self.slot_live(cur) {
            self.refresh(cur);
        }
        self.debug_verify();
        Some(taken)
    }

    /// Carve up to `max_count` units off the high end of the
    /// highest-addressed range
    ///
    /// Used when handing cached memory back to the OS, where walking from
    /// the top keeps away from ranges that allocation is reusing.
    pub fn take_highest(&mut self, max_count: u32, refresh: bool) -> Option<(u32, u32)> {
        if max_count == 0 || self.root == NIL {
            return None;
        }

        let mut cur = self.root;
        while self.node(cur).right != NIL {
            cur = self.node(cur).right;
        }

        let node = *self.node(cur);
        let carved = node.count.min(max_count);
        let start = node.index + node.count - carved;

        self.total_count -= carved as usize;
        if carved == node.count {
            self.remove_node(cur);
        } else {
            self.node_mut(cur).count -= carved;
            self.sift_down(cur);
            if refresh {
                self.refresh(cur);
            }
        }
        self.debug_verify();
        Some((start, carved))
    }

    /// Visit every range, right subtree before left subtree
    pub fn for_each_range(&mut self, mut f: impl FnMut(u32, u32)) {
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();
        if self.root != NIL {
            stack.push(self.root);
        }
        while let Some(slot) = stack.pop() {
            let node = *self.node(slot);
            f(node.index, node.count);
            if node.left != NIL {
                stack.push(node.left);
            }
            if node.right != NIL {
                stack.push(node.right);
            }
        }
        self.stack = stack;
    }

    /// All ranges in address order
    pub fn ranges(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::with_capacity(self.node_count());
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.node(cur).left;
            }
            if let Some(slot) = stack.pop() {
                let node = self.node(slot);
                out.push((node.index, node.count));
                cur = node.right;
            }
        }
        out
    }

    /// Check every structural invariant, stopping the process on a mismatch
    ///
    /// Walks the whole tree: order, heap property, parent links, disjoint
    /// non-adjacent ranges and the running total.
    pub fn verify(&self) {
        if self.root != NIL {
            heap_check!(
                self.node(self.root).parent == NIL,
                "interval tree root has a parent"
            );
        }

        let mut sum = 0usize;
        let mut prev_end: Option<u64> = None;
        for (index, count) in self.ranges() {
            heap_check!(count > 0, "interval tree holds empty range at {}", index);
            if let Some(end) = prev_end {
                heap_check!(
                    end < index as u64,
                    "interval tree ranges overlap or touch at unit {}",
                    index
                );
            }
            prev_end = Some(index as u64 + count as u64);
            sum += count as usize;
        }
        heap_check!(
            sum == self.total_count,
            "interval tree total {} does not match node sum {}",
            self.total_count,
            sum
        );

        for (slot, node) in self.nodes.iter().enumerate() {
            if !self.slot_live(slot as u32) {
                continue;
            }
            for child in [node.left, node.right] {
                if child == NIL {
                    continue;
                }
                let c = self.node(child);
                heap_check!(c.parent == slot as u32, "interval tree parent link broken");
                heap_check!(
                    c.count <= node.count,
                    "interval tree heap order broken: child {} > parent {}",
                    c.count,
                    node.count
                );
            }
        }
    }

    #[inline]
    fn debug_verify(&self) {
        if cfg!(debug_assertions) {
            self.verify();
        }
    }

    fn refresh(&self, slot: u32) {
        if let Some(marker) = &self.marker {
            let node = self.node(slot);
            marker.mark_free(node.index, node.count);
        }
    }

    fn neighbours(&self, index: u32) -> (u32, u32) {
        let mut pred = NIL;
        let mut succ = NIL;
        let mut cur = self.root;
        while cur != NIL {
            let node = self.node(cur);
            if node.index <= index {
                pred = cur;
                cur = node.right;
            } else {
                succ = cur;
                cur = node.left;
            }
        }
        (pred, succ)
    }

    fn insert_leaf(&mut self, index: u32, count: u32) -> u32 {
        let slot = self.alloc_node(index, count);

        if self.root == NIL {
            self.root = slot;
            return slot;
        }

        let mut cur = self.root;
        loop {
            let node = *self.node(cur);
            let next = if index < node.index { node.left } else { node.right };
            if next == NIL {
                if index < node.index {
                    self.node_mut(cur).left = slot;
                } else {
                    self.node_mut(cur).right = slot;
                }
                self.node_mut(slot).parent = cur;
                break;
            }
            cur = next;
        }

        self.sift_up(slot);
        slot
    }

    fn shrink_low(&mut self, slot: u32, count: u32) {
        let node = self.node_mut(slot);
        heap_check!(
            node.count >= count,
            "interval tree count underflow: {} < {}",
            node.count,
            count
        );
        node.index += count;
        node.count -= count;
        let remaining = node.count;
        self.total_count -= count as usize;

        if remaining == 0 {
            self.remove_node(slot);
        } else {
            self.sift_down(slot);
        }
    }

    fn sift_up(&mut self, slot: u32) {
        loop {
            let parent = self.node(slot).parent;
            if parent == NIL || self.node(parent).count >= self.node(slot).count {
                break;
            }
            self.rotate_up(slot);
        }
    }

    fn sift_down(&mut self, slot: u32) {
        while let Some(child) = self.larger_child(slot) {
            if self.node(child).count <= self.node(slot).count {
                break;
            }
            self.rotate_up(child);
        }
    }

    fn larger_child(&self, slot: u32) -> Option<u32> {
        let node = self.node(slot);
        match (node.left, node.right) {
            (NIL, NIL) => None,
            (l, NIL) => Some(l),
            (NIL, r) => Some(r),
            (l, r) => {
                if self.node(l).count >= self.node(r).count {
                    Some(l)
                } else {
                    Some(r)
                }
            },
        }
    }

    /// Rotate `slot` above its parent, keeping address order
    fn rotate_up(&mut self, slot: u32) {
        let parent = self.node(slot).parent;
        let grand = self.node(parent).parent;

        if self.node(parent).left == slot {
            let moved = self.node(slot).right;
            self.node_mut(parent).left = moved;
            if moved != NIL {
                self.node_mut(moved).parent = parent;
            }
            self.node_mut(slot).right = parent;
        } else {
            let moved = self.node(slot).left;
            self.node_mut(parent).right = moved;
            if moved != NIL {
                self.node_mut(moved).parent = parent;
            }
            self.node_mut(slot).left = parent;
        }

        self.node_mut(parent).parent = slot;
        self.node_mut(slot).parent = grand;
        self.replace_child(grand, parent, slot);
    }

    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if parent == NIL {
            self.root = new;
        } else if self.node(parent).left == old {
            self.node_mut(parent).left = new;
        } else {
            self.node_mut(parent).right = new;
        }
    }

    fn remove_node(&mut self, slot: u32) {
        while let Some(child) = self.larger_child(slot) {
            self.rotate_up(child);
        }
        let parent = self.node(slot).parent;
        self.replace_child(parent, slot, NIL);
        self.free_node(slot);
    }

    fn alloc_node(&mut self, index: u32, count: u32) -> u32 {
        let node = Node {
            index,
            count,
            left: NIL,
            right: NIL,
            parent: NIL,
        };

        if let Some(slot) = self.free_slots.pop() {
            self.nodes[slot as usize] = node;
            return slot;
        }

        if self.nodes.len() == self.nodes.capacity() {
            heap_fatal!(
                "interval tree node slab exhausted at {} nodes",
                self.nodes.len()
            );
        }
        self.nodes.push(node);
        (self.nodes.len() - 1) as u32
    }

    fn free_node(&mut self, slot: u32) {
        let node = self.node_mut(slot);
        node.count = 0;
        node.left = NIL;
        node.right = NIL;
        node.parent = NIL;
        self.free_slots.push(slot);
    }

    fn slot_live(&self, slot: u32) -> bool {
        self.nodes[slot as usize].count != 0
    }

    #[inline]
    fn node(&self, slot: u32) -> &Node {
        &self.nodes[slot as usize]
    }

    #[inline]
    fn node_mut(&mut self, slot: u32) -> &mut Node {
        &mut self.nodes[slot as usize]
    }
}

impl std::fmt::Debug for UnitIntervalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitIntervalTree")
            .field("total_count", &self.total_count)
            .field("ranges", &self.ranges())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_empty_tree() {
        let mut tree = UnitIntervalTree::new(64);
        assert!(tree.is_empty());
        assert_eq!(tree.total_count(), 0);
        assert_eq!(tree.take_units(1, true), None);
    }

    #[test]
    fn test_insert_then_take_returns_same_index() {
        let mut tree = UnitIntervalTree::new(64);
        assert!(tree.merge_insert(17, 4, false));
        assert_eq!(tree.take_units(4, false), Some(17));
        assert!(tree.is_empty());
    }

    #[test]
    fn test_merge_right_then_left() {
        let mut tree = UnitIntervalTree::new(256);
        assert!(tree.merge_insert(100, 10, false));
        assert!(tree.merge_insert(110, 5, false));
        assert_eq!(tree.ranges(), vec![(100, 15)]);
        assert_eq!(tree.total_count(), 15);

        assert!(tree.merge_insert(95, 5, false));
        assert_eq!(tree.ranges(), vec![(95, 20)]);
        assert_eq!(tree.total_count(), 20);
    }

    #[test]
    fn test_merge_bridges_both_neighbours() {
        let mut tree = UnitIntervalTree::new(64);
        assert!(tree.merge_insert(0, 3, false));
        assert!(tree.merge_insert(8, 2, false));
        assert_eq!(tree.node_count(), 2);

        assert!(tree.merge_insert(3, 5, false));
        assert_eq!(tree.ranges(), vec![(0, 10)]);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_split_keeps_high_remainder() {
        let mut tree = UnitIntervalTree::new(256);
        assert!(tree.merge_insert(200, 20, false));
        assert_eq!(tree.take_units(5, false), Some(200));
        assert_eq!(tree.ranges(), vec![(205, 15)]);
        assert_eq!(tree.total_count(), 15);
    }

    #[test]
    fn test_take_too_large_leaves_tree_unchanged() {
        let mut tree = UnitIntervalTree::new(512);
        assert!(tree.merge_insert(300, 3, false));
        assert_eq!(tree.take_units(5, false), None);
        assert_eq!(tree.ranges(), vec![(300, 3)]);
        assert_eq!(tree.total_count(), 3);
    }

    #[test]
    fn test_rejects_zero_and_overlap() {
        let mut tree = UnitIntervalTree::new(64);
        assert!(!tree.merge_insert(5, 0, false));
        assert!(tree.merge_insert(10, 10, false));
        assert!(!tree.merge_insert(15, 2, false));
        assert!(!tree.merge_insert(8, 3, false));
        assert!(!tree.merge_insert(19, 5, false));
        assert_eq!(tree.ranges(), vec![(10, 10)]);
        assert_eq!(tree.take_units(0, false), None);
    }

    #[test]
    fn test_prefers_lowest_address() {
        let mut tree = UnitIntervalTree::new(256);
        assert!(tree.merge_insert(100, 50, false));
        assert!(tree.merge_insert(10, 4, false));
        assert!(tree.merge_insert(30, 8, false));

        // Root is the 50-unit range; the 8-unit range is lower and fits.
        assert_eq!(tree.largest_count(), 50);
        assert_eq!(tree.take_units(6, false), Some(30));
        assert_eq!(tree.take_units(4, false), Some(10));
        assert_eq!(tree.take_units(3, false), Some(100));
    }

    #[test]
    fn test_take_highest_carves_from_top() {
        let mut tree = UnitIntervalTree::new(256);
        assert!(tree.merge_insert(0, 10, false));
        assert!(tree.merge_insert(50, 10, false));

        assert_eq!(tree.take_highest(4, false), Some((56, 4)));
        assert_eq!(tree.take_highest(100, false), Some((50, 6)));
        assert_eq!(tree.ranges(), vec![(0, 10)]);
        assert_eq!(tree.total_count(), 10);
    }

    #[test]
    fn test_for_each_range_visits_right_first() {
        let mut tree = UnitIntervalTree::new(64);
        assert!(tree.merge_insert(20, 8, false));
        assert!(tree.merge_insert(0, 2, false));
        assert!(tree.merge_insert(40, 2, false));

        let mut seen = Vec::new();
        tree.for_each_range(|index, _| seen.push(index));
        assert_eq!(seen, vec![20, 40, 0]);
    }

    #[test]
    fn test_node_slots_are_reused() {
        let mut tree = UnitIntervalTree::new(8);
        for _ in 0..100 {
            assert!(tree.merge_insert(0, 1, false));
            assert!(tree.merge_insert(2, 1, false));
            assert_eq!(tree.take_units(1, false), Some(0));
            assert_eq!(tree.take_units(1, false), Some(2));
        }
        assert!(tree.nodes.len() <= 2);
    }

    struct Recorder(Mutex<Vec<(u32, u32)>>);

    impl FreeUnitMarker for Recorder {
        fn mark_free(&self, index: u32, count: u32) {
            self.0.lock().push((index, count));
        }
    }

    #[test]
    fn test_refresh_reports_final_ranges() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut tree = UnitIntervalTree::new(64);
        tree.set_free_marker(recorder.clone());

        assert!(tree.merge_insert(4, 4, true));
        assert!(tree.merge_insert(8, 2, true));
        assert!(tree.merge_insert(20, 2, false));
        assert_eq!(tree.take_units(3, true), Some(4));
        assert_eq!(tree.take_units(3, true), Some(7));

        assert_eq!(*recorder.0.lock(), vec![(4, 4), (4, 6), (7, 3)]);
    }

    #[test]
    #[should_panic(expected = "slab exhausted")]
    fn test_slab_overflow_is_fatal() {
        let mut tree = UnitIntervalTree::new(2);
        tree.merge_insert(0, 1, false);
        tree.merge_insert(2, 1, false);
        tree.merge_insert(4, 1, false);
    }
}
