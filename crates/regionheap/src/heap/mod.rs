//! Heap Module - Region-Based Memory Management
//!
//! The heap is one contiguous arena cut into fixed-size units. A region is a
//! run of one or more units with a single role:
//!
//! - Thread-local regions: bump allocation by one mutator or collector thread
//! - Pinned regions: objects the collector never moves, optionally served
//!   from fixed-size cell classes
//! - Large regions: one object spanning as many units as it needs
//! - From/to-space and garbage: regions moving through a collection
//!
//! Free units are tracked by two interval trees: a dirty tree of units that
//! are still backed by memory, and a released tree of units returned to
//! the OS.
//!
//! ```text
//! ┌──────────────────────── VirtualMemoryArena ─────────────────────────┐
//! │ unit 0 │ unit 1 │ unit 2 │ ...                         │ inactive   │
//! └────────┴────────┴────────┴─────────────────────────────┴────────────┘
//!      ▲                ▲                                        ▲
//!  RegionTable     FreeRegionIndex                          RegionManager
//!  (descriptor     (dirty / released                        (grows the
//!   per unit)       UnitIntervalTree)                        inactive zone)
//! ```

pub mod arena;
pub mod buffer;
pub mod free_index;
pub mod manager;
pub mod page;
pub mod pinned;
pub mod region;
pub mod region_list;
pub mod unit_tree;

pub use arena::{MapOptions, Protection, VirtualMemoryArena};
pub use buffer::{AllocBuffer, BufferKind};
pub use free_index::{FreeRegionIndex, FreeSource};
pub use manager::{AllocationThrottle, NoThrottle, ObjectSizer, RegionManager};
pub use pinned::fixed_class_of;
pub use region::{RegionDescriptor, RegionHandle, RegionRole, RegionTable};
pub use region_list::{ListId, RegionList, LIST_COUNT};
pub use unit_tree::{FreeUnitMarker, UnitIntervalTree};
