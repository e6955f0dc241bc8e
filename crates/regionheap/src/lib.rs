//! # regionheap - Region-Based Heap for a Concurrent Copying Collector
//!
//! regionheap manages the memory underneath a concurrent, region-based
//! garbage collector. It does not trace or move objects itself; it hands
//! out regions, tracks which collector role each region plays, and takes
//! regions back once the collector is done with them.
//!
//! ## Overview
//!
//! - **Virtual Memory Arena**: One contiguous reservation, optionally kept
//!   inside a 4 GiB-aligned window, made accessible as the heap grows
//! - **Unit Interval Trees**: Free units kept as merged ranges in a
//!   Cartesian tree, biased towards low addresses
//! - **Dirty and Released Caches**: Reclaimed units stay backed up to a
//!   cache budget; the rest is returned to the OS
//! - **Role Lists**: Every handed-out region sits in exactly one list
//!   (thread-local, from-space, pinned, large, ...)
//! - **Worker Pool**: Collector work is split into tasks and run on a
//!   fixed set of threads with an adjustable active count
//!
//! ## Quick Start
//!
//! ```rust
//! use regionheap::{HeapConfig, HeapRuntime};
//!
//! fn main() -> Result<(), regionheap::HeapError> {
//!     let runtime = HeapRuntime::new(HeapConfig {
//!         heap_size: 32 * 1024 * 1024,
//!         gc_threads: Some(2),
//!         ..Default::default()
//!     })?;
//!
//!     let mut buffer = runtime.mutator_buffer();
//!     let addr = runtime.allocate(&mut buffer, 64, |rt| {
//!         rt.begin_gc_cycle();
//!         rt.end_gc_cycle();
//!     })?;
//!
//!     unsafe {
//!         *(addr as *mut u64) = 0x12345678;
//!     }
//!
//!     drop(buffer);
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     HeapRuntime                          │
//! │   phase, cycle counter, collect-and-retry allocation     │
//! └──────────────┬──────────────────────────────┬────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────────┐   ┌──────────────────────┐
//! │        RegionManager         │   │     GcThreadPool     │
//! │  role lists, pinned classes, │◄──│  reclaim batches     │
//! │  inactive zone               │   └──────────────────────┘
//! └──────┬─────────────┬─────────┘
//!        │             │
//!        ▼             ▼
//! ┌─────────────┐ ┌───────────────────────────┐
//! │ RegionTable │ │      FreeRegionIndex      │
//! │ descriptor  │ │  dirty tree │ released    │
//! │ per unit    │ │             │ tree        │
//! └──────┬──────┘ └─────────────┴─────────────┘
//!        ▼
//! ┌──────────────────────────────────────────┐
//! │           VirtualMemoryArena             │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Failure model
//!
//! Running out of regions is an ordinary event: core operations return
//! `None` and the caller collects and retries. Failing to map the arena is
//! an [`HeapError`]. Broken bookkeeping, such as overlapping free ranges or
//! a region found in the wrong list, panics through [`heap_fatal!`].

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod runtime;
pub mod stats;
pub mod util;
pub mod worker;

pub use config::{BaseAddrHook, ConfigError, HeapConfig};
pub use error::{HeapError, Result};
pub use gc::{AtomicGcPhase, GcPhase};
pub use heap::{
    AllocBuffer, AllocationThrottle, BufferKind, FreeRegionIndex, ListId, NoThrottle,
    ObjectSizer, RegionHandle, RegionManager, RegionRole, UnitIntervalTree, VirtualMemoryArena,
};
pub use runtime::{CycleSummary, HeapRuntime};
pub use stats::{HeapStats, ListStats};
pub use util::constants::{LARGE_OBJECT_THRESHOLD, UNIT_SIZE};
pub use worker::{GcThreadPool, PoolStats};
