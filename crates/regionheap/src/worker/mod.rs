//! Worker Module - Parallel Collector Work
//!
//! The collector splits region work (reclaim batches, scanning, fixing)
//! into tasks and runs them on a [`GcThreadPool`].

pub mod thread_pool;

pub use thread_pool::{GcThreadPool, PoolStats, Task};
