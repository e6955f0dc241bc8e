//! Runtime Module - Heap Context for a Collector
//!
//! [`HeapRuntime`] bundles what one heap instance needs: the region manager,
//! the collector worker pool, the current collection phase and the cycle
//! counters. It wraps the manager's allocation paths in the collect-and-retry
//! loop that turns a transient `None` into either an address or
//! [`HeapError::OutOfMemory`].
//!
//! ## Cycle outline
//!
//! ```text
//! begin_gc_cycle()          full mutator regions ──► from-space
//!   set_phase(Mark ...)     collector marks, calls record_live
//!   set_phase(Copy ...)     collector evacuates into collector buffers
//! end_gc_cycle()            sweep, from-space ──► garbage ──► dirty tree,
//!                           release cache overflow, clear marks
//! ```

use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::gc::{AtomicGcPhase, GcPhase};
use crate::heap::buffer::{AllocBuffer, BufferKind};
use crate::heap::manager::{AllocationThrottle, NoThrottle, RegionManager};
use crate::stats::HeapStats;
use crate::util::constants::UNIT_SIZE;
use crate::worker::GcThreadPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one collection cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    /// Unmovable regions found dead by the sweep
    pub swept_regions: usize,
    /// From-space regions turned into garbage
    pub evacuated_regions: usize,
    pub reclaimed_units: usize,
    pub released_bytes: usize,
    #[serde(skip)]
    pub duration: Duration,
}

/// HeapRuntime - one heap and its collector plumbing
pub struct HeapRuntime {
    config: HeapConfig,
    manager: Arc<RegionManager>,
    pool: GcThreadPool,
    phase: AtomicGcPhase,
    gc_count: AtomicU64,
    prev_gc_start: Mutex<Option<Instant>>,
}

impl HeapRuntime {
    /// Map the heap and start the collector workers
    ///
    /// # Errors
    /// - `Configuration` if `config` does not validate
    /// - `ArenaMapping` if the arena cannot be reserved
    /// - `WorkerSpawn` if a worker thread cannot be started
    ///
    /// # Examples
    /// ```rust
    /// use regionheap::{HeapConfig, HeapRuntime};
    ///
    /// let runtime = HeapRuntime::new(HeapConfig {
    ///     heap_size: 16 * 1024 * 1024,
    ///     gc_threads: Some(2),
    ///     ..Default::default()
    /// })?;
    /// let addr = runtime.allocate_pinned(48, |_| {})?;
    /// assert_ne!(addr, 0);
    /// # Ok::<(), regionheap::HeapError>(())
    /// ```
    pub fn new(config: HeapConfig) -> Result<Self> {
        Self::with_throttle(config, Arc::new(NoThrottle))
    }

    pub fn with_throttle(
        config: HeapConfig,
        throttle: Arc<dyn AllocationThrottle>,
    ) -> Result<Self> {
        let manager = Arc::new(RegionManager::with_throttle(&config, throttle)?);
        let pool = GcThreadPool::new(config.worker_count(), "regionheap-gc")?;

        Ok(Self {
            config,
            manager,
            pool,
            phase: AtomicGcPhase::default(),
            gc_count: AtomicU64::new(0),
            prev_gc_start: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<RegionManager> {
        &self.manager
    }

    pub fn pool(&self) -> &GcThreadPool {
        &self.pool
    }

    pub fn phase(&self) -> GcPhase {
        self.phase.load()
    }

    pub fn set_phase(&self, phase: GcPhase) {
        let prev = self.phase.load();
        self.phase.store(phase);
        log::debug!("gc phase {:?} -> {:?}", prev, phase);
    }

    /// Number of collection cycles started
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Start time of the most recent collection cycle
    pub fn prev_gc_start(&self) -> Option<Instant> {
        *self.prev_gc_start.lock()
    }

    /// Time since the most recent collection cycle started
    pub fn since_last_gc(&self) -> Option<Duration> {
        self.prev_gc_start().map(|start| start.elapsed())
    }

    /// Buffer for a mutator thread
    pub fn mutator_buffer(&self) -> AllocBuffer {
        AllocBuffer::new(Arc::clone(&self.manager), BufferKind::Mutator)
    }

    /// Buffer for a collector thread that evacuates objects
    pub fn collector_buffer(&self) -> AllocBuffer {
        AllocBuffer::new(Arc::clone(&self.manager), BufferKind::Collector)
    }

    /// Allocate through a mutator buffer
    ///
    /// On failure `collect` runs and the allocation is retried, up to
    /// `alloc_retry_limit` times.
    ///
    /// # Errors
    /// `OutOfMemory` once the retry budget is spent
    pub fn allocate<F>(&self, buffer: &mut AllocBuffer, size: usize, collect: F) -> Result<usize>
    where
        F: FnMut(&HeapRuntime),
    {
        self.with_retry(size, collect, |phase| buffer.allocate(size, phase))
    }

    /// Allocate an object the collector never moves
    pub fn allocate_pinned<F>(&self, size: usize, collect: F) -> Result<usize>
    where
        F: FnMut(&HeapRuntime),
    {
        self.with_retry(size, collect, |phase| self.manager.alloc_pinned(size, true, phase))
    }

    /// Allocate an object in a region of its own
    pub fn allocate_large<F>(&self, size: usize, collect: F) -> Result<usize>
    where
        F: FnMut(&HeapRuntime),
    {
        self.with_retry(size, collect, |phase| self.manager.alloc_large(size, true, phase))
    }

    fn with_retry<F, A>(&self, size: usize, mut collect: F, mut attempt: A) -> Result<usize>
    where
        F: FnMut(&HeapRuntime),
        A: FnMut(GcPhase) -> Option<usize>,
    {
        if let Some(addr) = attempt(self.phase()) {
            return Ok(addr);
        }

        for retry in 1..=self.config.alloc_retry_limit {
            log::debug!(
                "allocation of {} bytes failed, collecting (retry {}/{})",
                size,
                retry,
                self.config.alloc_retry_limit
            );
            collect(self);
            if let Some(addr) = attempt(self.phase()) {
                return Ok(addr);
            }
        }

        let available = self.available_bytes();
        log::warn!(
            "out of memory: {} bytes requested after {} retries, {} bytes available",
            size,
            self.config.alloc_retry_limit,
            available
        );
        Err(HeapError::OutOfMemory {
            requested: size,
            available,
        })
    }

    /// Free bytes in the trees plus the untouched inactive zone
    pub fn available_bytes(&self) -> usize {
        let free = self.manager.free_index();
        let untouched =
            (self.manager.region_heap_end() - self.manager.inactive_zone()) as usize * UNIT_SIZE;
        free.dirty_bytes() + free.released_bytes() + untouched
    }

    /// Start a collection cycle
    ///
    /// Bumps the cycle counter, records the start time and moves full
    /// mutator regions into from-space. Returns the new cycle number.
    pub fn begin_gc_cycle(&self) -> u64 {
        let cycle = self.gc_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.prev_gc_start.lock() = Some(Instant::now());
        self.set_phase(GcPhase::Enum);

        let enlisted = self.manager.enlist_from_space();
        if self.config.verbose {
            log::info!("gc cycle {} started: {} regions in from-space", cycle, enlisted);
        } else {
            log::debug!("gc cycle {} started: {} regions in from-space", cycle, enlisted);
        }
        cycle
    }

    /// Finish the current collection cycle
    ///
    /// The collector must have evacuated every live object out of
    /// from-space before calling this. Dead unmovable regions and the
    /// whole from-space are reclaimed on the worker pool, the cache budget
    /// is applied and marks are cleared for the next cycle.
    pub fn end_gc_cycle(&self) -> CycleSummary {
        let swept_regions = self.manager.sweep_unmovable_regions();
        let evacuated_regions = self.manager.reclaim_from_space();
        let reclaimed_units = self.manager.reclaim_garbage_regions_parallel(&self.pool);
        let released_bytes = self.manager.release_cached_memory();
        self.manager.clear_gc_marks();
        self.set_phase(GcPhase::Idle);

        let summary = CycleSummary {
            cycle: self.gc_count(),
            swept_regions,
            evacuated_regions,
            reclaimed_units,
            released_bytes,
            duration: self.since_last_gc().unwrap_or_default(),
        };

        if self.config.verbose {
            log::info!(
                "gc cycle {} finished in {:?}: reclaimed {} KB, released {} KB",
                summary.cycle,
                summary.duration,
                reclaimed_units * UNIT_SIZE / 1024,
                released_bytes / 1024
            );
        } else {
            log::debug!("gc cycle {} finished: {:?}", summary.cycle, summary);
        }
        summary
    }

    /// Heap snapshot including the cycle counter
    pub fn stats(&self) -> HeapStats {
        let mut stats = self.manager.stats();
        stats.gc_count = self.gc_count();
        stats
    }

    /// Stop the collector workers
    pub fn shutdown(&self) {
        self.pool.exit();
        log::debug!("heap runtime shut down after {} cycles", self.gc_count());
    }
}

impl std::fmt::Debug for HeapRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRuntime")
            .field("phase", &self.phase())
            .field("gc_count", &self.gc_count())
            .field("manager", &self.manager)
            .field("pool", &self.pool)
            .finish()
    }
}
