//! Error Module - Region Heap Error Types
//!
//! Defines the error values returned by the region heap.
//!
//! # Error Categories
//!
//! ## Environmental Errors
//! - `ArenaMapping` - The OS refused to reserve or protect address space
//!
//! ## Capacity Errors
//! - `OutOfMemory` - Allocation failed even after the retry budget was spent
//!
//! ## Usage Errors
//! - `InvalidArgument` - Function argument fails validation
//! - `Configuration` - Invalid heap configuration
//!
//! Bookkeeping violations (overlapping free ranges, a region found in two
//! lists, a total-count mismatch) are not represented here. They go through
//! [`heap_fatal!`](crate::heap_fatal) and never reach a caller as a value.

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for region heap operations
///
/// # Examples
///
/// ```rust
/// use regionheap::HeapError;
///
/// fn describe(err: &HeapError) -> &'static str {
///     match err {
///         HeapError::OutOfMemory { .. } => "collect and retry later",
///         HeapError::ArenaMapping(_) => "cannot continue",
///         _ => "fix the caller",
///     }
/// }
///
/// let err = HeapError::OutOfMemory { requested: 64, available: 0 };
/// assert_eq!(describe(&err), "collect and retry later");
/// ```
#[derive(Debug, Error)]
pub enum HeapError {
    /// Address space reservation or protection failed
    ///
    /// **When returned:** `mmap`/`mprotect` (or `VirtualAlloc`) failed while
    /// building the arena. Partial mappings are released before returning.
    ///
    /// **Recovery strategy:** None at this layer - the heap cannot exist
    /// without its arena.
    #[error("Arena mapping failed: {0}")]
    ArenaMapping(String),

    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** The caller-side retry loop ran out of attempts.
    ///
    /// **Recovery strategy:** Surface to the embedding runtime as an
    /// out-of-memory condition.
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    ///
    /// **Example scenarios:**
    /// - Zero-sized arena request
    /// - 4 GiB-aligned arena larger than 4 GiB
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A collector worker thread could not be started
    #[error("Worker spawn failed: {0}")]
    WorkerSpawn(String),
}

impl HeapError {
    /// Check if this error is recoverable by collecting and retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HeapError::OutOfMemory { .. })
    }

    /// Check if the heap cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, HeapError::ArenaMapping(_))
    }
}

/// Result type alias for region heap operations
pub type Result<T> = std::result::Result<T, HeapError>;

/// Report a broken heap invariant and stop.
///
/// Free-space bookkeeping that has gone wrong cannot be repaired in place:
/// continuing risks handing the same memory to two owners. The message is
/// logged at error level and the current thread panics.
#[macro_export]
macro_rules! heap_fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        log::error!("heap invariant violated: {}", msg);
        panic!("heap invariant violated: {}", msg)
    }};
}

/// Assert a heap invariant, escalating to [`heap_fatal!`] on failure.
#[macro_export]
macro_rules! heap_check {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::heap_fatal!($($arg)*);
        }
    };
}
