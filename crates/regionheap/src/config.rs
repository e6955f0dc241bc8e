//! Configuration Module - Heap Tuning Parameters
//!
//! Manages all configuration parameters for the region heap.
//! Proper configuration balances allocation latency against memory footprint.

use crate::util::constants::{GB, MB, UNIT_SIZE};
use std::fmt;
use std::sync::Arc;

/// Observer for the arena base address chosen at heap initialization.
///
/// Embedders that derive compressed or tagged pointers from the heap base
/// register one of these. It is called exactly once, after the arena is
/// mapped and before any region is handed out.
#[derive(Clone)]
pub struct BaseAddrHook(Arc<dyn Fn(usize) + Send + Sync>);

impl BaseAddrHook {
    pub fn new(hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    pub(crate) fn notify(&self, base: usize) {
        (self.0)(base);
    }
}

impl fmt::Debug for BaseAddrHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BaseAddrHook(..)")
    }
}

/// Main configuration for the region heap
///
/// # Examples
///
/// ```rust
/// use regionheap::HeapConfig;
///
/// let config = HeapConfig {
///     heap_size: 64 * 1024 * 1024,
///     gc_threads: Some(2),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Size of the reserved arena in bytes
    ///
    /// Rounded up to a whole number of units. Regions are never handed out
    /// beyond this limit.
    /// Default: 512MB
    pub heap_size: usize,

    /// Bytes made accessible when the arena is mapped
    ///
    /// The rest of the arena becomes accessible as the inactive zone grows.
    /// Default: 0
    pub initial_used_size: usize,

    /// Dirty bytes kept cached after a collection
    ///
    /// Free units above this budget are returned to the OS.
    /// Default: 32MB
    pub cache_size: usize,

    /// Number of collector worker threads
    ///
    /// If None, uses `min(8, num_cpus - 1)` with a floor of one.
    /// Default: Auto-detect
    pub gc_threads: Option<usize>,

    /// Make the whole arena accessible at map time
    ///
    /// Trades a slower heap initialization for no protection changes on
    /// the allocation path.
    /// Default: false
    pub protect_all_upfront: bool,

    /// Keep the whole arena within one 4 GiB-aligned window
    ///
    /// Needed by compressed pointer schemes. Limits `heap_size` to 4 GiB.
    /// Default: false
    pub within_4g: bool,

    /// Advisory base address for the arena
    pub base_hint: Option<usize>,

    /// How many collect-and-retry rounds an allocation gets before
    /// it is reported as out of memory
    ///
    /// Default: 3
    pub alloc_retry_limit: usize,

    /// Log GC cycles at info level
    ///
    /// Default: false
    pub verbose: bool,

    /// Notified with the arena base address after mapping
    pub base_addr_hook: Option<BaseAddrHook>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();

        HeapConfig {
            heap_size: 512 * MB,
            initial_used_size: 0,
            cache_size: 32 * MB,
            gc_threads: Some(cpus.saturating_sub(1).clamp(1, 8)),
            protect_all_upfront: false,
            within_4g: false,
            base_hint: None,
            alloc_retry_limit: 3,
            verbose: false,
            base_addr_hook: None,
        }
    }
}

impl HeapConfig {
    /// Validate configuration
    ///
    /// ```rust
    /// use regionheap::HeapConfig;
    ///
    /// let config = HeapConfig {
    ///     heap_size: 0,
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < UNIT_SIZE {
            return Err(ConfigError::InvalidHeapSize(format!(
                "heap_size must be at least one unit ({} bytes)",
                UNIT_SIZE
            )));
        }

        if self.initial_used_size > self.heap_size {
            return Err(ConfigError::InvalidHeapSize(
                "initial_used_size cannot exceed heap_size".to_string(),
            ));
        }

        if self.within_4g && self.heap_size > 4 * GB {
            return Err(ConfigError::InvalidHeapSize(
                "heap_size cannot exceed 4GB when within_4g is set".to_string(),
            ));
        }

        if self.heap_size / UNIT_SIZE > u32::MAX as usize / 2 {
            return Err(ConfigError::InvalidHeapSize(
                "heap_size has too many units to index".to_string(),
            ));
        }

        if let Some(threads) = self.gc_threads {
            if threads == 0 {
                return Err(ConfigError::InvalidGcThreads(
                    "gc_threads must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Number of collector worker threads after auto-detection
    pub fn worker_count(&self) -> usize {
        self.gc_threads
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).clamp(1, 8))
    }

    /// Number of whole units in the arena
    pub fn unit_count(&self) -> usize {
        self.heap_size / UNIT_SIZE
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - REGIONHEAP_HEAP_SIZE
    /// - REGIONHEAP_CACHE_SIZE
    /// - REGIONHEAP_GC_THREADS
    /// - REGIONHEAP_VERBOSE
    ///
    /// ```bash
    /// export REGIONHEAP_HEAP_SIZE=1073741824  # 1GB
    /// export REGIONHEAP_GC_THREADS=4
    /// export REGIONHEAP_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REGIONHEAP_HEAP_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_size = size;
            }
        }

        if let Ok(val) = std::env::var("REGIONHEAP_CACHE_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.cache_size = size;
            }
        }

        if let Ok(val) = std::env::var("REGIONHEAP_GC_THREADS") {
            if let Ok(threads) = val.parse::<usize>() {
                config.gc_threads = Some(threads);
            }
        }

        if let Ok(val) = std::env::var("REGIONHEAP_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap size: {0}")]
    InvalidHeapSize(String),

    #[error("Invalid GC threads: {0}")]
    InvalidGcThreads(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_config() {
        let config = HeapConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_count() >= 1);
        assert_eq!(config.unit_count(), 512 * MB / UNIT_SIZE);
    }

    #[test]
    fn test_invalid_heap_size() {
        let config = HeapConfig {
            heap_size: UNIT_SIZE - 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeapSize(_))
        ));
    }

    #[test]
    fn test_initial_used_exceeds_heap() {
        let config = HeapConfig {
            heap_size: 4 * MB,
            initial_used_size: 8 * MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_within_4g_limit() {
        let config = HeapConfig {
            heap_size: 8 * GB,
            within_4g: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threads() {
        let config = HeapConfig {
            gc_threads: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGcThreads(_))
        ));
    }

    #[test]
    fn test_base_addr_hook_notifies() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_hook = Arc::clone(&seen);
        let hook = BaseAddrHook::new(move |base| seen_in_hook.store(base, Ordering::SeqCst));

        hook.notify(0x7000_0000);
        assert_eq!(seen.load(Ordering::SeqCst), 0x7000_0000);
        assert_eq!(format!("{:?}", hook), "BaseAddrHook(..)");
    }
}
