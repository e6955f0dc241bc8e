//! Page Helpers - OS Page Size and Page Alignment
//!
//! Every range handed to the OS (protect, commit, decommit, unmap) is
//! rounded to the system page size first.

use std::sync::atomic::{AtomicUsize, Ordering};

/// System page size (cached)
static SYSTEM_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Get system page size dynamically
///
/// Returns actual system page size from OS.
/// Caches result for performance.
pub fn get_page_size() -> usize {
    let cached = SYSTEM_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let size = page_size::get();
    SYSTEM_PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Align size to page boundary (round up)
pub fn align_to_page(size: usize) -> usize {
    let ps = get_page_size();
    (size + ps - 1) & !(ps - 1)
}

/// Align address to page boundary (round down)
pub fn align_down_to_page(addr: usize) -> usize {
    let ps = get_page_size();
    addr & !(ps - 1)
}

/// Convert bytes to pages (round up)
pub fn bytes_to_pages(bytes: usize) -> usize {
    bytes.div_ceil(get_page_size())
}

/// Check if address is page-aligned
pub fn is_page_aligned(addr: usize) -> bool {
    addr.is_multiple_of(get_page_size())
}
