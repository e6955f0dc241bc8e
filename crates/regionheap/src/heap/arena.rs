//! Virtual Memory Arena
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! One arena backs one heap. It reserves a contiguous address range with no
//! access rights and opens it up for reading and writing as the heap grows:
//!
//! ```text
//! base                used_end                                 mapped_end
//!  │◄── read/write ────►│◄────────── reserved, no access ─────────►│
//!  └────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! ============================================================================
//! LIFECYCLE
//! ============================================================================
//!
//! ```text
//! map ──► extend_used ──► decommit / commit ──► destroy
//!  │           │                  │                 │
//!  │           │                  │                 └── munmap / MEM_RELEASE
//!  │           │                  └── madvise(DONTNEED) / MEM_DECOMMIT
//!  │           └── mprotect(READ|WRITE) / MEM_COMMIT
//!  └── mmap(PROT_NONE, MAP_NORESERVE) / MEM_RESERVE
//! ```
//!
//! Arenas are only created through [`VirtualMemoryArena::map`] and
//! [`VirtualMemoryArena::map_within_4g_alignment`]. Creating arenas from
//! several threads at once is not supported; heap initialization is
//! serialized by the caller.

use crate::error::{HeapError, Result};
use crate::heap::page;
use crate::util::constants::FOUR_GB;
use crate::util::Alignment;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Page protection applied to accessible parts of the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
    ReadWriteExec,
}

/// Options for mapping an arena
#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Diagnostic label, shows up in logs only
    pub tag: &'static str,
    /// Preferred base address; the OS may ignore it
    pub base_hint: Option<usize>,
    /// Protection for the accessible part of the arena
    pub protection: Protection,
    /// Make the whole arena accessible immediately
    pub protect_all_upfront: bool,
    /// Extra OS-specific mapping flags, OR-ed into the reservation call
    pub platform_flags: i32,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            tag: "regionheap",
            base_hint: None,
            protection: Protection::ReadWrite,
            protect_all_upfront: false,
            platform_flags: 0,
        }
    }
}

/// VirtualMemoryArena - the reserved address range of one heap
///
/// # Thread Safety
///
/// Accessors are plain reads. `extend_used`, `commit` and `decommit` may be
/// called concurrently; the used size only ever grows.
#[derive(Debug)]
pub struct VirtualMemoryArena {
    tag: &'static str,
    base: usize,
    mapped_size: usize,
    used_size: AtomicUsize,
    protection: Protection,
    protect_all_upfront: bool,
}

impl VirtualMemoryArena {
    /// Reserve an arena of `requested_size` bytes
    ///
    /// The size is rounded up to the page size. Only `initial_used_size`
    /// bytes (or everything, with `protect_all_upfront`) become accessible.
    ///
    /// # Errors
    /// - `InvalidArgument` if `requested_size` is zero
    /// - `ArenaMapping` if the OS refuses the reservation or protection;
    ///   any partial mapping is released first
    ///
    /// # Examples
    /// ```
    /// use regionheap::heap::{MapOptions, VirtualMemoryArena};
    ///
    /// let arena = VirtualMemoryArena::map(1 << 20, 4096, MapOptions::default())?;
    /// assert!(arena.mapped_size() >= 1 << 20);
    /// assert!(arena.used_size() <= arena.mapped_size());
    /// # Ok::<(), regionheap::HeapError>(())
    /// ```
    pub fn map(
        requested_size: usize,
        initial_used_size: usize,
        options: MapOptions,
    ) -> Result<Self> {
        if requested_size == 0 {
            return Err(HeapError::InvalidArgument(
                "arena size must be greater than 0".to_string(),
            ));
        }

        let size = page::align_to_page(requested_size);
        let base = sys::reserve(size, options.base_hint, options.platform_flags)?;

        Self::finish(base, size, initial_used_size, options)
    }

    /// Reserve an arena that lies entirely inside one 4 GiB-aligned window
    ///
    /// Over-reserves (twice the size on 64-bit targets), picks a start
    /// that does not cross a 4 GiB boundary and gives the unused head and
    /// tail back to the OS.
    ///
    /// # Errors
    /// - `InvalidArgument` if `requested_size` is zero or above 4 GiB
    /// - `ArenaMapping` on OS failure
    pub fn map_within_4g_alignment(
        requested_size: usize,
        initial_used_size: usize,
        options: MapOptions,
    ) -> Result<Self> {
        if requested_size == 0 || requested_size > FOUR_GB {
            return Err(HeapError::InvalidArgument(format!(
                "4GB-aligned arena size must be in (0, 4GB], got {}",
                requested_size
            )));
        }

        let size = page::align_to_page(requested_size);
        let reserve_size = if cfg!(target_pointer_width = "64") {
            size * 2
        } else {
            size
        };

        let raw = sys::reserve(reserve_size, options.base_hint, options.platform_flags)?;
        let start = if crosses_4g_boundary(raw, size) {
            match Alignment::align_up(raw, FOUR_GB) {
                Some(aligned) if aligned + size <= raw + reserve_size => aligned,
                _ => {
                    sys::release(raw, reserve_size);
                    return Err(HeapError::ArenaMapping(format!(
                        "no 4GB-aligned window of {} bytes inside reservation at {:#x}",
                        size, raw
                    )));
                },
            }
        } else {
            raw
        };

        let base = sys::trim_reservation(raw, reserve_size, start, size)?;
        Self::finish(base, size, initial_used_size, options)
    }

    fn finish(
        base: usize,
        size: usize,
        initial_used_size: usize,
        options: MapOptions,
    ) -> Result<Self> {
        let used = page::align_to_page(initial_used_size.min(size));
        let accessible = if options.protect_all_upfront { size } else { used };

        if accessible > 0 {
            if let Err(e) = sys::protect(base, accessible, options.protection) {
                sys::release(base, size);
                return Err(e);
            }
        }

        log::info!(
            "[{}] mapped arena {:#x}..{:#x} ({} bytes, {} used)",
            options.tag,
            base,
            base + size,
            size,
            used
        );

        Ok(Self {
            tag: options.tag,
            base,
            mapped_size: size,
            used_size: AtomicUsize::new(used),
            protection: options.protection,
            protect_all_upfront: options.protect_all_upfront,
        })
    }

    /// Unmap the whole arena
    ///
    /// Calling this again, or on an arena that was already destroyed,
    /// does nothing.
    pub fn destroy(&mut self) {
        if self.mapped_size == 0 {
            return;
        }

        sys::release(self.base, self.mapped_size);
        log::debug!("[{}] unmapped arena at {:#x}", self.tag, self.base);
        self.base = 0;
        self.mapped_size = 0;
        self.used_size.store(0, Ordering::Release);
    }

    /// Make the arena accessible up to `end` (an absolute address)
    ///
    /// Used as the heap's inactive zone advances. A no-op for ranges that
    /// are already accessible.
    pub fn extend_used(&self, end: usize) -> Result<()> {
        let mapped_end = self.mapped_end();
        if end > mapped_end {
            return Err(HeapError::InvalidArgument(format!(
                "extend_used past mapped end: {:#x} > {:#x}",
                end, mapped_end
            )));
        }

        let target = page::align_to_page(end - self.base);
        let current = self.used_size.load(Ordering::Acquire);
        if target <= current {
            return Ok(());
        }

        if !self.protect_all_upfront {
            sys::protect(self.base + current, target - current, self.protection)?;
        }
        self.used_size.fetch_max(target, Ordering::AcqRel);
        Ok(())
    }

    /// Change protection of a page range inside the arena
    pub fn protect(&self, addr: usize, len: usize, protection: Protection) -> Result<()> {
        let (start, len) = self.page_range(addr, len)?;
        sys::protect(start, len, protection)
    }

    /// Give the physical pages of a range back to the OS
    ///
    /// The range stays reserved. Contents are unspecified afterwards.
    pub fn decommit(&self, addr: usize, len: usize) -> Result<()> {
        let (start, len) = self.page_range(addr, len)?;
        sys::decommit(start, len)
    }

    /// Re-establish physical backing for a decommitted range
    ///
    /// Only does work on platforms where decommitted pages fault on access.
    pub fn commit(&self, addr: usize, len: usize) -> Result<()> {
        let (start, len) = self.page_range(addr, len)?;
        sys::commit(start, len, self.protection)
    }

    fn page_range(&self, addr: usize, len: usize) -> Result<(usize, usize)> {
        let start = page::align_down_to_page(addr);
        let end = page::align_to_page(addr.saturating_add(len));
        if start < self.base || end > self.mapped_end() {
            return Err(HeapError::InvalidArgument(format!(
                "range {:#x}+{} outside arena {:#x}..{:#x}",
                addr,
                len,
                self.base,
                self.mapped_end()
            )));
        }
        Ok((start, end - start))
    }

    /// Get base address
    pub fn base(&self) -> usize {
        self.base
    }

    /// First address past the reservation
    pub fn mapped_end(&self) -> usize {
        self.base + self.mapped_size
    }

    /// First address past the accessible part
    pub fn used_end(&self) -> usize {
        self.base + self.used_size()
    }

    pub fn used_size(&self) -> usize {
        self.used_size.load(Ordering::Acquire)
    }

    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Check if an address lies inside the reservation
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.mapped_end()
    }
}

impl Drop for VirtualMemoryArena {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn crosses_4g_boundary(start: usize, size: usize) -> bool {
    let first = start as u64;
    let last = first + size as u64 - 1;
    (first >> 32) != (last >> 32)
}

#[cfg(unix)]
mod sys {
    use super::Protection;
    use crate::error::{HeapError, Result};
    use std::io;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const MAP_NORESERVE: libc::c_int = 0;

    fn prot_flags(protection: Protection) -> libc::c_int {
        match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }

    pub fn reserve(size: usize, hint: Option<usize>, flags: i32) -> Result<usize> {
        let addr = hint.unwrap_or(0) as *mut libc::c_void;
        // SAFETY: anonymous PROT_NONE mapping; the kernel picks a free range
        // when the hint is unusable.
        let ptr = unsafe {
            libc::mmap(
                addr,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NORESERVE | flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(HeapError::ArenaMapping(format!(
                "mmap of {} bytes failed: {}",
                size,
                io::Error::last_os_error()
            )));
        }
        Ok(ptr as usize)
    }

    pub fn protect(addr: usize, len: usize, protection: Protection) -> Result<()> {
        // SAFETY: callers pass page-aligned ranges inside a live reservation.
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot_flags(protection)) };
        if rc != 0 {
            return Err(HeapError::ArenaMapping(format!(
                "mprotect({:#x}, {}) failed: {}",
                addr,
                len,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn decommit(addr: usize, len: usize) -> Result<()> {
        // SAFETY: range is inside a live reservation; DONTNEED keeps the mapping.
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(HeapError::ArenaMapping(format!(
                "madvise({:#x}, {}) failed: {}",
                addr,
                len,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn commit(_addr: usize, _len: usize, _protection: Protection) -> Result<()> {
        // Pages released with MADV_DONTNEED are refaulted on first touch.
        Ok(())
    }

    pub fn release(addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: the range was returned by `reserve` and is not used afterwards.
        let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if rc != 0 {
            log::warn!(
                "munmap({:#x}, {}) failed: {}",
                addr,
                len,
                io::Error::last_os_error()
            );
        }
    }

    pub fn trim_reservation(
        raw: usize,
        raw_size: usize,
        start: usize,
        size: usize,
    ) -> Result<usize> {
        release(raw, start - raw);
        release(start + size, raw + raw_size - (start + size));
        Ok(start)
    }
}

#[cfg(windows)]
mod sys {
    use super::Protection;
    use crate::error::{HeapError, Result};
    use core::ffi::c_void;
    use std::io;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_EXECUTE_READWRITE, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY,
        PAGE_READWRITE,
    };

    fn page_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
        match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::Read => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::ReadWriteExec => PAGE_EXECUTE_READWRITE,
        }
    }

    pub fn reserve(size: usize, hint: Option<usize>, _flags: i32) -> Result<usize> {
        let hinted = hint.unwrap_or(0) as *const c_void;
        // SAFETY: reserving fresh address space has no preconditions.
        let mut ptr = unsafe { VirtualAlloc(hinted, size, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() && hint.is_some() {
            // SAFETY: as above, without the advisory address.
            ptr = unsafe { VirtualAlloc(core::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };
        }
        if ptr.is_null() {
            return Err(HeapError::ArenaMapping(format!(
                "VirtualAlloc reserve of {} bytes failed: {}",
                size,
                io::Error::last_os_error()
            )));
        }
        Ok(ptr as usize)
    }

    pub fn protect(addr: usize, len: usize, protection: Protection) -> Result<()> {
        if protection == Protection::NoAccess {
            return decommit(addr, len);
        }
        commit(addr, len, protection)
    }

    pub fn decommit(addr: usize, len: usize) -> Result<()> {
        // SAFETY: range is inside a live reservation.
        let ok = unsafe { VirtualFree(addr as *mut c_void, len, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(HeapError::ArenaMapping(format!(
                "VirtualFree decommit({:#x}, {}) failed: {}",
                addr,
                len,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn commit(addr: usize, len: usize, protection: Protection) -> Result<()> {
        // SAFETY: range is inside a live reservation.
        let ptr = unsafe {
            VirtualAlloc(addr as *const c_void, len, MEM_COMMIT, page_flags(protection))
        };
        if ptr.is_null() {
            return Err(HeapError::ArenaMapping(format!(
                "VirtualAlloc commit({:#x}, {}) failed: {}",
                addr,
                len,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn release(addr: usize, _len: usize) {
        // SAFETY: `addr` is the base of a reservation that is no longer used.
        let ok = unsafe { VirtualFree(addr as *mut c_void, 0, MEM_RELEASE) };
        if ok == 0 {
            log::warn!(
                "VirtualFree release({:#x}) failed: {}",
                addr,
                io::Error::last_os_error()
            );
        }
    }

    pub fn trim_reservation(
        raw: usize,
        _raw_size: usize,
        start: usize,
        size: usize,
    ) -> Result<usize> {
        // Reservations cannot be split; give the probe back and re-reserve
        // exactly the chosen window.
        release(raw, 0);
        // SAFETY: reserving address space that was free a moment ago.
        let ptr = unsafe { VirtualAlloc(start as *const c_void, size, MEM_RESERVE, PAGE_NOACCESS) };
        if ptr.is_null() || ptr as usize != start {
            return Err(HeapError::ArenaMapping(format!(
                "could not re-reserve 4GB-aligned window at {:#x}: {}",
                start,
                io::Error::last_os_error()
            )));
        }
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MB;

    #[test]
    fn test_map_rounds_to_page() {
        let ps = page::get_page_size();
        let arena = VirtualMemoryArena::map(ps * 3 + 1, 0, MapOptions::default()).unwrap();

        assert_eq!(arena.mapped_size(), ps * 4);
        assert_eq!(arena.used_size(), 0);
        assert!(page::is_page_aligned(arena.base()));
        assert_eq!(arena.mapped_end(), arena.base() + ps * 4);
    }

    #[test]
    fn test_initial_used_is_writable() {
        let ps = page::get_page_size();
        let arena = VirtualMemoryArena::map(MB, ps, MapOptions::default()).unwrap();

        assert_eq!(arena.used_size(), ps);
        assert_eq!(arena.used_end(), arena.base() + ps);
        // SAFETY: first page was protected read/write at map time.
        unsafe {
            std::ptr::write_bytes(arena.base() as *mut u8, 0xAB, ps);
            assert_eq!(*(arena.base() as *const u8), 0xAB);
        }
    }

    #[test]
    fn test_initial_used_clamped_to_mapped() {
        let arena = VirtualMemoryArena::map(MB, 4 * MB, MapOptions::default()).unwrap();
        assert_eq!(arena.used_size(), arena.mapped_size());
    }

    #[test]
    fn test_zero_size_rejected() {
        let result = VirtualMemoryArena::map(0, 0, MapOptions::default());
        assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
    }

    #[test]
    fn test_extend_used_grows_monotonically() {
        let arena = VirtualMemoryArena::map(4 * MB, 0, MapOptions::default()).unwrap();

        arena.extend_used(arena.base() + MB).unwrap();
        assert_eq!(arena.used_size(), MB);

        arena.extend_used(arena.base() + MB / 2).unwrap();
        assert_eq!(arena.used_size(), MB);

        // SAFETY: the first MB is now read/write.
        unsafe { std::ptr::write_bytes((arena.base() + MB - 8) as *mut u8, 1, 8) };

        assert!(arena.extend_used(arena.mapped_end() + 1).is_err());
    }

    #[test]
    fn test_protect_all_upfront() {
        let options = MapOptions {
            protect_all_upfront: true,
            ..MapOptions::default()
        };
        let arena = VirtualMemoryArena::map(2 * MB, 0, options).unwrap();

        // SAFETY: whole arena is accessible.
        unsafe { std::ptr::write_bytes((arena.mapped_end() - 8) as *mut u8, 7, 8) };
        assert_eq!(arena.used_size(), 0);
    }

    #[test]
    fn test_decommit_and_commit_range() {
        let arena = VirtualMemoryArena::map(2 * MB, 2 * MB, MapOptions::default()).unwrap();

        arena.decommit(arena.base(), MB).unwrap();
        arena.commit(arena.base(), MB).unwrap();
        // SAFETY: range is still read/write after a decommit/commit pair.
        unsafe { std::ptr::write_bytes(arena.base() as *mut u8, 3, 16) };

        assert!(arena.decommit(arena.mapped_end(), MB).is_err());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut arena = VirtualMemoryArena::map(MB, 0, MapOptions::default()).unwrap();
        arena.destroy();
        assert_eq!(arena.mapped_size(), 0);
        assert_eq!(arena.base(), 0);
        arena.destroy();
        assert_eq!(arena.mapped_size(), 0);
    }

    #[test]
    fn test_contains() {
        let arena = VirtualMemoryArena::map(MB, 0, MapOptions::default()).unwrap();
        assert!(arena.contains(arena.base()));
        assert!(arena.contains(arena.mapped_end() - 1));
        assert!(!arena.contains(arena.mapped_end()));
        assert!(!arena.contains(0));
    }

    #[test]
    fn test_map_within_4g_alignment() {
        let size = 64 * MB;
        let arena =
            VirtualMemoryArena::map_within_4g_alignment(size, 0, MapOptions::default()).unwrap();

        assert_eq!(arena.mapped_size(), size);
        assert!(!crosses_4g_boundary(arena.base(), arena.mapped_size()));
    }

    #[test]
    fn test_map_within_4g_rejects_oversize() {
        let result =
            VirtualMemoryArena::map_within_4g_alignment(FOUR_GB + 1, 0, MapOptions::default());
        assert!(matches!(result, Err(HeapError::InvalidArgument(_))));
    }

    #[test]
    fn test_crosses_4g_boundary() {
        assert!(!crosses_4g_boundary(0x1_0000_0000, 4096));
        assert!(crosses_4g_boundary(0x1_FFFF_F000, 8192));
        assert!(!crosses_4g_boundary(0x1_FFFF_E000, 8192));
    }
}
