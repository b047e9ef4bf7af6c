//! Thin abstraction over the OS virtual-memory facility.
//!
//! Access rights are always read-write. Memory is reserved, or reserved and
//! committed, in one call; committed/decommitted later page-wise. The
//! allocator reserves its whole address range up front and commits chunks
//! as they first enter circulation.

#![allow(unsafe_code)]

use crate::util::align_up;

/// Reserve address space without backing it.
pub const RESERVE: u32 = 1;
/// Back the range with pages.
pub const COMMIT: u32 = 2;
/// Reserve and back in one call.
pub const RESERVE_COMMIT: u32 = RESERVE | COMMIT;
/// Request huge pages (advisory).
pub const HUGEPAGES: u32 = 4;

/// Smallest commit/decommit granularity.
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Huge page size; 2 MiB on the platforms this allocator targets.
pub fn huge_page_size() -> usize {
    1 << 21
}

/// Granularity of address-range reservations (page size on unix).
pub fn alloc_granularity() -> usize {
    page_size()
}

/// Reserves (and optionally commits) `size` bytes of address space.
/// Returns null on failure.
pub fn alloc(size: usize, flags: u32) -> *mut u8 {
    let prot = if flags & RESERVE_COMMIT == RESERVE {
        libc::PROT_NONE
    } else if flags & RESERVE_COMMIT == RESERVE_COMMIT {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        return std::ptr::null_mut();
    };
    let mut map_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    if flags & HUGEPAGES != 0 {
        map_flags |= libc::MAP_HUGETLB;
    }
    // SAFETY: anonymous mapping with no fixed address; the kernel picks the
    // placement, so no existing mapping can be clobbered.
    let mem = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, map_flags, -1, 0) };
    if mem == libc::MAP_FAILED {
        return std::ptr::null_mut();
    }
    mem as *mut u8
}

/// Reserves `size` bytes aligned to `desired_alignment` (≥ page size).
///
/// Over-reserves by the alignment and trims the head and tail back to the
/// OS, so only the aligned window stays mapped.
pub fn alloc_aligned(size: usize, flags: u32, desired_alignment: usize) -> *mut u8 {
    let page = page_size();
    let alignment = desired_alignment.max(page);
    let aligned_size = align_up(size as u64, alignment as u64) as usize;

    if alignment == page {
        return alloc(aligned_size, flags);
    }

    let raw = alloc(aligned_size + alignment, RESERVE);
    if raw.is_null() {
        return raw;
    }
    let aligned = align_up(raw as u64, alignment as u64) as *mut u8;
    let head = aligned as usize - raw as usize;
    let tail = alignment - head;
    if head > 0 {
        free(raw, head);
    }
    if tail > 0 {
        // SAFETY: the tail window lies inside the original mapping.
        free(unsafe { aligned.add(aligned_size) }, tail);
    }
    if flags & COMMIT != 0 && !commit(aligned, aligned_size) {
        free(aligned, aligned_size);
        return std::ptr::null_mut();
    }
    aligned
}

/// Releases a reserved range.
pub fn free(mem: *mut u8, size: usize) -> bool {
    // SAFETY: caller passes a range previously obtained from `alloc`.
    unsafe { libc::munmap(mem as *mut libc::c_void, size) == 0 }
}

/// Backs a reserved range with read-write pages.
pub fn commit(mem: *mut u8, size: usize) -> bool {
    // SAFETY: caller passes a sub-range of a reserved mapping.
    unsafe {
        libc::mprotect(
            mem as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        ) == 0
    }
}

/// Returns a committed range to reserved-only state.
pub fn decommit(mem: *mut u8, size: usize) -> bool {
    // SAFETY: caller passes a sub-range of a committed mapping.
    unsafe { libc::mprotect(mem as *mut libc::c_void, size, libc::PROT_NONE) == 0 }
}

/// Last OS error code.
pub fn last_error() -> u64 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u64
}
