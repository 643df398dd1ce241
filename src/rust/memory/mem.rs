// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Page-granular backing memory for the datapath pools.

use crate::fail::Fail;
use ::std::ptr;

const PGSHIFT_4KB: usize = 12;
const PGSHIFT_2MB: usize = 21;
const PGSHIFT_1GB: usize = 30;
pub const PGSIZE_4KB: usize = 1 << PGSHIFT_4KB;
pub const PGSIZE_2MB: usize = 1 << PGSHIFT_2MB;
pub const PGSIZE_1GB: usize = 1 << PGSHIFT_1GB;
const PGMASK_4KB: usize = PGSIZE_4KB - 1;
const PGMASK_2MB: usize = PGSIZE_2MB - 1;
const PGMASK_1GB: usize = PGSIZE_1GB - 1;

#[inline]
pub fn pgoff4kb(addr: *const u8) -> usize {
    (addr as usize) & PGMASK_4KB
}

#[inline]
pub fn pgoff2mb(addr: *const u8) -> usize {
    (addr as usize) & PGMASK_2MB
}

pub fn pgoff1gb(addr: *const u8) -> usize {
    (addr as usize) & PGMASK_1GB
}

#[inline]
pub fn closest_1g_page(addr: *const u8) -> usize {
    let off = pgoff1gb(addr);
    addr as usize - off
}

#[inline]
pub fn closest_4k_page(addr: *const u8) -> usize {
    let off = pgoff4kb(addr);
    addr as usize - off
}

#[inline]
pub fn closest_2mb_page(addr: *const u8) -> usize {
    let off = pgoff2mb(addr);
    addr as usize - off
}

//==============================================================================
// Structures
//==============================================================================

/// Anonymous mapping that backs a memory pool. The mapping over-allocates by
/// one page so that `buf` can be aligned up to `pgsize`; `allocated_buf` and
/// `allocated_len` remember the raw mapping for unmap time.
#[derive(Debug)]
pub struct MmapRegion {
    allocated_buf: *mut u8,
    allocated_len: usize,
    buf: *mut u8,
    len: usize,
    pgsize: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MmapRegion {
    /// Maps `len` bytes aligned to `pgsize`. Page sizes of 2MB and above are
    /// requested from the huge-page allocator first, falling back to regular
    /// pages when no huge pages are configured on the host.
    pub fn new(len: usize, pgsize: usize) -> Result<Self, Fail> {
        if len == 0 || !pgsize.is_power_of_two() || len % pgsize != 0 {
            return Err(Fail::new(libc::EINVAL, "region length must be a multiple of the page size"));
        }
        let allocated_len: usize = len + pgsize;
        let base_flags: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let mut allocated_buf: *mut libc::c_void = ptr::null_mut();
        if pgsize >= PGSIZE_2MB {
            let log_pgsize: libc::c_int = pgsize.trailing_zeros() as libc::c_int;
            allocated_buf = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    allocated_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    base_flags | libc::MAP_HUGETLB | (log_pgsize << libc::MAP_HUGE_SHIFT),
                    -1,
                    0,
                )
            };
            if allocated_buf == libc::MAP_FAILED {
                warn!("no huge pages of size {} available, falling back to 4KB pages", pgsize);
                allocated_buf = ptr::null_mut();
            }
        }
        if allocated_buf.is_null() {
            allocated_buf = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    allocated_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    base_flags,
                    -1,
                    0,
                )
            };
            if allocated_buf == libc::MAP_FAILED {
                return Err(Fail::new(libc::ENOMEM, "mmap for pool backing region failed"));
            }
        }
        let raw: usize = allocated_buf as usize;
        let aligned: usize = (raw + pgsize - 1) & !(pgsize - 1);
        Ok(Self {
            allocated_buf: allocated_buf as *mut u8,
            allocated_len,
            buf: aligned as *mut u8,
            len,
            pgsize,
        })
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn pgsize(&self) -> usize {
        self.pgsize
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.len / self.pgsize
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.allocated_buf as *mut libc::c_void, self.allocated_len) } != 0 {
            warn!("munmap failed for region at {:?}", self.allocated_buf);
        }
    }
}
