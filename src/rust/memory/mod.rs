// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Preallocated, page-aligned pools of fixed-size buffers, subdivided into
//! independently registrable units that carry the NIC local keys used for
//! DMA.

pub mod mbuf;
pub mod mem;
pub mod registered;
pub mod sizes;

//==============================================================================
// Imports
//==============================================================================

use self::{
    mbuf::LKEY_INVALID,
    mem::MmapRegion,
    sizes::MempoolAllocationParams,
};
use crate::{
    device::RegisteredRegion,
    fail::Fail,
};
use ::std::{
    ptr,
    ptr::NonNull,
    sync::atomic::{
        fence,
        AtomicU16,
        Ordering,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// Registration state of one registration unit.
#[derive(Debug)]
pub struct RegistrationInfo {
    /// Local key, [LKEY_INVALID] while the unit is unregistered.
    lkey: i32,
    /// Device registration handle.
    region: Option<RegisteredRegion>,
    /// First byte of the unit.
    starting_address: *mut u8,
}

/// Fixed-slot memory pool over a contiguous page-aligned backing region.
///
/// `free_items[i]` holds the address of slot `i` while the slot is free and
/// null while it is out; `allocated` therefore always equals the number of
/// null entries. Recycled slots become visible at their own index, and
/// `alloc` takes the last non-null entry so recently returned slots are
/// handed out again promptly.
#[derive(Debug)]
pub struct Mempool {
    region: MmapRegion,
    free_items: Vec<*mut u8>,
    ref_counts: Vec<AtomicU16>,
    allocated: usize,
    capacity: usize,
    item_len: usize,
    log_item_len: u32,
    registration_len: usize,
    registrations: Vec<RegistrationInfo>,
    use_atomic_ops: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mempool {
    /// Creates a pool from validated geometry. Slots are pushed onto the free
    /// table in ascending address order.
    pub fn create(params: &MempoolAllocationParams, use_atomic_ops: bool) -> Result<Self, Fail> {
        let len: usize = params.get_region_len();
        let item_len: usize = params.get_item_len();
        let registration_len: usize = params.get_registration_unit();
        let region: MmapRegion = MmapRegion::new(len, params.get_data_pgsize())?;
        let buf: *mut u8 = region.as_mut_ptr();
        let capacity: usize = len / item_len;
        let mut free_items: Vec<*mut u8> = Vec::with_capacity(capacity);
        for i in 0..capacity {
            free_items.push(unsafe { buf.add(i * item_len) });
        }
        let mut ref_counts: Vec<AtomicU16> = Vec::with_capacity(capacity);
        ref_counts.resize_with(capacity, || AtomicU16::new(0));
        let nr_registrations: usize = len / registration_len;
        let mut registrations: Vec<RegistrationInfo> = Vec::with_capacity(nr_registrations);
        for u in 0..nr_registrations {
            registrations.push(RegistrationInfo {
                lkey: LKEY_INVALID,
                region: None,
                starting_address: unsafe { buf.add(u * registration_len) },
            });
        }
        Ok(Self {
            region,
            free_items,
            ref_counts,
            allocated: 0,
            capacity,
            item_len,
            log_item_len: item_len.trailing_zeros(),
            registration_len,
            registrations,
            use_atomic_ops,
        })
    }

    #[inline]
    pub fn buf(&self) -> *mut u8 {
        self.region.as_mut_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn pgsize(&self) -> usize {
        self.region.pgsize()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[inline]
    pub fn item_len(&self) -> usize {
        self.item_len
    }

    #[inline]
    pub fn registration_len(&self) -> usize {
        self.registration_len
    }

    #[inline]
    pub fn nr_registrations(&self) -> usize {
        self.registrations.len()
    }

    /// Address of slot `idx`, free or not.
    #[inline]
    pub fn item_at(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.capacity);
        unsafe { self.buf().add(idx << self.log_item_len) }
    }

    #[inline]
    pub fn contains(&self, item: *const u8) -> bool {
        let base: usize = self.buf() as usize;
        let addr: usize = item as usize;
        addr >= base && addr < base + self.len()
    }

    /// Takes the last free slot, or nothing when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if self.allocated >= self.capacity {
            return None;
        }
        let mut idx: usize = self.capacity;
        while idx > 0 {
            idx -= 1;
            let item: *mut u8 = self.free_items[idx];
            if !item.is_null() {
                self.free_items[idx] = ptr::null_mut();
                self.allocated += 1;
                return NonNull::new(item);
            }
        }
        None
    }

    /// Takes slot `idx` if it is free.
    pub fn alloc_by_idx(&mut self, idx: usize) -> Option<NonNull<u8>> {
        if self.allocated >= self.capacity || idx >= self.capacity {
            return None;
        }
        let item: *mut u8 = self.free_items[idx];
        if item.is_null() {
            return None;
        }
        self.free_items[idx] = ptr::null_mut();
        self.allocated += 1;
        NonNull::new(item)
    }

    /// Returns an item to the pool at its own slot index. Foreign pointers
    /// and double frees are reported and ignored.
    pub fn free(&mut self, item: *mut u8) {
        if !self.contains(item) {
            debug_assert!(false, "freed item outside pool bounds");
            warn!("freeing item {:?} that does not belong to pool {:?}", item, self.buf());
            return;
        }
        let idx: usize = ((item as usize) - (self.buf() as usize)) >> self.log_item_len;
        if self.allocated == 0 {
            warn!("freeing item {:?} into pool {:?} with nothing allocated", item, self.buf());
            return;
        }
        if !self.free_items[idx].is_null() {
            debug_assert!(false, "double free of slot {}", idx);
            warn!("double free of slot {} in pool {:?}", idx, self.buf());
            return;
        }
        self.free_items[idx] = item;
        self.allocated -= 1;
    }

    /// Slot index of `item`, or nothing when `item` is out of bounds or not
    /// aligned to an item boundary.
    pub fn find_index(&self, item: *const u8) -> Option<usize> {
        if !self.contains(item) {
            return None;
        }
        let off: usize = (item as usize) - (self.buf() as usize);
        if off & (self.item_len - 1) != 0 {
            return None;
        }
        Some(off >> self.log_item_len)
    }

    /// Whether slot `idx` is currently out of the pool.
    #[inline]
    pub fn slot_is_allocated(&self, idx: usize) -> bool {
        self.free_items[idx].is_null()
    }

    /// Registration unit holding `page_address`.
    pub fn find_registration_unit(&self, page_address: *const u8) -> Option<usize> {
        if !self.contains(page_address) {
            return None;
        }
        Some(((page_address as usize) - (self.buf() as usize)) / self.registration_len)
    }

    pub fn is_registered(&self, registration_unit: usize) -> bool {
        self.registrations[registration_unit].lkey != LKEY_INVALID
    }

    /// Local key of a registration unit, [LKEY_INVALID] while unregistered.
    #[inline]
    pub fn get_lkey(&self, registration_unit: usize) -> i32 {
        self.registrations[registration_unit].lkey
    }

    /// Local key covering slot `idx`.
    #[inline]
    pub fn lkey_for_item(&self, idx: usize) -> i32 {
        let unit: usize = (idx << self.log_item_len) / self.registration_len;
        self.registrations[unit].lkey
    }

    pub fn registration_unit_bounds(&self, registration_unit: usize) -> (*mut u8, usize) {
        (
            self.registrations[registration_unit].starting_address,
            self.registration_len,
        )
    }

    /// Installs a device registration on a unit.
    pub fn set_registration(&mut self, registration_unit: usize, region: RegisteredRegion) {
        let entry: &mut RegistrationInfo = &mut self.registrations[registration_unit];
        entry.lkey = region.lkey();
        entry.region = Some(region);
    }

    /// Removes a unit's registration, restoring the sentinel key, and hands
    /// the device handle back for deregistration.
    pub fn take_registration(&mut self, registration_unit: usize) -> Option<RegisteredRegion> {
        let entry: &mut RegistrationInfo = &mut self.registrations[registration_unit];
        entry.lkey = LKEY_INVALID;
        entry.region.take()
    }

    #[inline]
    pub fn refcnt_read(&self, idx: usize) -> u16 {
        if self.use_atomic_ops {
            self.ref_counts[idx].load(Ordering::Acquire)
        } else {
            self.ref_counts[idx].load(Ordering::Relaxed)
        }
    }

    #[inline]
    pub fn refcnt_set(&self, idx: usize, value: u16) {
        if self.use_atomic_ops {
            self.ref_counts[idx].store(value, Ordering::Release);
        } else {
            self.ref_counts[idx].store(value, Ordering::Relaxed);
        }
    }

    /// Applies `change` to slot `idx`'s reference count and returns the new
    /// value; on the transition to zero the slot goes back to the pool. The
    /// release of the last reference synchronizes with the next allocation
    /// of the slot when the pool is shared across threads.
    pub fn refcnt_update_or_free(&mut self, idx: usize, change: i16) -> u16 {
        debug_assert!(idx < self.capacity);
        let mut released: bool = false;
        let new: u16 = if self.use_atomic_ops {
            let prev: u16 = self.ref_counts[idx]
                .fetch_update(Ordering::Release, Ordering::Acquire, |v| {
                    Some(if change >= 0 {
                        v.saturating_add(change as u16)
                    } else {
                        v.saturating_sub(change.unsigned_abs())
                    })
                })
                .unwrap();
            if change < 0 && change.unsigned_abs() > prev {
                warn!("refcnt underflow on slot {} of pool {:?}", idx, self.buf());
            }
            let new: u16 = if change >= 0 {
                prev.saturating_add(change as u16)
            } else {
                prev.saturating_sub(change.unsigned_abs())
            };
            released = change < 0 && prev > 0 && new == 0;
            if released {
                fence(Ordering::Acquire);
            }
            new
        } else {
            let prev: u16 = self.ref_counts[idx].load(Ordering::Relaxed);
            let new: u16 = if change >= 0 {
                prev.saturating_add(change as u16)
            } else if change.unsigned_abs() > prev {
                warn!("refcnt underflow on slot {} of pool {:?}", idx, self.buf());
                0
            } else {
                prev - change.unsigned_abs()
            };
            self.ref_counts[idx].store(new, Ordering::Relaxed);
            released = change < 0 && prev > 0 && new == 0;
            new
        };
        if released {
            let item: *mut u8 = self.item_at(idx);
            self.free(item);
        }
        new
    }

    /// Releases the pool. The caller must have drained all outstanding
    /// buffers first.
    pub fn destroy(self) -> Result<(), Fail> {
        if self.allocated != 0 {
            debug_assert!(false, "destroying pool with {} items outstanding", self.allocated);
            warn!(
                "destroying pool at {:?} with {} items outstanding, leaking its slots",
                self.buf(),
                self.allocated
            );
            // keep the backing region alive rather than pull pages out from
            // under in-flight DMA
            std::mem::forget(self);
            return Err(Fail::new(libc::EBUSY, "pool has outstanding allocations"));
        }
        Ok(())
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for Mempool {
    fn drop(&mut self) {
        if self.allocated != 0 {
            warn!(
                "dropping pool at {:?} with {} items still allocated",
                self.buf(),
                self.allocated
            );
        }
    }
}
