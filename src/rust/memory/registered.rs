// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Memory pools wired to the NIC: a data pool whose registration units carry
//! local keys, paired with a metadata pool holding one mbuf per data slot.

//==============================================================================
// Imports
//==============================================================================

use super::{
    mbuf::{
        Mbuf,
        PoolId,
        EXTERNAL_POOL_ID,
        FIRST_TX_POOL_ID,
        LKEY_INVALID,
        RX_POOL_ID,
    },
    mem::PGSIZE_4KB,
    sizes::MempoolAllocationParams,
    Mempool,
};
use crate::{
    device::Mlx5DirectDevice,
    fail::Fail,
};
use ::arrayvec::ArrayVec;
use ::std::ptr::NonNull;

//==============================================================================
// Constants
//==============================================================================

/// Stride of one metadata slot; an [Mbuf] must fit.
pub const MBUF_SLOT_LEN: usize = 64;
const _: () = assert!(std::mem::size_of::<Mbuf>() <= MBUF_SLOT_LEN);

/// Upper bound on extra transmit pools per thread.
pub const MAX_TX_MEMPOOLS_PER_THREAD: usize = 64;

/// Caller-owned buffers attached per thread at any one time.
const EXTERNAL_METADATA_POOL_NUM_ITEMS: usize = 2048;

//==============================================================================
// Structures
//==============================================================================

/// A data pool and its mbuf pool. The two share capacity: the mbuf at
/// metadata slot `i` always describes data slot `i`.
#[derive(Debug)]
pub struct RegisteredMempool {
    data: Mempool,
    metadata: Mempool,
}

/// Per-thread table resolving [PoolId]s: the receive pool at slot 0, the
/// external-attach metadata pool at slot 1, and a bounded list of transmit
/// pools behind them.
#[derive(Debug)]
pub struct MempoolTable {
    rx: RegisteredMempool,
    external: Mempool,
    tx: ArrayVec<RegisteredMempool, MAX_TX_MEMPOOLS_PER_THREAD>,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl RegisteredMempool {
    /// Creates the data pool and its metadata twin. With `register_at_alloc`
    /// every registration unit is registered immediately; otherwise units
    /// are registered lazily through [Self::register_mempool_unit].
    pub fn create(
        device: &mut dyn Mlx5DirectDevice,
        params: &MempoolAllocationParams,
        access: u32,
        use_atomic_ops: bool,
        register_at_alloc: bool,
    ) -> Result<Self, Fail> {
        // metadata slots pack MBUF_SLOT_LEN to a page
        if params.get_num_items() % (PGSIZE_4KB / MBUF_SLOT_LEN) != 0 {
            return Err(Fail::new(
                libc::EINVAL,
                "item count must fill whole metadata pages; round it up first",
            ));
        }
        let data: Mempool = Mempool::create(params, use_atomic_ops)?;
        let metadata_params: MempoolAllocationParams = MempoolAllocationParams::new(
            params.get_num_items(),
            PGSIZE_4KB,
            MBUF_SLOT_LEN,
            params.get_num_items() * MBUF_SLOT_LEN,
        )?;
        let metadata: Mempool = Mempool::create(&metadata_params, false)?;
        let mut pool: RegisteredMempool = Self { data, metadata };
        if register_at_alloc {
            for unit in 0..pool.data.nr_registrations() {
                pool.register_mempool_unit(device, unit, access)?;
            }
        }
        Ok(pool)
    }

    #[inline]
    pub fn data(&self) -> &Mempool {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut Mempool {
        &mut self.data
    }

    #[inline]
    pub fn metadata(&self) -> &Mempool {
        &self.metadata
    }

    /// Mbuf storage of slot `idx`, allocated or not.
    #[inline]
    pub fn mbuf_at(&self, idx: usize) -> *mut Mbuf {
        self.metadata.item_at(idx) as *mut Mbuf
    }

    /// Registers one registration unit, pinning its pages. Re-registering a
    /// registered unit is a no-op.
    pub fn register_mempool_unit(
        &mut self,
        device: &mut dyn Mlx5DirectDevice,
        registration_unit: usize,
        access: u32,
    ) -> Result<(), Fail> {
        if registration_unit >= self.data.nr_registrations() {
            return Err(Fail::new(libc::EINVAL, "registration unit out of range"));
        }
        if self.data.is_registered(registration_unit) {
            return Ok(());
        }
        let (addr, len) = self.data.registration_unit_bounds(registration_unit);
        let region = device.register_memory(addr, len, access)?;
        self.data.set_registration(registration_unit, region);
        Ok(())
    }

    /// Releases one unit's registration and restores the sentinel key.
    pub fn deregister_mempool_unit(
        &mut self,
        device: &mut dyn Mlx5DirectDevice,
        registration_unit: usize,
    ) -> Result<(), Fail> {
        if registration_unit >= self.data.nr_registrations() {
            return Err(Fail::new(libc::EINVAL, "registration unit out of range"));
        }
        match self.data.take_registration(registration_unit) {
            Some(region) => device.deregister_memory(region),
            None => Ok(()),
        }
    }

    /// Releases every registration this pool holds.
    pub fn deregister_all(&mut self, device: &mut dyn Mlx5DirectDevice) -> Result<(), Fail> {
        for unit in 0..self.data.nr_registrations() {
            self.deregister_mempool_unit(device, unit)?;
        }
        Ok(())
    }

    /// Allocates a data slot and its mbuf. Fails fast with nothing when the
    /// pool is empty; allocating out of an unregistered unit is a
    /// precondition error, the sentinel key never reaches a work request.
    pub fn alloc_mbuf(&mut self, pool_id: PoolId) -> Result<Option<NonNull<Mbuf>>, Fail> {
        let data_buf: NonNull<u8> = match self.data.alloc() {
            Some(buf) => buf,
            None => return Ok(None),
        };
        let idx: usize = match self.data.find_index(data_buf.as_ptr()) {
            Some(idx) => idx,
            None => {
                self.data.free(data_buf.as_ptr());
                return Err(Fail::new(libc::EINVAL, "allocated buffer not indexable"));
            },
        };
        let lkey: i32 = self.data.lkey_for_item(idx);
        if lkey == LKEY_INVALID {
            self.data.free(data_buf.as_ptr());
            return Err(Fail::new(
                libc::EINVAL,
                "buffer's registration unit is not registered with the device",
            ));
        }
        let mbuf_buf: NonNull<u8> = match self.metadata.alloc_by_idx(idx) {
            Some(buf) => buf,
            None => {
                self.data.free(data_buf.as_ptr());
                return Err(Fail::new(libc::EINVAL, "metadata slot already taken"));
            },
        };
        let mbuf: NonNull<Mbuf> = mbuf_buf.cast::<Mbuf>();
        unsafe {
            (*mbuf.as_ptr()).init(data_buf.as_ptr(), self.data.item_len(), lkey, pool_id, idx);
        }
        self.data.refcnt_set(idx, 1);
        Ok(Some(mbuf))
    }

    /// Returns an mbuf's slots to the pool pair. The metadata slot comes
    /// back immediately; the data slot comes back when its last external
    /// reference goes away.
    pub fn free_mbuf(&mut self, mbuf: *mut Mbuf) {
        let idx: usize = unsafe { (*mbuf).index() };
        self.metadata.free(mbuf as *mut u8);
        self.data.refcnt_update_or_free(idx, -1);
    }

    /// Rebuilds a reference to the live mbuf covering `addr`, bumping its
    /// reference count. `addr` may point anywhere inside the data slot.
    pub fn recover_mbuf(&mut self, addr: *const u8) -> Option<NonNull<Mbuf>> {
        if !self.data.contains(addr) {
            return None;
        }
        let off: usize = addr as usize - self.data.buf() as usize;
        let idx: usize = off / self.data.item_len();
        if !self.data.slot_is_allocated(idx) {
            return None;
        }
        let mbuf: *mut Mbuf = self.mbuf_at(idx);
        unsafe { (*mbuf).refcnt_update(1) };
        NonNull::new(mbuf)
    }

    /// Tears the pool pair down; all mbufs must already be back.
    pub fn destroy(self, device: &mut dyn Mlx5DirectDevice) -> Result<(), Fail> {
        let mut data: Mempool = self.data;
        for unit in 0..data.nr_registrations() {
            if let Some(region) = data.take_registration(unit) {
                device.deregister_memory(region)?;
            }
        }
        data.destroy()?;
        self.metadata.destroy()
    }
}

impl MempoolTable {
    pub fn new(device: &mut dyn Mlx5DirectDevice, rx_params: &MempoolAllocationParams, access: u32) -> Result<Self, Fail> {
        let rx: RegisteredMempool = RegisteredMempool::create(device, rx_params, access, false, true)?;
        let external_params: MempoolAllocationParams = MempoolAllocationParams::new(
            EXTERNAL_METADATA_POOL_NUM_ITEMS,
            PGSIZE_4KB,
            MBUF_SLOT_LEN,
            EXTERNAL_METADATA_POOL_NUM_ITEMS * MBUF_SLOT_LEN,
        )?;
        let external: Mempool = Mempool::create(&external_params, false)?;
        Ok(Self {
            rx,
            external,
            tx: ArrayVec::new(),
        })
    }

    #[inline]
    pub fn rx_pool(&self) -> &RegisteredMempool {
        &self.rx
    }

    #[inline]
    pub fn rx_pool_mut(&mut self) -> &mut RegisteredMempool {
        &mut self.rx
    }

    pub fn num_tx_pools(&self) -> usize {
        self.tx.len()
    }

    /// Adds a transmit pool, handing back its table id. The per-thread pool
    /// count is bounded.
    pub fn add_tx_pool(&mut self, pool: RegisteredMempool) -> Result<PoolId, Fail> {
        if self.tx.is_full() {
            return Err(Fail::new(libc::ENOSPC, "thread already holds the maximum number of tx pools"));
        }
        self.tx.push(pool);
        Ok(PoolId::from(FIRST_TX_POOL_ID + (self.tx.len() - 1) as u32))
    }

    /// Resolves a pool id to its registered pool; the external pool has no
    /// registered pool and resolves to nothing.
    pub fn get_mut(&mut self, pool: PoolId) -> Option<&mut RegisteredMempool> {
        let raw: u32 = pool.into();
        if pool == RX_POOL_ID {
            Some(&mut self.rx)
        } else if pool == EXTERNAL_POOL_ID {
            None
        } else {
            self.tx.get_mut((raw - FIRST_TX_POOL_ID) as usize)
        }
    }

    /// Allocates an mbuf from the first transmit pool with a free slot of at
    /// least `size` bytes.
    pub fn alloc_tx_mbuf(&mut self, size: usize) -> Result<Option<NonNull<Mbuf>>, Fail> {
        for (i, pool) in self.tx.iter_mut().enumerate() {
            if pool.data().item_len() < size {
                continue;
            }
            let id: PoolId = PoolId::from(FIRST_TX_POOL_ID + i as u32);
            if let Some(mbuf) = pool.alloc_mbuf(id)? {
                return Ok(Some(mbuf));
            }
        }
        Ok(None)
    }

    /// Allocates an mbuf from the receive pool.
    pub fn alloc_rx_mbuf(&mut self) -> Result<Option<NonNull<Mbuf>>, Fail> {
        self.rx.alloc_mbuf(RX_POOL_ID)
    }

    /// Wraps a caller-owned buffer in an mbuf from the external pool. The
    /// caller keeps ownership of the bytes; only the metadata slot is pool
    /// managed.
    pub fn attach_external_buffer(&mut self, addr: *mut u8, len: usize, lkey: i32) -> Result<Option<NonNull<Mbuf>>, Fail> {
        if lkey == LKEY_INVALID {
            return Err(Fail::new(libc::EINVAL, "external buffer must carry a valid local key"));
        }
        let slot: NonNull<u8> = match self.external.alloc() {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let idx: usize = match self.external.find_index(slot.as_ptr()) {
            Some(idx) => idx,
            None => {
                self.external.free(slot.as_ptr());
                return Err(Fail::new(libc::EINVAL, "allocated metadata slot not indexable"));
            },
        };
        let mbuf: NonNull<Mbuf> = slot.cast::<Mbuf>();
        unsafe { (*mbuf.as_ptr()).init(addr, len, lkey, EXTERNAL_POOL_ID, idx) };
        Ok(Some(mbuf))
    }

    /// Finds the pool owning `addr` and recovers the live mbuf covering it.
    pub fn recover_mbuf(&mut self, addr: *const u8) -> Option<NonNull<Mbuf>> {
        if let Some(mbuf) = self.rx.recover_mbuf(addr) {
            return Some(mbuf);
        }
        for pool in self.tx.iter_mut() {
            if let Some(mbuf) = pool.recover_mbuf(addr) {
                return Some(mbuf);
            }
        }
        None
    }

    /// Applies `change` to an mbuf's reference count, returning its slots to
    /// their pools on the transition to zero.
    pub fn mbuf_refcnt_update_or_free(&mut self, mbuf: *mut Mbuf, change: i16) -> u16 {
        let new: u16 = unsafe { (*mbuf).refcnt_update(change) };
        if new == 0 {
            let pool_id: PoolId = unsafe { (*mbuf).pool() };
            if pool_id == EXTERNAL_POOL_ID {
                self.external.free(mbuf as *mut u8);
            } else {
                match self.get_mut(pool_id) {
                    Some(pool) => pool.free_mbuf(mbuf),
                    None => warn!("mbuf at {:?} names unknown pool {}", mbuf, pool_id),
                }
            }
        }
        new
    }

    /// Tears down every pool; outstanding buffers make this fail per pool.
    pub fn destroy(self, device: &mut dyn Mlx5DirectDevice) -> Result<(), Fail> {
        for pool in self.tx {
            pool.destroy(device)?;
        }
        self.rx.destroy(device)?;
        self.external.destroy()
    }
}
