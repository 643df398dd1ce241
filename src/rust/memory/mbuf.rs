// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::derive_more::{
    Display,
    From,
    Into,
};

//==============================================================================
// Constants
//==============================================================================

/// Local key value for a buffer whose registration unit is not registered.
pub const LKEY_INVALID: i32 = -1;

//==============================================================================
// Structures
//==============================================================================

/// Opaque handle naming a pool in a thread's pool table. Metadata buffers
/// carry this instead of a raw pool pointer, so returning a buffer is a table
/// lookup rather than a dereference of a possibly stale address.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, From, Into)]
pub struct PoolId(u32);

/// Pool table slot of the receive pool.
pub const RX_POOL_ID: PoolId = PoolId(0);
/// Pool table slot of the external-data metadata pool.
pub const EXTERNAL_POOL_ID: PoolId = PoolId(1);
/// Pool table slot of the first transmit pool.
pub const FIRST_TX_POOL_ID: u32 = 2;

/// Metadata buffer describing one packet payload buffer: where the payload
/// lives, how much of the slot it occupies, the local key authorizing DMA on
/// it, and a reference count tracking outstanding DMA and application uses.
#[repr(C)]
#[derive(Debug)]
pub struct Mbuf {
    /// Start of the data slot.
    buf_addr: *mut u8,
    /// Full length of the data slot.
    data_buf_len: usize,
    /// Payload offset into the data slot.
    offset: usize,
    /// Payload length.
    data_len: usize,
    /// Local key of the registration unit holding the data slot.
    lkey: i32,
    /// Flow hash reported by the NIC on receive.
    rss_hash: u32,
    /// Owning pool, resolved through the thread's pool table.
    pool: PoolId,
    /// Slot index shared by the data and metadata pools.
    index: usize,
    refcnt: u16,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mbuf {
    /// Initializes a freshly allocated metadata slot. The reference count
    /// starts at one, owned by the caller.
    pub fn init(&mut self, buf_addr: *mut u8, data_buf_len: usize, lkey: i32, pool: PoolId, index: usize) {
        self.buf_addr = buf_addr;
        self.data_buf_len = data_buf_len;
        self.offset = 0;
        self.data_len = 0;
        self.lkey = lkey;
        self.rss_hash = 0;
        self.pool = pool;
        self.index = index;
        self.refcnt = 1;
    }

    #[inline]
    pub fn buf_addr(&self) -> *mut u8 {
        self.buf_addr
    }

    #[inline]
    pub fn data_buf_len(&self) -> usize {
        self.data_buf_len
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    #[inline]
    pub fn lkey(&self) -> i32 {
        self.lkey
    }

    #[inline]
    pub fn rss_hash(&self) -> u32 {
        self.rss_hash
    }

    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn set_data_len(&mut self, data_len: usize) {
        self.data_len = data_len;
    }

    #[inline]
    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    #[inline]
    pub fn set_rss_hash(&mut self, rss_hash: u32) {
        self.rss_hash = rss_hash;
    }

    /// Pointer `off` bytes into the payload.
    #[inline]
    pub fn offset_ptr(&self, off: usize) -> *mut u8 {
        unsafe { self.buf_addr.add(self.offset + off) }
    }

    #[inline]
    pub fn refcnt_read(&self) -> u16 {
        self.refcnt
    }

    /// Applies `change` to the reference count, saturating at the 16-bit
    /// bounds, and returns the new value. The caller frees the buffer when
    /// this returns zero.
    #[inline]
    pub fn refcnt_update(&mut self, change: i16) -> u16 {
        self.refcnt = if change >= 0 {
            self.refcnt.saturating_add(change as u16)
        } else {
            let decr: u16 = change.unsigned_abs();
            if decr > self.refcnt {
                warn!("refcnt underflow on mbuf at {:?} (slot {})", self.buf_addr, self.index);
                0
            } else {
                self.refcnt - decr
            }
        };
        self.refcnt
    }
}
