// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use super::mem::{
    PGSIZE_1GB,
    PGSIZE_2MB,
    PGSIZE_4KB,
};
use crate::fail::Fail;

//==============================================================================
// Constants
//==============================================================================

/// Default length of a receive data buffer.
pub const RX_MEMPOOL_DATA_LEN: usize = 2048;
/// Default number of receive data buffers per thread.
pub const RX_MEMPOOL_MIN_NUM_ITEMS: usize = 8192;
/// Page size backing the receive pool.
pub const RX_MEMPOOL_DATA_PGSIZE: usize = PGSIZE_2MB;

/// Default length of a transmit data buffer.
pub const TX_MEMPOOL_DATA_LEN: usize = 2048;
/// Default number of transmit data buffers per pool.
pub const TX_MEMPOOL_MIN_NUM_ITEMS: usize = 8192;
/// Page size backing transmit pools.
pub const TX_MEMPOOL_DATA_PGSIZE: usize = PGSIZE_2MB;

//==============================================================================
// Structures
//==============================================================================

/// Validated geometry for one pool allocation. Construction is the single
/// place where item length, page size and registration-unit compatibility
/// are checked, so the pool code can assume a consistent shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolAllocationParams {
    num_items: usize,
    data_pgsize: usize,
    item_len: usize,
    registration_unit: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl MempoolAllocationParams {
    pub fn new(
        num_items: usize,
        data_pgsize: usize,
        item_len: usize,
        registration_unit: usize,
    ) -> Result<Self, Fail> {
        if num_items == 0 {
            return Err(Fail::new(libc::EINVAL, "mempool must hold at least one item"));
        }
        if data_pgsize != PGSIZE_4KB && data_pgsize != PGSIZE_2MB && data_pgsize != PGSIZE_1GB {
            return Err(Fail::new(libc::EINVAL, "page size must be 4KB, 2MB or 1GB"));
        }
        if !item_len.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "item length must be a power of two"));
        }
        // items may not straddle a page boundary
        if item_len < data_pgsize && data_pgsize % item_len != 0 {
            return Err(Fail::new(libc::EINVAL, "item length must divide the page size"));
        }
        if item_len >= data_pgsize && item_len % data_pgsize != 0 {
            return Err(Fail::new(libc::EINVAL, "item length must be a multiple of the page size"));
        }
        let len: usize = item_len * num_items;
        if registration_unit == 0
            || registration_unit % item_len != 0
            || registration_unit % data_pgsize != 0
            || len % registration_unit != 0
        {
            return Err(Fail::new(
                libc::EINVAL,
                "registration unit must be a multiple of the item length and page size, and divide the region",
            ));
        }
        Ok(Self {
            num_items,
            data_pgsize,
            item_len,
            registration_unit,
        })
    }

    pub fn get_item_len(&self) -> usize {
        self.item_len
    }

    pub fn get_num_items(&self) -> usize {
        self.num_items
    }

    pub fn get_data_pgsize(&self) -> usize {
        self.data_pgsize
    }

    pub fn get_registration_unit(&self) -> usize {
        self.registration_unit
    }

    pub fn get_region_len(&self) -> usize {
        self.item_len * self.num_items
    }
}
