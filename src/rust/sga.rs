// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Ordered scatter-gather descriptors handed across the foreign-function
//! boundary. Segment order is the wire order.

//==============================================================================
// Imports
//==============================================================================

use crate::fail::Fail;
use ::libc::c_void;

//==============================================================================
// Constants
//==============================================================================

/// Most segments one ordered scatter-gather list can carry.
pub const SGA_MAX_SEGS: usize = 32;

//==============================================================================
// Structures
//==============================================================================

/// One contiguous byte range of a scatter-gather list.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SgaSeg {
    pub addr: *const c_void,
    pub len: usize,
}

/// A bounded, ordered list of segments making up one message.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OrderedSga {
    pub num_segs: usize,
    pub segs: [SgaSeg; SGA_MAX_SEGS],
}

//==============================================================================
// Associate Functions
//==============================================================================

impl OrderedSga {
    pub fn new() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Allocates a block of `size` empty descriptors; ownership passes to
    /// the caller as a raw pointer over the foreign-function boundary.
    pub fn allocate(size: usize) -> *mut OrderedSga {
        let block: Vec<OrderedSga> = vec![OrderedSga::new(); size];
        Box::into_raw(block.into_boxed_slice()) as *mut OrderedSga
    }

    pub fn add_segment(&mut self, addr: *const c_void, len: usize) -> Result<(), Fail> {
        if self.num_segs >= SGA_MAX_SEGS {
            return Err(Fail::new(libc::ENOSPC, "scatter-gather list is full"));
        }
        self.segs[self.num_segs] = SgaSeg { addr, len };
        self.num_segs += 1;
        Ok(())
    }

    #[inline]
    pub fn num_segs(&self) -> usize {
        self.num_segs
    }

    #[inline]
    pub fn segments(&self) -> &[SgaSeg] {
        &self.segs[..self.num_segs.min(SGA_MAX_SEGS)]
    }

    /// Total payload bytes across all segments.
    pub fn data_len(&self) -> usize {
        self.segments().iter().map(|s| s.len).sum()
    }
}

impl Default for OrderedSga {
    fn default() -> Self {
        Self::new()
    }
}
