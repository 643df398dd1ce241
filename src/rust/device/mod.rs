// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lifecycle hooks onto the device layer. Opening the device context,
//! protection domain and steering tables happens behind [Mlx5DirectDevice];
//! the datapath core only consumes the memory registrations and queue
//! mappings produced here.

pub mod emulated;

//==============================================================================
// Imports
//==============================================================================

use crate::{
    config::Config,
    fail::Fail,
    macaddr::MacAddress,
};
use ::std::any::Any;

//==============================================================================
// Constants
//==============================================================================

/// Registration allows the NIC to write into the region (receive buffers).
pub const ACCESS_LOCAL_WRITE: u32 = 0x1;

//==============================================================================
// Structures
//==============================================================================

/// One NIC memory registration: pinned pages plus the local key that
/// authorizes DMA on them. Returned by [Mlx5DirectDevice::register_memory]
/// and handed back on deregistration.
#[derive(Debug)]
pub struct RegisteredRegion {
    lkey: i32,
    addr: *mut u8,
    len: usize,
    token: u64,
}

/// Receive queue mapping: the posted-descriptor ring, its completion ring
/// and the doorbell record, all device-shared memory.
#[derive(Debug)]
pub struct RxQueueResources {
    pub queue_id: usize,
    pub wq_buf: *mut u8,
    pub wqe_cnt: u32,
    pub wq_stride: u32,
    pub wq_dbrec: *mut u32,
    pub cq_buf: *mut u8,
    pub cqe_cnt: u32,
    pub cq_dbrec: *mut u32,
}

/// Send queue mapping: the work-request ring, completion ring, doorbell
/// record pair and the BlueFlame register window.
#[derive(Debug)]
pub struct TxQueueResources {
    pub queue_id: usize,
    pub sq_buf: *mut u8,
    pub wqe_cnt: u32,
    pub sq_stride: u32,
    pub sq_dbrec: *mut u32,
    pub cq_buf: *mut u8,
    pub cqe_cnt: u32,
    pub cq_dbrec: *mut u32,
    pub bf_reg: *mut u8,
    pub bf_size: usize,
    pub qpn: u32,
}

//==============================================================================
// Traits
//==============================================================================

/// Device operations the datapath core requires. One implementation wraps
/// the verbs library against real hardware; [emulated::EmulatedDevice] backs
/// the rings with host memory.
pub trait Mlx5DirectDevice {
    /// Pins `len` bytes at `addr` and issues a local key for them.
    fn register_memory(&mut self, addr: *mut u8, len: usize, access: u32) -> Result<RegisteredRegion, Fail>;

    /// Releases a registration; the local key becomes invalid.
    fn deregister_memory(&mut self, region: RegisteredRegion) -> Result<(), Fail>;

    /// Creates a receive queue of `nr_desc` descriptors with an equally deep
    /// completion queue.
    fn create_rxq(&mut self, nr_desc: u32) -> Result<RxQueueResources, Fail>;

    /// Creates a send queue of `nr_desc` work-request slots with an equally
    /// deep completion queue.
    fn create_txq(&mut self, nr_desc: u32) -> Result<TxQueueResources, Fail>;

    /// Points the flow-steering and RSS indirection tables at the created
    /// receive queues for frames addressed to `mac`.
    fn install_flow_steering(&mut self, mac: MacAddress, num_queues: usize) -> Result<(), Fail>;

    /// Escape hatch for backend-specific controls.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Mlx5DirectDevice {
    /// Downcast access to a concrete backend.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

impl RegisteredRegion {
    pub fn new(lkey: i32, addr: *mut u8, len: usize, token: u64) -> Self {
        Self { lkey, addr, len, token }
    }

    #[inline]
    pub fn lkey(&self) -> i32 {
        self.lkey
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Opens the device backend named by the configuration. Real hardware
/// bring-up (PCI resolution, verbs context, protection domain) belongs to
/// the embedding layer; the emulated backend is the one this crate ships.
pub fn open(config: &Config) -> Result<Box<dyn Mlx5DirectDevice>, Fail> {
    match config.backend().as_str() {
        "emulated" => Ok(Box::new(emulated::EmulatedDevice::new())),
        backend => Err(Fail::new(
            libc::ENODEV,
            &format!("no driver available for backend {:?}", backend),
        )),
    }
}
