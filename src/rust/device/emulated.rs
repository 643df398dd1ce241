// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Host-memory device backend. Rings, doorbell records and the BlueFlame
//! window live in anonymous mappings, registration hands out monotonic local
//! keys, and the device side of the protocol (consuming posted descriptors,
//! stamping completions with the right ownership parity) is driven
//! explicitly, which is what the loopback tests need.

//==============================================================================
// Imports
//==============================================================================

use super::{
    Mlx5DirectDevice,
    RegisteredRegion,
    RxQueueResources,
    TxQueueResources,
};
use crate::{
    fail::Fail,
    macaddr::MacAddress,
    memory::mem::{
        MmapRegion,
        PGSIZE_4KB,
    },
    wire::{
        Mlx5Cqe64,
        Mlx5WqeCtrlSeg,
        Mlx5WqeDataSeg,
        CQE_SIZE,
        MLX5_CQE_INVALID,
        MLX5_CQE_REQ,
        MLX5_CQE_REQ_ERR,
        MLX5_CQE_RESP_ERR,
        MLX5_CQE_RESP_SEND,
        MLX5_RCV_DBR,
        MLX5_SND_DBR,
        SEND_WQE_BB,
    },
};
use ::std::{
    any::Any,
    ptr,
};

//==============================================================================
// Constants
//==============================================================================

/// Receive descriptor stride: one data segment.
const RX_WQE_STRIDE: usize = 16;
/// BlueFlame window size handed to send queues.
const BF_SIZE: usize = 256;
/// First local key issued by the emulated registrar.
const FIRST_LKEY: i32 = 0x100;

//==============================================================================
// Structures
//==============================================================================

struct EmulatedRxq {
    wq: MmapRegion,
    cq: MmapRegion,
    db: MmapRegion,
    wqe_cnt: u32,
    cqe_cnt: u32,
    /// Device-side consumer of posted receive descriptors.
    rq_ci: u32,
    /// Device-side completion producer.
    cq_pi: u32,
}

struct EmulatedTxq {
    sq: MmapRegion,
    cq: MmapRegion,
    db: MmapRegion,
    /// BlueFlame window; kept alive for the queue's lifetime.
    _bf: MmapRegion,
    wqe_cnt: u32,
    cqe_cnt: u32,
    /// Device-side consumer of posted work requests.
    sq_ci: u32,
    /// Device-side completion producer.
    cq_pi: u32,
}

/// Software rendition of the NIC.
pub struct EmulatedDevice {
    next_token: u64,
    next_lkey: i32,
    registrations: Vec<(u64, usize, usize)>,
    rxqs: Vec<EmulatedRxq>,
    txqs: Vec<EmulatedTxq>,
    steering_mac: Option<MacAddress>,
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn ring_region(len: usize) -> Result<MmapRegion, Fail> {
    let rounded: usize = (len + PGSIZE_4KB - 1) & !(PGSIZE_4KB - 1);
    MmapRegion::new(rounded, PGSIZE_4KB)
}

/// A fresh completion ring must read as not-ready everywhere: ownership bit
/// set and an invalid opcode.
fn reset_cq(cq: &MmapRegion, cqe_cnt: u32) {
    let buf: *mut u8 = cq.as_mut_ptr();
    for i in 0..cqe_cnt as usize {
        unsafe { ptr::write_volatile(buf.add(i * CQE_SIZE + 63), (MLX5_CQE_INVALID << 4) | 1) };
    }
}

//==============================================================================
// Associate Functions
//==============================================================================

impl EmulatedDevice {
    pub fn new() -> Self {
        Self {
            next_token: 1,
            next_lkey: FIRST_LKEY,
            registrations: Vec::new(),
            rxqs: Vec::new(),
            txqs: Vec::new(),
            steering_mac: None,
        }
    }

    fn rxq(&mut self, queue_id: usize) -> Result<&mut EmulatedRxq, Fail> {
        self.rxqs
            .get_mut(queue_id)
            .ok_or_else(|| Fail::new(libc::EINVAL, "unknown receive queue"))
    }

    fn txq(&mut self, queue_id: usize) -> Result<&mut EmulatedTxq, Fail> {
        self.txqs
            .get_mut(queue_id)
            .ok_or_else(|| Fail::new(libc::EINVAL, "unknown send queue"))
    }

    /// Device side of packet arrival: consumes the next posted receive
    /// descriptor, copies `frame` into its buffer and stamps a completion.
    pub fn deliver_rx(&mut self, queue_id: usize, frame: &[u8], rss_hash: u32) -> Result<(), Fail> {
        let q: &mut EmulatedRxq = self.rxq(queue_id)?;
        let producer: u32 = u32::from_be(unsafe { ptr::read_volatile(q.db.as_mut_ptr() as *const u32) });
        if q.rq_ci & 0xffff == producer & 0xffff {
            return Err(Fail::new(libc::ENOBUFS, "no posted receive descriptors"));
        }
        let slot: usize = (q.rq_ci & (q.wqe_cnt - 1)) as usize;
        let desc: &Mlx5WqeDataSeg = unsafe { &*(q.wq.as_mut_ptr().add(slot * RX_WQE_STRIDE) as *const Mlx5WqeDataSeg) };
        if frame.len() as u32 > desc.byte_count() {
            return Err(Fail::new(libc::EMSGSIZE, "frame larger than posted buffer"));
        }
        unsafe { ptr::copy_nonoverlapping(frame.as_ptr(), desc.addr() as *mut u8, frame.len()) };
        let cqe_slot: usize = (q.cq_pi & (q.cqe_cnt - 1)) as usize;
        let cqe: &mut Mlx5Cqe64 = unsafe { &mut *(q.cq.as_mut_ptr().add(cqe_slot * CQE_SIZE) as *mut Mlx5Cqe64) };
        let owner: bool = (q.cq_pi & q.cqe_cnt) != 0;
        cqe.write(MLX5_CQE_RESP_SEND, owner, q.rq_ci as u16, frame.len() as u32, rss_hash);
        q.rq_ci = q.rq_ci.wrapping_add(1);
        q.cq_pi = q.cq_pi.wrapping_add(1);
        Ok(())
    }

    /// Device side of a receive fault: consumes one posted descriptor and
    /// stamps an error completion with `syndrome`.
    pub fn fail_rx(&mut self, queue_id: usize, syndrome: u8) -> Result<(), Fail> {
        let q: &mut EmulatedRxq = self.rxq(queue_id)?;
        let cqe_slot: usize = (q.cq_pi & (q.cqe_cnt - 1)) as usize;
        let cqe: &mut Mlx5Cqe64 = unsafe { &mut *(q.cq.as_mut_ptr().add(cqe_slot * CQE_SIZE) as *mut Mlx5Cqe64) };
        let owner: bool = (q.cq_pi & q.cqe_cnt) != 0;
        cqe.write_error(MLX5_CQE_RESP_ERR, owner, q.rq_ci as u16, syndrome);
        q.rq_ci = q.rq_ci.wrapping_add(1);
        q.cq_pi = q.cq_pi.wrapping_add(1);
        Ok(())
    }

    /// Device side of transmission: walks posted work requests up to the
    /// doorbell-record producer, stamping one completion per transmission.
    /// Returns the number of transmissions retired.
    pub fn process_transmissions(&mut self, queue_id: usize) -> Result<usize, Fail> {
        let q: &mut EmulatedTxq = self.txq(queue_id)?;
        let producer: u32 =
            u32::from_be(unsafe { ptr::read_volatile((q.db.as_mut_ptr() as *const u32).add(MLX5_SND_DBR)) });
        let mut retired: usize = 0;
        while q.sq_ci & 0xffff != producer & 0xffff {
            let slot: usize = (q.sq_ci & (q.wqe_cnt - 1)) as usize;
            let ctrl: &Mlx5WqeCtrlSeg = unsafe { &*(q.sq.as_mut_ptr().add(slot * SEND_WQE_BB) as *const Mlx5WqeCtrlSeg) };
            let ds_cnt: u32 = u32::from_be(ctrl.qpn_ds) & 0xff;
            let num_wqes: u32 = (ds_cnt + 3) / 4;
            if num_wqes == 0 {
                return Err(Fail::new(libc::EIO, "malformed work request with zero segments"));
            }
            let cqe_slot: usize = (q.cq_pi & (q.cqe_cnt - 1)) as usize;
            let cqe: &mut Mlx5Cqe64 = unsafe { &mut *(q.cq.as_mut_ptr().add(cqe_slot * CQE_SIZE) as *mut Mlx5Cqe64) };
            let owner: bool = (q.cq_pi & q.cqe_cnt) != 0;
            cqe.write(MLX5_CQE_REQ, owner, q.sq_ci as u16, 0, 0);
            q.sq_ci = q.sq_ci.wrapping_add(num_wqes);
            q.cq_pi = q.cq_pi.wrapping_add(1);
            retired += 1;
        }
        Ok(retired)
    }

    /// Stamps a successful completion for the transmission whose first work
    /// request sits at `wqe_idx`.
    pub fn complete_tx(&mut self, queue_id: usize, wqe_idx: u16) -> Result<(), Fail> {
        let q: &mut EmulatedTxq = self.txq(queue_id)?;
        let cqe_slot: usize = (q.cq_pi & (q.cqe_cnt - 1)) as usize;
        let cqe: &mut Mlx5Cqe64 = unsafe { &mut *(q.cq.as_mut_ptr().add(cqe_slot * CQE_SIZE) as *mut Mlx5Cqe64) };
        let owner: bool = (q.cq_pi & q.cqe_cnt) != 0;
        cqe.write(MLX5_CQE_REQ, owner, wqe_idx, 0, 0);
        q.cq_pi = q.cq_pi.wrapping_add(1);
        Ok(())
    }

    /// Stamps an error completion for the transmission whose first work
    /// request sits at `wqe_idx`.
    pub fn fail_tx(&mut self, queue_id: usize, wqe_idx: u16, syndrome: u8) -> Result<(), Fail> {
        let q: &mut EmulatedTxq = self.txq(queue_id)?;
        let cqe_slot: usize = (q.cq_pi & (q.cqe_cnt - 1)) as usize;
        let cqe: &mut Mlx5Cqe64 = unsafe { &mut *(q.cq.as_mut_ptr().add(cqe_slot * CQE_SIZE) as *mut Mlx5Cqe64) };
        let owner: bool = (q.cq_pi & q.cqe_cnt) != 0;
        cqe.write_error(MLX5_CQE_REQ_ERR, owner, wqe_idx, syndrome);
        q.cq_pi = q.cq_pi.wrapping_add(1);
        Ok(())
    }

    /// MAC the steering tables were last pointed at.
    pub fn steering_mac(&self) -> Option<MacAddress> {
        self.steering_mac
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Mlx5DirectDevice for EmulatedDevice {
    fn register_memory(&mut self, addr: *mut u8, len: usize, _access: u32) -> Result<RegisteredRegion, Fail> {
        if addr.is_null() || len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot register an empty region"));
        }
        let token: u64 = self.next_token;
        self.next_token += 1;
        let lkey: i32 = self.next_lkey;
        self.next_lkey += 1;
        self.registrations.push((token, addr as usize, len));
        trace!("registered {} bytes at {:?} with lkey {}", len, addr, lkey);
        Ok(RegisteredRegion::new(lkey, addr, len, token))
    }

    fn deregister_memory(&mut self, region: RegisteredRegion) -> Result<(), Fail> {
        match self.registrations.iter().position(|(token, _, _)| *token == region.token()) {
            Some(pos) => {
                self.registrations.swap_remove(pos);
                Ok(())
            },
            None => Err(Fail::new(libc::EINVAL, "unknown registration handle")),
        }
    }

    fn create_rxq(&mut self, nr_desc: u32) -> Result<RxQueueResources, Fail> {
        if !nr_desc.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "descriptor count must be a power of two"));
        }
        let wq: MmapRegion = ring_region(nr_desc as usize * RX_WQE_STRIDE)?;
        let cq: MmapRegion = ring_region(nr_desc as usize * CQE_SIZE)?;
        let db: MmapRegion = ring_region(PGSIZE_4KB)?;
        reset_cq(&cq, nr_desc);
        unsafe { ptr::write_bytes(db.as_mut_ptr(), 0, PGSIZE_4KB) };
        let queue_id: usize = self.rxqs.len();
        let resources = RxQueueResources {
            queue_id,
            wq_buf: wq.as_mut_ptr(),
            wqe_cnt: nr_desc,
            wq_stride: RX_WQE_STRIDE as u32,
            wq_dbrec: unsafe { (db.as_mut_ptr() as *mut u32).add(MLX5_RCV_DBR) },
            cq_buf: cq.as_mut_ptr(),
            cqe_cnt: nr_desc,
            cq_dbrec: unsafe { (db.as_mut_ptr() as *mut u32).add(2) },
        };
        self.rxqs.push(EmulatedRxq {
            wq,
            cq,
            db,
            wqe_cnt: nr_desc,
            cqe_cnt: nr_desc,
            rq_ci: 0,
            cq_pi: 0,
        });
        Ok(resources)
    }

    fn create_txq(&mut self, nr_desc: u32) -> Result<TxQueueResources, Fail> {
        if !nr_desc.is_power_of_two() {
            return Err(Fail::new(libc::EINVAL, "descriptor count must be a power of two"));
        }
        let sq: MmapRegion = ring_region(nr_desc as usize * SEND_WQE_BB)?;
        let cq: MmapRegion = ring_region(nr_desc as usize * CQE_SIZE)?;
        let db: MmapRegion = ring_region(PGSIZE_4KB)?;
        let bf: MmapRegion = ring_region(PGSIZE_4KB)?;
        reset_cq(&cq, nr_desc);
        unsafe { ptr::write_bytes(db.as_mut_ptr(), 0, PGSIZE_4KB) };
        let queue_id: usize = self.txqs.len();
        let qpn: u32 = 0x80 + queue_id as u32;
        let resources = TxQueueResources {
            queue_id,
            sq_buf: sq.as_mut_ptr(),
            wqe_cnt: nr_desc,
            sq_stride: SEND_WQE_BB as u32,
            sq_dbrec: db.as_mut_ptr() as *mut u32,
            cq_buf: cq.as_mut_ptr(),
            cqe_cnt: nr_desc,
            cq_dbrec: unsafe { (db.as_mut_ptr() as *mut u32).add(2) },
            bf_reg: bf.as_mut_ptr(),
            bf_size: BF_SIZE,
            qpn,
        };
        self.txqs.push(EmulatedTxq {
            sq,
            cq,
            db,
            _bf: bf,
            wqe_cnt: nr_desc,
            cqe_cnt: nr_desc,
            sq_ci: 0,
            cq_pi: 0,
        });
        Ok(resources)
    }

    fn install_flow_steering(&mut self, mac: MacAddress, num_queues: usize) -> Result<(), Fail> {
        if num_queues != self.rxqs.len() {
            return Err(Fail::new(libc::EINVAL, "steering across queues that were never created"));
        }
        debug!("steering flows for {} across {} queues", mac, num_queues);
        self.steering_mac = Some(mac);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
