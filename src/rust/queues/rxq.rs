// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Receive queue: a ring of posted buffers, drained from its completion
//! queue and refilled slot by slot so the NIC never runs dry.

//==============================================================================
// Imports
//==============================================================================

use super::RECEIVE_BATCH_SIZE;
use crate::{
    device::RxQueueResources,
    fail::Fail,
    memory::{
        mbuf::Mbuf,
        registered::MempoolTable,
    },
    wire::{
        cqe_status,
        CqeStatus,
        Mlx5Cqe64,
        Mlx5WqeDataSeg,
        CQE_SIZE,
        MLX5_CQE_RESP_ERR,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    ptr,
    ptr::NonNull,
    sync::atomic::{
        fence,
        Ordering,
    },
};

//==============================================================================
// Structures
//==============================================================================

/// One receive queue of a queue pair.
#[derive(Debug)]
pub struct Mlx5Rxq {
    queue_id: usize,
    wq_buf: *mut u8,
    wqe_cnt: u32,
    wq_stride: u32,
    wq_dbrec: *mut u32,
    cq_buf: *mut u8,
    cqe_cnt: u32,
    cq_dbrec: *mut u32,
    /// Next work-queue slot to post into.
    wq_head: u32,
    /// Next completion-queue element to inspect.
    consumer_idx: u32,
    /// Mbuf posted at each work-queue slot.
    buffers: Vec<*mut Mbuf>,
    /// Packets the hardware reported as errored.
    rx_hw_drop: usize,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mlx5Rxq {
    pub fn new(resources: RxQueueResources) -> Self {
        Self {
            queue_id: resources.queue_id,
            wq_buf: resources.wq_buf,
            wqe_cnt: resources.wqe_cnt,
            wq_stride: resources.wq_stride,
            wq_dbrec: resources.wq_dbrec,
            cq_buf: resources.cq_buf,
            cqe_cnt: resources.cqe_cnt,
            cq_dbrec: resources.cq_dbrec,
            wq_head: 0,
            consumer_idx: 0,
            buffers: vec![ptr::null_mut(); resources.wqe_cnt as usize],
            rx_hw_drop: 0,
        }
    }

    #[inline]
    pub fn queue_id(&self) -> usize {
        self.queue_id
    }

    #[inline]
    pub fn wq_head(&self) -> u32 {
        self.wq_head
    }

    #[inline]
    pub fn rx_hw_drop(&self) -> usize {
        self.rx_hw_drop
    }

    /// Allocates `count` buffers from the receive pool and posts them. The
    /// doorbell rings once for the whole batch; buffers already posted stay
    /// published even when the pool runs out mid-way.
    pub fn refill(&mut self, count: usize, pools: &mut MempoolTable) -> Result<(), Fail> {
        let mask: u32 = self.wqe_cnt - 1;
        let mut posted: usize = 0;
        let mut exhausted: bool = false;
        for _ in 0..count {
            let mbuf: NonNull<Mbuf> = match pools.alloc_rx_mbuf()? {
                Some(mbuf) => mbuf,
                None => {
                    exhausted = true;
                    break;
                },
            };
            let slot: usize = (self.wq_head & mask) as usize;
            let m: &Mbuf = unsafe { mbuf.as_ref() };
            let mut desc: Mlx5WqeDataSeg = unsafe { std::mem::zeroed() };
            desc.set(m.data_buf_len() as u32, m.lkey() as u32, m.buf_addr() as u64);
            unsafe {
                ptr::write_volatile(
                    self.wq_buf.add(slot * self.wq_stride as usize) as *mut Mlx5WqeDataSeg,
                    desc,
                );
            }
            self.buffers[slot] = mbuf.as_ptr();
            self.wq_head = self.wq_head.wrapping_add(1);
            posted += 1;
        }
        if posted > 0 {
            // descriptors must be visible before the producer index moves
            fence(Ordering::Release);
            unsafe { ptr::write_volatile(self.wq_dbrec, (self.wq_head & 0xffff).to_be()) };
        }
        if exhausted {
            warn!("receive pool empty after posting {} of {} buffers", posted, count);
            return Err(Fail::new(libc::ENOMEM, "receive pool exhausted during refill"));
        }
        Ok(())
    }

    /// Releases every buffer still posted in the ring. Teardown only; the
    /// device must no longer be delivering into these slots.
    pub fn release_posted(&mut self, pools: &mut MempoolTable) {
        for slot in 0..self.buffers.len() {
            let mbuf: *mut Mbuf = self.buffers[slot];
            if !mbuf.is_null() {
                self.buffers[slot] = ptr::null_mut();
                pools.mbuf_refcnt_update_or_free(mbuf, -1);
            }
        }
    }

    /// Drains up to `budget` received packets into `out`. Each valid
    /// completion hands its mbuf (reference count one, owned by the caller)
    /// to `out` and immediately reposts a fresh buffer in its slot; errored
    /// completions are counted, dropped and reposted the same way.
    pub fn gather_rx(
        &mut self,
        out: &mut ArrayVec<NonNull<Mbuf>, RECEIVE_BATCH_SIZE>,
        budget: usize,
        pools: &mut MempoolTable,
    ) -> Result<usize, Fail> {
        let mask: u32 = self.wqe_cnt - 1;
        let mut received: usize = 0;
        let mut progressed: bool = false;
        while received < budget && !out.is_full() {
            let cqe: *const Mlx5Cqe64 =
                unsafe { self.cq_buf.add(((self.consumer_idx & (self.cqe_cnt - 1)) as usize) * CQE_SIZE) }
                    as *const Mlx5Cqe64;
            let opcode: u8 = match cqe_status(cqe, self.cqe_cnt, self.consumer_idx) {
                CqeStatus::NotReady => break,
                CqeStatus::Ready(opcode) => opcode,
            };
            let slot: usize = (self.wq_head & mask) as usize;
            let mbuf: *mut Mbuf = self.buffers[slot];
            self.buffers[slot] = ptr::null_mut();
            if mbuf.is_null() {
                return Err(Fail::new(libc::EINVAL, "completion for a slot with no posted buffer"));
            }
            if opcode == MLX5_CQE_RESP_ERR {
                let syndrome: u8 = unsafe { (*cqe).error_syndrome() };
                warn!("receive completion error on queue {}, syndrome {:#x}", self.queue_id, syndrome);
                self.rx_hw_drop += 1;
                pools.mbuf_refcnt_update_or_free(mbuf, -1);
            } else {
                let byte_cnt: u32 = unsafe { (*cqe).byte_cnt() };
                let rss_hash: u32 = unsafe { (*cqe).rss_hash() };
                unsafe {
                    (*mbuf).set_offset(0);
                    (*mbuf).set_data_len(byte_cnt as usize);
                    (*mbuf).set_rss_hash(rss_hash);
                }
                out.push(unsafe { NonNull::new_unchecked(mbuf) });
                received += 1;
            }
            self.wq_head = self.wq_head.wrapping_add(1);
            self.consumer_idx = self.consumer_idx.wrapping_add(1);
            progressed = true;
            // keep the ring full
            self.refill(1, pools)?;
        }
        if progressed {
            unsafe { ptr::write_volatile(self.cq_dbrec, (self.consumer_idx & 0xffffff).to_be()) };
        }
        Ok(received)
    }
}
