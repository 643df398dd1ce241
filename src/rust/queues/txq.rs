// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Send queue: work requests are laid out over a flat ring of 64-byte
//! blocks, a parallel completion-info ring remembers which mbufs each
//! transmission borrowed, and three free-running cursors tie the two
//! together. `true_cq_head <= cq_head <= sq_head` at all times, and
//! `sq_head - true_cq_head` never exceeds the ring depth.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    device::TxQueueResources,
    fail::Fail,
    memory::{
        mbuf::Mbuf,
        registered::MempoolTable,
    },
    wire::{
        cqe_status,
        CqeStatus,
        Mlx5Cqe64,
        Mlx5WqeCtrlSeg,
        Mlx5WqeDataSeg,
        Mlx5WqeEthSeg,
        CQE_SIZE,
        ETH_SEG_INLINE_DATA_OFFSET,
        ETH_SEG_INLINE_HDR_START_OFFSET,
        MLX5_CQE_REQ_ERR,
        MLX5_OPCODE_SEND,
        MLX5_SND_DBR,
        MLX5_WQE_CTRL_CQ_UPDATE,
        SEND_WQE_BB,
    },
};
use ::std::{
    mem::size_of,
    ptr,
    sync::atomic::{
        fence,
        Ordering,
    },
};

//==============================================================================
// Constants
//==============================================================================

/// Completion-info entries per work-request slot (64-byte stride over
/// 8-byte entries).
const COMPLETION_INFO_PER_WQE: usize = SEND_WQE_BB / size_of::<TransmissionInfo>();

//==============================================================================
// Structures
//==============================================================================

/// First completion-info entry of a transmission: how many work-request
/// slots it spans and how many mbuf references it holds.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TransmissionMetadata {
    pub num_wqes: u32,
    pub num_mbufs: u32,
}

/// One 8-byte completion-info entry. The first entry of a transmission is
/// metadata; each of the following `num_mbufs` entries holds one borrowed
/// mbuf.
#[repr(C)]
#[derive(Clone, Copy)]
pub union TransmissionInfo {
    pub metadata: TransmissionMetadata,
    pub mbuf: *mut Mbuf,
}

/// One send queue of a queue pair.
pub struct Mlx5Txq {
    queue_id: usize,
    sq_buf: *mut u8,
    wqe_cnt: u32,
    log_stride: u32,
    sq_dbrec: *mut u32,
    cq_buf: *mut u8,
    cqe_cnt: u32,
    cq_dbrec: *mut u32,
    bf_reg: *mut u8,
    bf_size: usize,
    bf_offset: usize,
    qpn: u32,
    /// Next work-request slot to fill.
    sq_head: u32,
    /// Next completion-queue element to inspect.
    cq_head: u32,
    /// First work-request slot whose transmission is still in flight.
    true_cq_head: u32,
    completions: Vec<TransmissionInfo>,
    /// Mbuf references recorded since the last finished transmission.
    pending_mbufs: u32,
    /// Producer index at the last doorbell.
    last_posted: u32,
    /// Error completions observed.
    tx_err: usize,
}

//==============================================================================
// Standalone Functions
//==============================================================================

/// Number of 16-byte units a transmission occupies: control segment,
/// ethernet segment, inline bytes beyond the two carried in the ethernet
/// segment itself, and one unit per data segment.
pub fn num_octowords(inline_len: usize, num_segs: usize) -> usize {
    let mut hdr: usize = size_of::<Mlx5WqeCtrlSeg>() / 16 + ETH_SEG_INLINE_DATA_OFFSET / 16;
    if inline_len > 2 {
        hdr += (inline_len - 2 + 15) / 16;
    }
    hdr + (size_of::<Mlx5WqeDataSeg>() * num_segs) / 16
}

/// Work-request slots needed for `octowords` 16-byte units; each slot holds
/// four.
pub fn num_wqes_required(octowords: usize) -> usize {
    (octowords + 3) / 4
}

/// Byte offset into the work-request ring of the `inline_off`-th inline byte
/// of the transmission whose first slot starts at byte `wqe_off`. The first
/// two inline bytes sit inside the ethernet segment; the rest are packed
/// contiguously behind it, wrapping to the ring base past the end. With
/// `round_to_16` the result is the 16-byte-aligned position where a data
/// segment may start after `inline_off` inline bytes.
pub fn inline_offset_in_ring(ring_len: usize, wqe_off: usize, inline_off: usize, round_to_16: bool) -> usize {
    debug_assert!(ring_len.is_power_of_two() && ring_len >= SEND_WQE_BB);
    debug_assert!(wqe_off < ring_len && wqe_off % SEND_WQE_BB == 0);
    let inline_start: usize = wqe_off + size_of::<Mlx5WqeCtrlSeg>() + ETH_SEG_INLINE_HDR_START_OFFSET;
    let pos: usize = if round_to_16 {
        let packed: usize = inline_off.saturating_sub(2);
        inline_start + 2 + ((packed + 15) & !15)
    } else {
        inline_start + inline_off
    };
    pos % ring_len
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mlx5Txq {
    pub fn new(resources: TxQueueResources) -> Self {
        debug_assert!(resources.sq_stride as usize == SEND_WQE_BB);
        Self {
            queue_id: resources.queue_id,
            sq_buf: resources.sq_buf,
            wqe_cnt: resources.wqe_cnt,
            log_stride: (resources.sq_stride as usize).trailing_zeros(),
            sq_dbrec: resources.sq_dbrec,
            cq_buf: resources.cq_buf,
            cqe_cnt: resources.cqe_cnt,
            cq_dbrec: resources.cq_dbrec,
            bf_reg: resources.bf_reg,
            bf_size: resources.bf_size,
            bf_offset: 0,
            qpn: resources.qpn,
            sq_head: 0,
            cq_head: 0,
            true_cq_head: 0,
            completions: vec![TransmissionInfo { mbuf: ptr::null_mut() }; resources.wqe_cnt as usize * COMPLETION_INFO_PER_WQE],
            pending_mbufs: 0,
            last_posted: 0,
            tx_err: 0,
        }
    }

    #[inline]
    pub fn queue_id(&self) -> usize {
        self.queue_id
    }

    #[inline]
    pub fn wqe_cnt(&self) -> u32 {
        self.wqe_cnt
    }

    #[inline]
    pub fn sq_head(&self) -> u32 {
        self.sq_head
    }

    #[inline]
    pub fn true_cq_head(&self) -> u32 {
        self.true_cq_head
    }

    #[inline]
    pub fn tx_err(&self) -> usize {
        self.tx_err
    }

    /// Work requests posted but not yet retired.
    #[inline]
    pub fn nr_inflight(&self) -> u32 {
        self.sq_head.wrapping_sub(self.true_cq_head)
    }

    /// Whether `num_wqes` slots can be filled right now.
    #[inline]
    pub fn tx_descriptors_available(&self, num_wqes: usize) -> bool {
        (self.wqe_cnt - self.nr_inflight()) as usize >= num_wqes
    }

    #[inline]
    fn current_segment(&self) -> u32 {
        self.sq_head & (self.wqe_cnt - 1)
    }

    #[inline]
    fn ring_len(&self) -> usize {
        (self.wqe_cnt as usize) << self.log_stride
    }

    #[inline]
    fn work_request(&self, slot: u32) -> *mut u8 {
        unsafe { self.sq_buf.add((slot as usize) << self.log_stride) }
    }

    /// Byte offset of the current transmission's first slot.
    #[inline]
    fn wqe_off(&self) -> usize {
        (self.current_segment() as usize) << self.log_stride
    }

    /// Device-shared bytes of the work-request ring.
    pub fn work_request_ring(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.sq_buf, self.ring_len()) }
    }

    /// Starts a transmission by writing its control and ethernet segments at
    /// the current head slot. The caller must have checked availability.
    pub fn fill_in_hdr_segment(
        &mut self,
        num_octowords: usize,
        num_wqes: usize,
        inline_len: usize,
        num_segs: usize,
        tx_flags: u8,
    ) -> Result<*mut Mlx5WqeCtrlSeg, Fail> {
        debug_assert!(num_wqes == num_wqes_required(num_octowords));
        debug_assert!(num_octowords == super::txq::num_octowords(inline_len, num_segs));
        // the control segment's data-size field is six bits wide
        if num_wqes * 4 > 63 {
            return Err(Fail::new(libc::EMSGSIZE, "transmission exceeds the device segment limit"));
        }
        if !self.tx_descriptors_available(num_wqes) {
            return Err(Fail::new(libc::EAGAIN, "not enough free work-request slots"));
        }
        let ctrl: *mut Mlx5WqeCtrlSeg = self.work_request(self.current_segment()) as *mut Mlx5WqeCtrlSeg;
        let eseg: *mut Mlx5WqeEthSeg = unsafe { ctrl.add(1) } as *mut Mlx5WqeEthSeg;
        unsafe {
            let mut ctrl_val: Mlx5WqeCtrlSeg = std::mem::zeroed();
            ctrl_val.set(
                self.sq_head as u16,
                MLX5_OPCODE_SEND,
                self.qpn,
                (num_wqes * 4) as u8,
                MLX5_WQE_CTRL_CQ_UPDATE,
            );
            ptr::write_volatile(ctrl, ctrl_val);
            let mut eseg_val: Mlx5WqeEthSeg = std::mem::zeroed();
            eseg_val.set(tx_flags, inline_len as u16);
            ptr::write_volatile(eseg, eseg_val);
        }
        Ok(ctrl)
    }

    /// Copies inline payload into the transmission being built, starting
    /// `inline_offset` bytes into its inline region. Returns the number of
    /// bytes copied, truncated to the declared inline size.
    pub fn copy_inline_data(&mut self, inline_offset: usize, src: &[u8], inline_size: usize) -> usize {
        if inline_offset >= inline_size {
            return 0;
        }
        let to_copy: usize = src.len().min(inline_size - inline_offset);
        let ring_len: usize = self.ring_len();
        let wqe_off: usize = self.wqe_off();
        let mut copied: usize = 0;
        while copied < to_copy {
            let dst_off: usize = inline_offset_in_ring(ring_len, wqe_off, inline_offset + copied, false);
            let run: usize = (to_copy - copied).min(ring_len - dst_off);
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr().add(copied), self.sq_buf.add(dst_off), run);
            }
            copied += run;
        }
        to_copy
    }

    /// First data-segment position of the current transmission, after
    /// `inline_len` inline bytes.
    pub fn dpseg_start(&self, inline_len: usize) -> *mut Mlx5WqeDataSeg {
        let off: usize = inline_offset_in_ring(self.ring_len(), self.wqe_off(), inline_len, true);
        unsafe { self.sq_buf.add(off) as *mut Mlx5WqeDataSeg }
    }

    /// Second completion-info entry of the current transmission, where the
    /// first borrowed mbuf is recorded.
    pub fn completion_start(&mut self) -> *mut TransmissionInfo {
        let base: usize = self.current_segment() as usize * COMPLETION_INFO_PER_WQE;
        let next: usize = (base + 1) % self.completions.len();
        &mut self.completions[next] as *mut TransmissionInfo
    }

    /// Appends one data segment referencing `data_len` bytes at
    /// `data_off` into `m`'s payload, returning the next segment position
    /// with ring wrap.
    pub fn add_dpseg(
        &mut self,
        dpseg: *mut Mlx5WqeDataSeg,
        m: *mut Mbuf,
        data_off: usize,
        data_len: usize,
    ) -> *mut Mlx5WqeDataSeg {
        unsafe {
            let mut seg: Mlx5WqeDataSeg = std::mem::zeroed();
            seg.set(
                data_len as u32,
                (*m).lkey() as u32,
                (*m).buf_addr() as u64 + ((*m).offset() + data_off) as u64,
            );
            ptr::write_volatile(dpseg, seg);
        }
        let next: usize = (dpseg as usize - self.sq_buf as usize + size_of::<Mlx5WqeDataSeg>()) % self.ring_len();
        unsafe { self.sq_buf.add(next) as *mut Mlx5WqeDataSeg }
    }

    /// Records a borrowed mbuf in the completion-info ring, returning the
    /// next entry position with ring wrap.
    pub fn add_completion_info(&mut self, info: *mut TransmissionInfo, m: *mut Mbuf) -> *mut TransmissionInfo {
        unsafe { (*info).mbuf = m };
        self.pending_mbufs += 1;
        let base: *mut TransmissionInfo = self.completions.as_mut_ptr();
        let next: usize = (unsafe { info.offset_from(base) } as usize + 1) % self.completions.len();
        unsafe { base.add(next) }
    }

    /// Seals the current transmission: stores its slot and mbuf counts in
    /// the first completion-info entry and advances the head.
    pub fn finish_single_transmission(&mut self, num_wqes: usize) {
        let base: usize = self.current_segment() as usize * COMPLETION_INFO_PER_WQE;
        self.completions[base] = TransmissionInfo {
            metadata: TransmissionMetadata {
                num_wqes: num_wqes as u32,
                num_mbufs: self.pending_mbufs,
            },
        };
        self.pending_mbufs = 0;
        self.sq_head = self.sq_head.wrapping_add(num_wqes as u32);
        debug_assert!(self.nr_inflight() <= self.wqe_cnt);
    }

    /// Publishes every transmission finished since the last call: fences,
    /// writes the producer index to the doorbell record and copies the first
    /// 64 bytes of the first control segment through the BlueFlame window.
    /// A no-op when nothing was added.
    pub fn post_transmissions(&mut self, first_ctrl: *mut Mlx5WqeCtrlSeg) -> Result<(), Fail> {
        if self.sq_head == self.last_posted {
            return Ok(());
        }
        if first_ctrl.is_null() {
            return Err(Fail::new(libc::EINVAL, "transmissions pending but no control segment given"));
        }
        // all WQE bytes must be visible before the producer index moves
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(self.sq_dbrec.add(MLX5_SND_DBR), (self.sq_head & 0xffff).to_be());
        }
        fence(Ordering::SeqCst);
        let src: *const u64 = first_ctrl as *const u64;
        let dst: *mut u64 = unsafe { self.bf_reg.add(self.bf_offset) } as *mut u64;
        for i in 0..(SEND_WQE_BB / size_of::<u64>()) {
            unsafe { ptr::write_volatile(dst.add(i), ptr::read(src.add(i))) };
        }
        self.bf_offset ^= self.bf_size;
        self.last_posted = self.sq_head;
        Ok(())
    }

    /// Retires up to `budget` completions. Each ready element releases every
    /// transmission group up to and including the one holding its
    /// `wqe_counter`, dropping one reference per recorded mbuf. Error
    /// completions are counted and logged, and their groups released all the
    /// same.
    pub fn process_completions(&mut self, budget: usize, pools: &mut MempoolTable) -> Result<usize, Fail> {
        let mut processed: usize = 0;
        while processed < budget {
            let cqe: *const Mlx5Cqe64 =
                unsafe { self.cq_buf.add(((self.cq_head & (self.cqe_cnt - 1)) as usize) * CQE_SIZE) }
                    as *const Mlx5Cqe64;
            let opcode: u8 = match cqe_status(cqe, self.cqe_cnt, self.cq_head) {
                CqeStatus::NotReady => break,
                CqeStatus::Ready(opcode) => opcode,
            };
            if opcode == MLX5_CQE_REQ_ERR {
                let syndrome: u8 = unsafe { (*cqe).error_syndrome() };
                warn!(
                    "send completion error on queue {}, syndrome {:#x}",
                    self.queue_id, syndrome
                );
                self.tx_err += 1;
            }
            let wqe_counter: u16 = unsafe { (*cqe).wqe_counter() };
            let target: u16 = wqe_counter.wrapping_add(1);
            while (target.wrapping_sub(self.true_cq_head as u16) as i16) > 0 {
                let base: usize = (self.true_cq_head & (self.wqe_cnt - 1)) as usize * COMPLETION_INFO_PER_WQE;
                let metadata: TransmissionMetadata = unsafe { self.completions[base].metadata };
                if metadata.num_wqes == 0 {
                    warn!("corrupt completion metadata at slot {}", base / COMPLETION_INFO_PER_WQE);
                    return Err(Fail::new(libc::EIO, "completion ring out of sync with send queue"));
                }
                let mut entry: usize = base + 1;
                for _ in 0..metadata.num_mbufs {
                    if entry == self.completions.len() {
                        entry = 0;
                    }
                    let m: *mut Mbuf = unsafe { self.completions[entry].mbuf };
                    pools.mbuf_refcnt_update_or_free(m, -1);
                    entry += 1;
                }
                self.true_cq_head = self.true_cq_head.wrapping_add(metadata.num_wqes);
            }
            self.cq_head = self.cq_head.wrapping_add(1);
            processed += 1;
        }
        if processed > 0 {
            unsafe { ptr::write_volatile(self.cq_dbrec, (self.cq_head & 0xffffff).to_be()) };
        }
        Ok(processed)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
