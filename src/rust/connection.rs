// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Connection layer over one queue pair: frames scatter-gather messages,
//! choosing per segment between inlining, copying into a transmit buffer
//! and zero-copy DMA references, and hands received payloads back without
//! copying them out of the receive pool.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    config::Config,
    context::{
        Mlx5GlobalContext,
        Mlx5PerThreadContext,
    },
    device,
    fail::Fail,
    interop::ReceivedPkt,
    logging,
    macaddr::MacAddress,
    memory::{
        mbuf::Mbuf,
        mem::PGSIZE_2MB,
        registered::{
            MempoolTable,
            MBUF_SLOT_LEN,
        },
        sizes::{
            MempoolAllocationParams,
            RX_MEMPOOL_DATA_LEN,
            RX_MEMPOOL_DATA_PGSIZE,
            RX_MEMPOOL_MIN_NUM_ITEMS,
            TX_MEMPOOL_DATA_LEN,
            TX_MEMPOOL_MIN_NUM_ITEMS,
        },
    },
    queues::{
        txq::{
            num_octowords,
            num_wqes_required,
        },
        COMPLETION_BUDGET,
        RECEIVE_BATCH_SIZE,
    },
    sga::OrderedSga,
    wire::{
        Mlx5WqeCtrlSeg,
        MLX5_ETH_WQE_L3_CSUM,
        MLX5_ETH_WQE_L4_CSUM,
    },
};
use ::arrayvec::ArrayVec;
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::std::{
    net::Ipv4Addr,
    ptr,
    ptr::NonNull,
    rc::Rc,
};

//==============================================================================
// Constants
//==============================================================================

/// Ethernet header plus message id and connection id.
pub const FRAME_HEADER_LEN: usize = 22;
/// Ether type tagging datapath frames.
const FRAME_ETHER_TYPE: u16 = 0xcafe;
/// Offset of the message id within the frame.
const FRAME_MSG_ID_OFFSET: usize = 14;
/// Offset of the connection id within the frame.
const FRAME_CONN_ID_OFFSET: usize = 18;

/// Most bytes a transmission may inline.
pub const MAX_INLINE_DATA: usize = 256;

/// Segments at or below this many bytes are copied by default.
const DEFAULT_COPYING_THRESHOLD: usize = 256;

//==============================================================================
// Structures
//==============================================================================

/// One planned data segment of a transmission: the mbuf lending the bytes,
/// an offset into its payload and a length. The transmission owns one
/// reference on the mbuf until its completion is processed.
struct PlannedSeg {
    mbuf: *mut Mbuf,
    data_off: usize,
    len: usize,
}

/// A connection bound to one datapath thread.
pub struct Mlx5Connection {
    global_context: Rc<Mlx5GlobalContext>,
    thread_context: Mlx5PerThreadContext,
    server_ip: Ipv4Addr,
    copying_threshold: usize,
    inline_mode: usize,
    /// Mbufs backing the batch most recently handed to the application.
    pending_pop: Vec<*mut Mbuf>,
    /// Batch storage returned by [Self::pop]; valid until the next call.
    received: Vec<ReceivedPkt>,
}

//==============================================================================
// Standalone Functions
//==============================================================================

fn build_frame_header(src: MacAddress, msg_id: u32, conn_id: usize) -> [u8; FRAME_HEADER_LEN] {
    let mut hdr: [u8; FRAME_HEADER_LEN] = [0; FRAME_HEADER_LEN];
    hdr[0..6].copy_from_slice(MacAddress::broadcast().as_bytes());
    hdr[6..12].copy_from_slice(src.as_bytes());
    NetworkEndian::write_u16(&mut hdr[12..14], FRAME_ETHER_TYPE);
    NetworkEndian::write_u32(&mut hdr[FRAME_MSG_ID_OFFSET..FRAME_MSG_ID_OFFSET + 4], msg_id);
    NetworkEndian::write_u32(&mut hdr[FRAME_CONN_ID_OFFSET..FRAME_CONN_ID_OFFSET + 4], conn_id as u32);
    hdr
}

/// Geometry for a transmit pool of `min_elts` buffers of `buf_size` bytes,
/// rounded so data and metadata regions both fill whole pages.
fn tx_pool_params(buf_size: usize, min_elts: usize) -> Result<MempoolAllocationParams, Fail> {
    let item_len: usize = buf_size.next_power_of_two().max(MBUF_SLOT_LEN);
    if item_len > PGSIZE_2MB {
        return Err(Fail::new(libc::EINVAL, "transmit buffers larger than a huge page"));
    }
    let per_page: usize = PGSIZE_2MB / item_len;
    let chunk: usize = per_page.max(crate::memory::mem::PGSIZE_4KB / MBUF_SLOT_LEN);
    let num_items: usize = (min_elts.max(1) + chunk - 1) / chunk * chunk;
    MempoolAllocationParams::new(num_items, PGSIZE_2MB, item_len, PGSIZE_2MB)
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mlx5Connection {
    /// Parses the configuration, opens the device backend and brings up the
    /// global context, one per-thread context with a full receive ring, a
    /// default transmit pool and the steering tables.
    pub fn new(config_path: &str, server_ip: &str) -> Result<Self, Fail> {
        logging::initialize();
        let config: Config = Config::new(config_path)?;
        let server_ip: Ipv4Addr = server_ip
            .parse()
            .map_err(|_| Fail::new(libc::EINVAL, "malformed server ip"))?;
        if config.num_threads() > 1 {
            return Err(Fail::new(libc::EINVAL, "only one datapath thread is supported"));
        }
        let device = device::open(&config)?;
        let our_eth: MacAddress = config.local_mac_addr()?;
        let global_context: Rc<Mlx5GlobalContext> =
            Rc::new(Mlx5GlobalContext::new(device, our_eth, config.num_threads())?);
        let rx_params: MempoolAllocationParams = MempoolAllocationParams::new(
            RX_MEMPOOL_MIN_NUM_ITEMS,
            RX_MEMPOOL_DATA_PGSIZE,
            RX_MEMPOOL_DATA_LEN,
            PGSIZE_2MB,
        )?;
        let mut thread_context: Mlx5PerThreadContext = Mlx5PerThreadContext::new(global_context.clone(), 0, &rx_params)?;
        let tx_params: MempoolAllocationParams = tx_pool_params(TX_MEMPOOL_DATA_LEN, TX_MEMPOOL_MIN_NUM_ITEMS)?;
        thread_context.add_tx_pool(&tx_params, false)?;
        global_context.install_flow_steering()?;
        debug!("connection up for server {} as {}", server_ip, our_eth);
        Ok(Self {
            global_context,
            thread_context,
            server_ip,
            copying_threshold: DEFAULT_COPYING_THRESHOLD,
            inline_mode: 0,
            pending_pop: Vec::new(),
            received: Vec::new(),
        })
    }

    #[inline]
    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    #[inline]
    pub fn global_context(&self) -> &Rc<Mlx5GlobalContext> {
        &self.global_context
    }

    #[inline]
    pub fn thread_context(&self) -> &Mlx5PerThreadContext {
        &self.thread_context
    }

    #[inline]
    pub fn thread_context_mut(&mut self) -> &mut Mlx5PerThreadContext {
        &mut self.thread_context
    }

    /// Segments at or below the threshold are copied into a transmit
    /// buffer; larger ones go out zero-copy.
    pub fn set_copying_threshold(&mut self, threshold: usize) {
        self.copying_threshold = threshold;
    }

    /// Caps the bytes inlined into a work request.
    pub fn set_inline_mode(&mut self, inline_mode: usize) -> Result<(), Fail> {
        if inline_mode > MAX_INLINE_DATA {
            return Err(Fail::new(libc::EINVAL, "inline mode above the device maximum"));
        }
        self.inline_mode = inline_mode;
        Ok(())
    }

    /// Allocates and registers one more transmit pool for this thread.
    pub fn add_memory_pool(&mut self, buf_size: usize, min_elts: usize) -> Result<(), Fail> {
        let params: MempoolAllocationParams = tx_pool_params(buf_size, min_elts)?;
        self.thread_context.add_tx_pool(&params, false)
    }

    /// Transmits `msg_ids.len()` ordered scatter-gather messages. One
    /// doorbell covers the whole burst; completions are polled once after
    /// posting.
    pub fn push_ordered_sgas(
        &mut self,
        msg_ids: &[u32],
        conn_ids: &[usize],
        sgas: &[OrderedSga],
    ) -> Result<(), Fail> {
        if msg_ids.len() != conn_ids.len() || msg_ids.len() != sgas.len() {
            return Err(Fail::new(libc::EINVAL, "id and sga arrays must have equal length"));
        }
        let our_eth: MacAddress = self.global_context.our_eth();
        let mut first_ctrl: *mut Mlx5WqeCtrlSeg = ptr::null_mut();
        for i in 0..msg_ids.len() {
            let header: [u8; FRAME_HEADER_LEN] = build_frame_header(our_eth, msg_ids[i], conn_ids[i]);
            let (ctrl, posted_pending) = self.push_one(&header, &sgas[i], first_ctrl)?;
            if posted_pending || first_ctrl.is_null() {
                // this transmission opens the next doorbell
                first_ctrl = ctrl;
            }
        }
        let (txq, pools) = self.thread_context.txq_and_pools();
        txq.post_transmissions(first_ctrl)?;
        txq.process_completions(COMPLETION_BUDGET, pools)?;
        Ok(())
    }

    /// Builds and seals one transmission. Returns its control segment and
    /// whether the burst's pending work had to be posted to make room, in
    /// which case this transmission starts the next doorbell.
    fn push_one(
        &mut self,
        header: &[u8; FRAME_HEADER_LEN],
        sga: &OrderedSga,
        pending_ctrl: *mut Mlx5WqeCtrlSeg,
    ) -> Result<(*mut Mlx5WqeCtrlSeg, bool), Fail> {
        let copying_threshold: usize = self.copying_threshold;
        let inline_len: usize = if header.len() <= self.inline_mode {
            header.len()
        } else {
            0
        };
        let (txq, pools) = self.thread_context.txq_and_pools();

        // plan the data segments: header first unless inlined, then each
        // scatter-gather segment, coalescing adjacent copies into one
        // transmit buffer
        let mut plan: Vec<PlannedSeg> = Vec::with_capacity(sga.num_segs() + 1);
        let mut run: Option<(NonNull<Mbuf>, usize)> = None;
        if inline_len == 0 {
            append_to_run(pools, &mut plan, &mut run, &header[..])?;
        }
        for seg in sga.segments() {
            let bytes: &[u8] = unsafe { std::slice::from_raw_parts(seg.addr as *const u8, seg.len) };
            if seg.len > copying_threshold {
                if let Some(mbuf) = pools.recover_mbuf(bytes.as_ptr()) {
                    flush_run(&mut plan, &mut run);
                    let m: *mut Mbuf = mbuf.as_ptr();
                    let data_off: usize =
                        bytes.as_ptr() as usize - unsafe { (*m).buf_addr() as usize + (*m).offset() };
                    plan.push(PlannedSeg {
                        mbuf: m,
                        data_off,
                        len: seg.len,
                    });
                    continue;
                }
            }
            // below the threshold, or bytes the pools do not own
            append_to_run(pools, &mut plan, &mut run, bytes)?;
        }
        flush_run(&mut plan, &mut run);

        let num_segs: usize = plan.len();
        let octowords: usize = num_octowords(inline_len, num_segs);
        let num_wqes: usize = num_wqes_required(octowords);
        if num_wqes as u32 > txq.wqe_cnt() {
            release_plan(pools, &plan);
            return Err(Fail::new(libc::EMSGSIZE, "message needs more slots than the ring has"));
        }
        let mut posted_pending: bool = false;
        if !txq.tx_descriptors_available(num_wqes) {
            // publish what the burst built so far, then wait for room
            txq.post_transmissions(pending_ctrl)?;
            posted_pending = true;
            while !txq.tx_descriptors_available(num_wqes) {
                txq.process_completions(COMPLETION_BUDGET, pools)?;
            }
        }

        let ctrl: *mut Mlx5WqeCtrlSeg = match txq.fill_in_hdr_segment(
            octowords,
            num_wqes,
            inline_len,
            num_segs,
            MLX5_ETH_WQE_L3_CSUM | MLX5_ETH_WQE_L4_CSUM,
        ) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                release_plan(pools, &plan);
                return Err(e);
            },
        };
        if inline_len > 0 {
            txq.copy_inline_data(0, &header[..], inline_len);
        }
        let mut dpseg = txq.dpseg_start(inline_len);
        let mut completion = txq.completion_start();
        for seg in &plan {
            dpseg = txq.add_dpseg(dpseg, seg.mbuf, seg.data_off, seg.len);
            completion = txq.add_completion_info(completion, seg.mbuf);
        }
        txq.finish_single_transmission(num_wqes);
        Ok((ctrl, posted_pending))
    }

    /// Drains received packets. The returned slice lives inside the
    /// connection and is valid until the next call, which releases the
    /// previous batch's buffers.
    pub fn pop(&mut self) -> Result<&[ReceivedPkt], Fail> {
        {
            let pools: &mut MempoolTable = self.thread_context.pools_mut();
            for mbuf in self.pending_pop.drain(..) {
                pools.mbuf_refcnt_update_or_free(mbuf, -1);
            }
        }
        self.received.clear();
        self.thread_context.process_completions()?;
        let mut batch: ArrayVec<NonNull<Mbuf>, RECEIVE_BATCH_SIZE> = ArrayVec::new();
        self.thread_context.gather_rx(&mut batch)?;
        let pools: &mut MempoolTable = self.thread_context.pools_mut();
        for mbuf in batch {
            let m: *mut Mbuf = mbuf.as_ptr();
            let data_len: usize = unsafe { (*m).data_len() };
            if data_len < FRAME_HEADER_LEN {
                warn!("dropping runt frame of {} bytes", data_len);
                pools.mbuf_refcnt_update_or_free(m, -1);
                continue;
            }
            let frame: &[u8] = unsafe { std::slice::from_raw_parts((*m).offset_ptr(0), data_len) };
            if NetworkEndian::read_u16(&frame[12..14]) != FRAME_ETHER_TYPE {
                trace!("dropping frame with foreign ether type");
                pools.mbuf_refcnt_update_or_free(m, -1);
                continue;
            }
            let msg_id: u32 = NetworkEndian::read_u32(&frame[FRAME_MSG_ID_OFFSET..FRAME_MSG_ID_OFFSET + 4]);
            let conn_id: u32 = NetworkEndian::read_u32(&frame[FRAME_CONN_ID_OFFSET..FRAME_CONN_ID_OFFSET + 4]);
            self.received.push(ReceivedPkt {
                data: unsafe { (*m).offset_ptr(FRAME_HEADER_LEN) },
                data_len: data_len - FRAME_HEADER_LEN,
                msg_id,
                conn_id: conn_id as usize,
            });
            self.pending_pop.push(m);
        }
        Ok(&self.received)
    }

    /// Tears the connection down. Buffers still referenced by transmissions
    /// in flight or by the application make this fail.
    pub fn teardown(mut self) -> Result<(), Fail> {
        {
            let pools: &mut MempoolTable = self.thread_context.pools_mut();
            for mbuf in self.pending_pop.drain(..) {
                pools.mbuf_refcnt_update_or_free(mbuf, -1);
            }
        }
        self.thread_context.process_completions()?;
        self.thread_context.teardown()
    }
}

/// Copies `bytes` into the current transmit-buffer run, starting a fresh
/// buffer when there is none or the current one is full.
fn append_to_run(
    pools: &mut MempoolTable,
    plan: &mut Vec<PlannedSeg>,
    run: &mut Option<(NonNull<Mbuf>, usize)>,
    mut bytes: &[u8],
) -> Result<(), Fail> {
    while !bytes.is_empty() {
        let full: bool = match run {
            Some((mbuf, written)) => *written >= unsafe { (*mbuf.as_ptr()).data_buf_len() },
            None => true,
        };
        if full {
            flush_run(plan, run);
            // prefer a buffer that takes the rest in one piece
            let mbuf: NonNull<Mbuf> = match pools.alloc_tx_mbuf(bytes.len())? {
                Some(mbuf) => mbuf,
                None => pools
                    .alloc_tx_mbuf(1)?
                    .ok_or_else(|| Fail::new(libc::ENOMEM, "transmit pools exhausted"))?,
            };
            *run = Some((mbuf, 0));
        }
        let (mbuf, written) = run.as_mut().unwrap();
        let capacity: usize = unsafe { (*mbuf.as_ptr()).data_buf_len() } - *written;
        let chunk: usize = bytes.len().min(capacity);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), (*mbuf.as_ptr()).buf_addr().add(*written), chunk);
        }
        *written += chunk;
        bytes = &bytes[chunk..];
    }
    Ok(())
}

/// Seals the current run into the plan as one data segment.
fn flush_run(plan: &mut Vec<PlannedSeg>, run: &mut Option<(NonNull<Mbuf>, usize)>) {
    if let Some((mbuf, written)) = run.take() {
        unsafe { (*mbuf.as_ptr()).set_data_len(written) };
        plan.push(PlannedSeg {
            mbuf: mbuf.as_ptr(),
            data_off: 0,
            len: written,
        });
    }
}

/// Drops the references a failed plan was holding.
fn release_plan(pools: &mut MempoolTable, plan: &[PlannedSeg]) {
    for seg in plan {
        pools.mbuf_refcnt_update_or_free(seg.mbuf, -1);
    }
}
