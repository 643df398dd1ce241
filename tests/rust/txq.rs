// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::byteorder::{
    BigEndian,
    ByteOrder,
};
use ::mlx5_datapath::{
    device::{
        emulated::EmulatedDevice,
        Mlx5DirectDevice,
        ACCESS_LOCAL_WRITE,
    },
    memory::{
        mbuf::{
            Mbuf,
            PoolId,
            FIRST_TX_POOL_ID,
        },
        mem::PGSIZE_4KB,
        registered::{
            MempoolTable,
            RegisteredMempool,
        },
        sizes::MempoolAllocationParams,
    },
    queues::txq::{
        num_octowords,
        num_wqes_required,
        Mlx5Txq,
    },
    wire::Mlx5WqeCtrlSeg,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::ptr::NonNull;

const SQ_DEPTH: u32 = 128;
const RING_LEN: usize = SQ_DEPTH as usize * 64;

fn setup() -> (EmulatedDevice, MempoolTable, Mlx5Txq, *mut u32) {
    let mut device = EmulatedDevice::new();
    let rx_params = MempoolAllocationParams::new(1024, PGSIZE_4KB, 2048, 256 * 1024).unwrap();
    let mut pools = MempoolTable::new(&mut device, &rx_params, ACCESS_LOCAL_WRITE).unwrap();
    let tx_params = MempoolAllocationParams::new(256, PGSIZE_4KB, 2048, 512 * 1024).unwrap();
    let tx_pool = RegisteredMempool::create(&mut device, &tx_params, ACCESS_LOCAL_WRITE, false, true).unwrap();
    pools.add_tx_pool(tx_pool).unwrap();
    let resources = device.create_txq(SQ_DEPTH).unwrap();
    let sq_dbrec = resources.sq_dbrec;
    let txq = Mlx5Txq::new(resources);
    (device, pools, txq, sq_dbrec)
}

fn tx_pool_allocated(pools: &mut MempoolTable) -> usize {
    pools
        .get_mut(PoolId::from(FIRST_TX_POOL_ID))
        .unwrap()
        .data()
        .allocated()
}

fn alloc_filled_mbuf(pools: &mut MempoolTable, fill: u8, len: usize) -> *mut Mbuf {
    let mbuf: NonNull<Mbuf> = pools.alloc_tx_mbuf(len).unwrap().unwrap();
    unsafe {
        std::ptr::write_bytes((*mbuf.as_ptr()).buf_addr(), fill, len);
        (*mbuf.as_ptr()).set_data_len(len);
    }
    mbuf.as_ptr()
}

/// Builds and seals one transmission over `mbufs` with `inline` bytes
/// inlined, returning its control segment.
fn transmit_one(txq: &mut Mlx5Txq, mbufs: &[*mut Mbuf], inline: &[u8]) -> *mut Mlx5WqeCtrlSeg {
    let octowords = num_octowords(inline.len(), mbufs.len());
    let num_wqes = num_wqes_required(octowords);
    assert!(txq.tx_descriptors_available(num_wqes));
    let ctrl = txq
        .fill_in_hdr_segment(octowords, num_wqes, inline.len(), mbufs.len(), 0)
        .unwrap();
    if !inline.is_empty() {
        txq.copy_inline_data(0, inline, inline.len());
    }
    let mut dpseg = txq.dpseg_start(inline.len());
    let mut completion = txq.completion_start();
    for &m in mbufs {
        let len = unsafe { (*m).data_len() };
        dpseg = txq.add_dpseg(dpseg, m, 0, len);
        completion = txq.add_completion_info(completion, m);
    }
    txq.finish_single_transmission(num_wqes);
    ctrl
}

#[test]
fn single_transmission_retires_cleanly() {
    let (mut device, mut pools, mut txq, sq_dbrec) = setup();
    let qid = txq.queue_id();
    let m = alloc_filled_mbuf(&mut pools, 0xab, 1000);
    assert_eq!(tx_pool_allocated(&mut pools), 1);

    let ctrl = transmit_one(&mut txq, &[m], &[]);
    let num_wqes = num_wqes_required(num_octowords(0, 1));
    assert_eq!(txq.nr_inflight(), num_wqes as u32);
    txq.post_transmissions(ctrl).unwrap();
    // the doorbell record carries the new producer index
    let posted = u32::from_be(unsafe { std::ptr::read_volatile(sq_dbrec.add(1)) });
    assert_eq!(posted, txq.sq_head() & 0xffff);

    assert_eq!(device.process_transmissions(qid).unwrap(), 1);
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 1);
    assert_eq!(txq.nr_inflight(), 0);
    // the completion dropped the transmission's reference and the buffer
    // went home
    assert_eq!(tx_pool_allocated(&mut pools), 0);
}

#[test]
fn refcount_handoff_across_three_transmissions() {
    let (mut device, mut pools, mut txq, _) = setup();
    let qid = txq.queue_id();
    let m = alloc_filled_mbuf(&mut pools, 0x11, 512);
    unsafe { (*m).refcnt_update(2) };
    assert_eq!(unsafe { (*m).refcnt_read() }, 3);

    let heads: Vec<u16> = (0..3)
        .map(|_| {
            let head = txq.sq_head() as u16;
            let ctrl = transmit_one(&mut txq, &[m], &[]);
            txq.post_transmissions(ctrl).unwrap();
            head
        })
        .collect();

    device.complete_tx(qid, heads[0]).unwrap();
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 1);
    assert_eq!(unsafe { (*m).refcnt_read() }, 2);
    device.complete_tx(qid, heads[1]).unwrap();
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 1);
    assert_eq!(unsafe { (*m).refcnt_read() }, 1);
    device.complete_tx(qid, heads[2]).unwrap();
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 1);
    // last reference gone: both slots are back in their pools
    assert_eq!(tx_pool_allocated(&mut pools), 0);
    let pool = pools.get_mut(PoolId::from(FIRST_TX_POOL_ID)).unwrap();
    assert_eq!(pool.metadata().allocated(), 0);
}

#[test]
fn error_completion_releases_the_group() {
    let (mut device, mut pools, mut txq, _) = setup();
    let qid = txq.queue_id();
    let m = alloc_filled_mbuf(&mut pools, 0x22, 256);
    let head = txq.sq_head() as u16;
    let ctrl = transmit_one(&mut txq, &[m], &[]);
    let num_wqes = txq.nr_inflight();
    txq.post_transmissions(ctrl).unwrap();

    device.fail_tx(qid, head, 0x05).unwrap();
    let true_before = txq.true_cq_head();
    assert_eq!(txq.process_completions(1, &mut pools).unwrap(), 1);
    assert_eq!(txq.tx_err(), 1);
    assert_eq!(txq.true_cq_head(), true_before.wrapping_add(num_wqes));
    assert_eq!(tx_pool_allocated(&mut pools), 0);
}

#[test]
fn straddling_transmission_wraps_inline_bytes() {
    let (mut device, mut pools, mut txq, _) = setup();
    let qid = txq.queue_id();

    // park the head on the last slot of the ring
    let mut first: *mut Mlx5WqeCtrlSeg = std::ptr::null_mut();
    for _ in 0..127 {
        let ctrl = transmit_one(&mut txq, &[], &[]);
        if first.is_null() {
            first = ctrl;
        }
    }
    txq.post_transmissions(first).unwrap();
    assert_eq!(device.process_transmissions(qid).unwrap(), 127);
    assert_eq!(txq.process_completions(SQ_DEPTH as usize, &mut pools).unwrap(), 127);
    assert_eq!(txq.sq_head(), 127);
    assert_eq!(txq.nr_inflight(), 0);

    let inline: Vec<u8> = (0..50u8).collect();
    let mbufs: Vec<*mut Mbuf> = (0..3)
        .map(|i| alloc_filled_mbuf(&mut pools, 0x30 + i, 600))
        .collect();
    let octowords = num_octowords(inline.len(), mbufs.len());
    assert_eq!(num_wqes_required(octowords), 2);
    let ctrl = transmit_one(&mut txq, &mbufs, &inline);

    // the first two inline bytes live in the ethernet segment; the packed
    // bytes run to the ring end and continue at the base
    let ring = txq.work_request_ring();
    let inline_start = 127 * 64 + 30;
    assert_eq!(&ring[inline_start..inline_start + 2], &inline[0..2]);
    assert_eq!(&ring[inline_start + 2..RING_LEN], &inline[2..34]);
    assert_eq!(&ring[0..16], &inline[34..50]);

    // the first data segment starts 16-byte aligned just past the wrapped
    // inline bytes
    let byte_count = BigEndian::read_u32(&ring[16..20]);
    let addr = BigEndian::read_u64(&ring[24..32]);
    assert_eq!(byte_count as usize, 600);
    assert_eq!(addr, unsafe { (*mbufs[0]).buf_addr() } as u64);

    txq.post_transmissions(ctrl).unwrap();
    assert_eq!(device.process_transmissions(qid).unwrap(), 1);
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 1);
    // the group spanned two slots and held three buffers
    assert_eq!(txq.true_cq_head(), 129);
    assert_eq!(txq.nr_inflight(), 0);
    assert_eq!(tx_pool_allocated(&mut pools), 0);
}

#[test]
fn completion_budget_bounds_the_drain() {
    let (mut device, mut pools, mut txq, _) = setup();
    let qid = txq.queue_id();
    let mut first: *mut Mlx5WqeCtrlSeg = std::ptr::null_mut();
    for i in 0..3 {
        let m = alloc_filled_mbuf(&mut pools, i as u8, 128);
        let ctrl = transmit_one(&mut txq, &[m], &[]);
        if first.is_null() {
            first = ctrl;
        }
    }
    txq.post_transmissions(first).unwrap();
    assert_eq!(device.process_transmissions(qid).unwrap(), 3);
    assert_eq!(txq.process_completions(1, &mut pools).unwrap(), 1);
    assert_eq!(txq.process_completions(32, &mut pools).unwrap(), 2);
    assert_eq!(tx_pool_allocated(&mut pools), 0);
}

#[test]
fn inflight_bounded_across_many_wraps() {
    let (mut device, mut pools, mut txq, _) = setup();
    let qid = txq.queue_id();
    let mut rng = SmallRng::seed_from_u64(0xdada);
    let mut pending: *mut Mlx5WqeCtrlSeg = std::ptr::null_mut();
    for _ in 0..2000 {
        if txq.tx_descriptors_available(1) && rng.gen_bool(0.7) {
            let ctrl = transmit_one(&mut txq, &[], &[]);
            if pending.is_null() {
                pending = ctrl;
            }
        } else {
            txq.post_transmissions(pending).unwrap();
            pending = std::ptr::null_mut();
            device.process_transmissions(qid).unwrap();
            txq.process_completions(64, &mut pools).unwrap();
        }
        let inflight = txq.sq_head().wrapping_sub(txq.true_cq_head());
        assert!(inflight <= txq.wqe_cnt());
    }
}
