// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::mlx5_datapath::{
    device::{
        emulated::EmulatedDevice,
        ACCESS_LOCAL_WRITE,
    },
    memory::{
        mbuf::{
            Mbuf,
            PoolId,
            RX_POOL_ID,
        },
        mem::PGSIZE_4KB,
        registered::RegisteredMempool,
        sizes::MempoolAllocationParams,
        Mempool,
    },
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::ptr::NonNull;

const ITEM_LEN: usize = 2048;
const NUM_ITEMS: usize = 1024;
const REGISTRATION_UNIT: usize = 256 * 1024;

fn test_params() -> MempoolAllocationParams {
    MempoolAllocationParams::new(NUM_ITEMS, PGSIZE_4KB, ITEM_LEN, REGISTRATION_UNIT).unwrap()
}

fn free_slot_count(pool: &Mempool) -> usize {
    (0..pool.capacity()).filter(|i| !pool.slot_is_allocated(*i)).count()
}

#[test]
fn allocated_matches_free_table() {
    // invariant: allocated always equals the number of empty table entries
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut held: Vec<*mut u8> = Vec::new();
    for _ in 0..10_000 {
        if rng.gen_bool(0.5) && held.len() < NUM_ITEMS {
            if let Some(item) = pool.alloc() {
                held.push(item.as_ptr());
            }
        } else if let Some(pos) = (!held.is_empty()).then(|| rng.gen_range(0..held.len())) {
            pool.free(held.swap_remove(pos));
        }
        assert_eq!(pool.allocated(), pool.capacity() - free_slot_count(&pool));
        assert_eq!(pool.allocated(), held.len());
    }
    for item in held {
        pool.free(item);
    }
    pool.destroy().unwrap();
}

#[test]
fn alloc_then_free_restores_pool() {
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let mut rng = SmallRng::seed_from_u64(7);
    // start from a randomized occupancy so the restored state is not trivial
    let mut held: Vec<*mut u8> = Vec::new();
    for _ in 0..300 {
        if let Some(item) = pool.alloc() {
            if rng.gen_bool(0.3) {
                pool.free(item.as_ptr());
            } else {
                held.push(item.as_ptr());
            }
        }
    }
    let before: Vec<bool> = (0..pool.capacity()).map(|i| pool.slot_is_allocated(i)).collect();
    let allocated_before = pool.allocated();
    let refcnts_before: Vec<u16> = (0..pool.capacity()).map(|i| pool.refcnt_read(i)).collect();

    let item = pool.alloc().unwrap();
    pool.free(item.as_ptr());

    let after: Vec<bool> = (0..pool.capacity()).map(|i| pool.slot_is_allocated(i)).collect();
    let refcnts_after: Vec<u16> = (0..pool.capacity()).map(|i| pool.refcnt_read(i)).collect();
    assert_eq!(before, after);
    assert_eq!(allocated_before, pool.allocated());
    assert_eq!(refcnts_before, refcnts_after);

    for item in held {
        pool.free(item);
    }
    pool.destroy().unwrap();
}

#[test]
fn find_index_for_every_slot() {
    let pool = Mempool::create(&test_params(), false).unwrap();
    let buf = pool.buf();
    for k in 0..pool.capacity() {
        let item = unsafe { buf.add(k * ITEM_LEN) };
        assert_eq!(pool.find_index(item), Some(k));
    }
    // unaligned and out-of-range pointers resolve to nothing
    assert_eq!(pool.find_index(unsafe { buf.add(1) }), None);
    assert_eq!(pool.find_index(unsafe { buf.add(ITEM_LEN + 7) }), None);
    assert_eq!(pool.find_index(unsafe { buf.add(NUM_ITEMS * ITEM_LEN) }), None);
    assert_eq!(pool.find_index(unsafe { buf.sub(ITEM_LEN) }), None);
    pool.destroy().unwrap();
}

#[test]
fn find_registration_unit_covers_whole_units() {
    let pool = Mempool::create(&test_params(), false).unwrap();
    let buf = pool.buf();
    let mut rng = SmallRng::seed_from_u64(99);
    for u in 0..pool.nr_registrations() {
        for _ in 0..64 {
            let delta: usize = rng.gen_range(0..REGISTRATION_UNIT);
            let addr = unsafe { buf.add(u * REGISTRATION_UNIT + delta) };
            assert_eq!(pool.find_registration_unit(addr), Some(u));
        }
    }
    pool.destroy().unwrap();
}

#[test]
fn refcnt_saturates_and_frees_at_zero() {
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let item = pool.alloc().unwrap();
    let idx = pool.find_index(item.as_ptr()).unwrap();

    pool.refcnt_set(idx, u16::MAX);
    assert_eq!(pool.refcnt_update_or_free(idx, 1), u16::MAX);
    pool.refcnt_set(idx, 3);
    assert_eq!(pool.refcnt_update_or_free(idx, -1), 2);
    assert_eq!(pool.refcnt_update_or_free(idx, -1), 1);
    assert!(pool.slot_is_allocated(idx));
    // the last reference returns the slot
    assert_eq!(pool.refcnt_update_or_free(idx, -1), 0);
    assert!(!pool.slot_is_allocated(idx));
    assert_eq!(pool.allocated(), 0);
    pool.destroy().unwrap();
}

#[test]
fn atomic_refcnt_matches_plain_behavior() {
    let mut pool = Mempool::create(&test_params(), true).unwrap();
    let item = pool.alloc().unwrap();
    let idx = pool.find_index(item.as_ptr()).unwrap();
    pool.refcnt_set(idx, 1);
    assert_eq!(pool.refcnt_update_or_free(idx, 2), 3);
    assert_eq!(pool.refcnt_read(idx), 3);
    assert_eq!(pool.refcnt_update_or_free(idx, -3), 0);
    assert!(!pool.slot_is_allocated(idx));
    pool.destroy().unwrap();
}

#[test]
fn alloc_by_idx_takes_only_free_slots() {
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let item = pool.alloc_by_idx(5).unwrap();
    assert_eq!(pool.find_index(item.as_ptr()), Some(5));
    assert!(pool.alloc_by_idx(5).is_none());
    assert!(pool.alloc_by_idx(NUM_ITEMS).is_none());
    pool.free(item.as_ptr());
    pool.destroy().unwrap();
}

#[test]
fn exhausted_pool_allocs_nothing() {
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let mut held: Vec<*mut u8> = Vec::new();
    while let Some(item) = pool.alloc() {
        held.push(item.as_ptr());
    }
    assert_eq!(held.len(), NUM_ITEMS);
    assert!(pool.alloc().is_none());
    for item in held {
        pool.free(item);
    }
    pool.destroy().unwrap();
}

#[test]
#[should_panic]
fn destroy_with_outstanding_allocation_asserts() {
    let mut pool = Mempool::create(&test_params(), false).unwrap();
    let _leaked = pool.alloc().unwrap();
    // one item is still out; debug builds refuse the teardown
    let _ = pool.destroy();
}

#[test]
fn registered_pool_pairs_data_and_metadata_slots() {
    let mut device = EmulatedDevice::new();
    let mut pool =
        RegisteredMempool::create(&mut device, &test_params(), ACCESS_LOCAL_WRITE, false, true).unwrap();
    let mbuf: NonNull<Mbuf> = pool.alloc_mbuf(RX_POOL_ID).unwrap().unwrap();
    let m = unsafe { mbuf.as_ref() };
    let idx = m.index();
    assert_eq!(pool.data().find_index(m.buf_addr()), Some(idx));
    assert_eq!(pool.mbuf_at(idx), mbuf.as_ptr());
    assert_eq!(m.refcnt_read(), 1);
    assert_eq!(m.data_buf_len(), ITEM_LEN);
    assert!(m.lkey() >= 0);
    pool.free_mbuf(mbuf.as_ptr());
    assert_eq!(pool.data().allocated(), 0);
    assert_eq!(pool.metadata().allocated(), 0);
    pool.destroy(&mut device).unwrap();
}

#[test]
fn unregistered_unit_is_a_precondition_error() {
    let mut device = EmulatedDevice::new();
    let mut pool =
        RegisteredMempool::create(&mut device, &test_params(), ACCESS_LOCAL_WRITE, false, false).unwrap();
    // nothing is registered yet, so handing out DMA-able buffers must fail
    let err = pool.alloc_mbuf(PoolId::from(0)).unwrap_err();
    assert_eq!(err.errno, libc::EINVAL);
    // registering every unit unblocks allocation
    for unit in 0..pool.data().nr_registrations() {
        pool.register_mempool_unit(&mut device, unit, ACCESS_LOCAL_WRITE).unwrap();
    }
    let mbuf = pool.alloc_mbuf(PoolId::from(0)).unwrap().unwrap();
    pool.free_mbuf(mbuf.as_ptr());
    pool.destroy(&mut device).unwrap();
}

#[test]
fn external_buffer_attach_only_manages_metadata() {
    let mut device = EmulatedDevice::new();
    let params = test_params();
    let mut table = mlx5_datapath::memory::registered::MempoolTable::new(
        &mut device,
        &params,
        ACCESS_LOCAL_WRITE,
    )
    .unwrap();
    let mut caller_owned = vec![0xa5u8; 4096];
    let mbuf = table
        .attach_external_buffer(caller_owned.as_mut_ptr(), caller_owned.len(), 0x200)
        .unwrap()
        .unwrap();
    assert_eq!(unsafe { mbuf.as_ref() }.buf_addr(), caller_owned.as_mut_ptr());
    assert_eq!(unsafe { mbuf.as_ref() }.lkey(), 0x200);
    // releasing the mbuf returns only the metadata slot; the bytes stay ours
    assert_eq!(table.mbuf_refcnt_update_or_free(mbuf.as_ptr(), -1), 0);
    assert_eq!(caller_owned[0], 0xa5);
    table.destroy(&mut device).unwrap();
}

#[test]
fn recovered_mbuf_shares_the_live_slot() {
    let mut device = EmulatedDevice::new();
    let mut pool =
        RegisteredMempool::create(&mut device, &test_params(), ACCESS_LOCAL_WRITE, false, true).unwrap();
    let mbuf = pool.alloc_mbuf(RX_POOL_ID).unwrap().unwrap();
    let inner = unsafe { (*mbuf.as_ptr()).buf_addr().add(100) };
    let recovered = pool.recover_mbuf(inner).unwrap();
    assert_eq!(recovered.as_ptr(), mbuf.as_ptr());
    assert_eq!(unsafe { recovered.as_ref() }.refcnt_read(), 2);
    unsafe { (*mbuf.as_ptr()).refcnt_update(-1) };
    pool.free_mbuf(mbuf.as_ptr());
    pool.destroy(&mut device).unwrap();
}
