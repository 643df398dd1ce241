// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use ::arrayvec::ArrayVec;
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};
use ::mlx5_datapath::{
    config::Config,
    connection::{
        Mlx5Connection,
        FRAME_HEADER_LEN,
    },
    device::{
        emulated::EmulatedDevice,
        Mlx5DirectDevice,
        ACCESS_LOCAL_WRITE,
    },
    memory::{
        mbuf::Mbuf,
        mem::PGSIZE_4KB,
        registered::MempoolTable,
        sizes::MempoolAllocationParams,
    },
    queues::{
        Mlx5Rxq,
        RECEIVE_BATCH_SIZE,
    },
    sga::OrderedSga,
};
use ::std::ptr::NonNull;

fn rx_setup(rq_depth: u32, pool_items: usize) -> (EmulatedDevice, MempoolTable, Mlx5Rxq, *mut u32) {
    let mut device = EmulatedDevice::new();
    let rx_params = MempoolAllocationParams::new(pool_items, PGSIZE_4KB, 2048, 256 * 1024).unwrap();
    let mut pools = MempoolTable::new(&mut device, &rx_params, ACCESS_LOCAL_WRITE).unwrap();
    let resources = device.create_rxq(rq_depth).unwrap();
    let wq_dbrec = resources.wq_dbrec;
    let mut rxq = Mlx5Rxq::new(resources);
    rxq.refill(rq_depth as usize, &mut pools).unwrap();
    (device, pools, rxq, wq_dbrec)
}

fn drain(rxq: &mut Mlx5Rxq, pools: &mut MempoolTable) -> Vec<NonNull<Mbuf>> {
    let mut out: ArrayVec<NonNull<Mbuf>, RECEIVE_BATCH_SIZE> = ArrayVec::new();
    rxq.gather_rx(&mut out, RECEIVE_BATCH_SIZE, pools).unwrap();
    out.into_iter().collect()
}

#[test]
fn refill_posts_the_whole_ring() {
    // a pool sized exactly to the ring is fully posted after one refill
    let (_device, pools, rxq, wq_dbrec) = rx_setup(1024, 1024);
    assert_eq!(pools.rx_pool().data().allocated(), 1024);
    assert_eq!(pools.rx_pool().metadata().allocated(), 1024);
    assert_eq!(rxq.wq_head(), 1024);
    let posted = u32::from_be(unsafe { std::ptr::read_volatile(wq_dbrec) });
    assert_eq!(posted, 1024 & 0xffff);
}

#[test]
fn parity_survives_two_full_wraps() {
    let (mut device, mut pools, mut rxq, _) = rx_setup(64, 1024);
    let qid = rxq.queue_id();
    let total: usize = 2 * 64;
    let mut next_expected: u32 = 0;
    let mut delivered: usize = 0;
    while delivered < total {
        let burst: usize = 16.min(total - delivered);
        for i in 0..burst {
            let mut payload = [0u8; 64];
            NetworkEndian::write_u32(&mut payload[0..4], (delivered + i) as u32);
            device.deliver_rx(qid, &payload, 0).unwrap();
        }
        let batch = drain(&mut rxq, &mut pools);
        assert_eq!(batch.len(), burst);
        for mbuf in batch {
            let m = unsafe { mbuf.as_ref() };
            assert_eq!(m.data_len(), 64);
            let seq = NetworkEndian::read_u32(unsafe { std::slice::from_raw_parts(m.offset_ptr(0), 4) });
            // no packet is skipped or seen twice across the wrap
            assert_eq!(seq, next_expected);
            next_expected += 1;
            pools.mbuf_refcnt_update_or_free(mbuf.as_ptr(), -1);
        }
        delivered += burst;
    }
    assert_eq!(next_expected as usize, total);
    // the ring is still fully posted
    assert_eq!(rxq.wq_head(), (64 + total) as u32);
}

#[test]
fn error_completions_count_as_drops_and_refill() {
    let (mut device, mut pools, mut rxq, _) = rx_setup(64, 1024);
    let qid = rxq.queue_id();
    let posted_before = pools.rx_pool().data().allocated();

    device.deliver_rx(qid, b"first", 0).unwrap();
    device.fail_rx(qid, 0x13).unwrap();
    device.deliver_rx(qid, b"second", 0).unwrap();

    let batch = drain(&mut rxq, &mut pools);
    assert_eq!(batch.len(), 2);
    assert_eq!(rxq.rx_hw_drop(), 1);
    for mbuf in batch {
        pools.mbuf_refcnt_update_or_free(mbuf.as_ptr(), -1);
    }
    // dropped and delivered slots alike were reposted
    assert_eq!(pools.rx_pool().data().allocated(), posted_before);
}

#[test]
fn rss_hash_reaches_the_mbuf() {
    let (mut device, mut pools, mut rxq, _) = rx_setup(64, 1024);
    let qid = rxq.queue_id();
    device.deliver_rx(qid, b"hashed", 0xdeadbeef).unwrap();
    let batch = drain(&mut rxq, &mut pools);
    assert_eq!(batch.len(), 1);
    assert_eq!(unsafe { batch[0].as_ref() }.rss_hash(), 0xdeadbeef);
    pools.mbuf_refcnt_update_or_free(batch[0].as_ptr(), -1);
}

//==============================================================================
// Connection-level scenarios
//==============================================================================

fn write_config(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!("mlx5-datapath-{}-{}.yaml", tag, std::process::id()));
    std::fs::write(
        &path,
        "mlx5:\n  pci_addr: \"0000:3b:00.0\"\n  mac_addr: \"b8:ce:f6:04:88:2a\"\n  backend: emulated\n",
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

fn build_inbound_frame(msg_id: u32, conn_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_HEADER_LEN + payload.len()];
    frame[0..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&[0xb8, 0xce, 0xf6, 0x00, 0x00, 0x02]);
    NetworkEndian::write_u16(&mut frame[12..14], 0xcafe);
    NetworkEndian::write_u32(&mut frame[14..18], msg_id);
    NetworkEndian::write_u32(&mut frame[18..22], conn_id);
    frame[FRAME_HEADER_LEN..].copy_from_slice(payload);
    frame
}

#[test]
fn config_reads_datapath_section() {
    let path = write_config("config");
    let config = Config::new(&path).unwrap();
    assert_eq!(config.pci_addr().unwrap(), "0000:3b:00.0");
    assert_eq!(config.backend(), "emulated");
    assert_eq!(config.num_threads(), 1);
    assert_eq!(
        config.local_mac_addr().unwrap().octets(),
        [0xb8, 0xce, 0xf6, 0x04, 0x88, 0x2a]
    );
    assert!(Config::new("/nonexistent/config.yaml").is_err());
}

#[test]
fn connection_round_trip_with_zero_copy_echo() {
    let path = write_config("roundtrip");
    let mut conn = Mlx5Connection::new(&path, "10.0.0.5").unwrap();
    conn.set_inline_mode(64).unwrap();
    let rxq_id = conn.thread_context().rxq().queue_id();
    let txq_id = conn.thread_context().txq().queue_id();

    // inbound request
    let frame = build_inbound_frame(99, 3, b"ping-payload");
    {
        let mut device = conn.global_context().device_mut();
        device
            .as_mut()
            .downcast_mut::<EmulatedDevice>()
            .unwrap()
            .deliver_rx(rxq_id, &frame, 0x1234)
            .unwrap();
    }
    let (data, data_len, msg_id, conn_id) = {
        let pkts = conn.pop().unwrap();
        assert_eq!(pkts.len(), 1);
        (pkts[0].data, pkts[0].data_len, pkts[0].msg_id, pkts[0].conn_id)
    };
    assert_eq!(msg_id, 99);
    assert_eq!(conn_id, 3);
    let payload = unsafe { std::slice::from_raw_parts(data, data_len) };
    assert_eq!(payload, b"ping-payload");

    // echo the popped bytes back without copying them out of the pool
    conn.set_copying_threshold(0);
    let mut sga = OrderedSga::new();
    sga.add_segment(data as *const libc::c_void, data_len).unwrap();
    conn.push_ordered_sgas(&[99], &[3], &[sga]).unwrap();

    // the device sees exactly one transmission; its data segment points
    // into the receive pool (true zero-copy)
    {
        let mut device = conn.global_context().device_mut();
        let emulated = device.as_mut().downcast_mut::<EmulatedDevice>().unwrap();
        assert_eq!(emulated.process_transmissions(txq_id).unwrap(), 1);
    }
    let ring = conn.thread_context().txq().work_request_ring();
    // transmission at slot 0: ctrl + eth + inlined header, then the dpseg
    let dpseg_off = 32 + 32;
    let addr = byteorder::BigEndian::read_u64(&ring[dpseg_off + 8..dpseg_off + 16]);
    assert_eq!(addr, data as u64);

    // next pop retires the transmission and releases the previous batch
    let pkts = conn.pop().unwrap();
    assert_eq!(pkts.len(), 0);
    conn.teardown().unwrap();
}

#[test]
fn copied_push_lands_in_a_transmit_buffer() {
    let path = write_config("copied");
    let mut conn = Mlx5Connection::new(&path, "10.0.0.6").unwrap();
    let txq_id = conn.thread_context().txq().queue_id();

    // below the copying threshold and with inlining off, header and payload
    // are copied into one transmit buffer
    let payload: &[u8] = b"short message";
    let mut sga = OrderedSga::new();
    sga.add_segment(payload.as_ptr() as *const libc::c_void, payload.len()).unwrap();
    conn.push_ordered_sgas(&[7], &[1], &[sga]).unwrap();

    {
        let mut device = conn.global_context().device_mut();
        let emulated = device.as_mut().downcast_mut::<EmulatedDevice>().unwrap();
        assert_eq!(emulated.process_transmissions(txq_id).unwrap(), 1);
    }
    // single data segment carrying header + payload
    let ring = conn.thread_context().txq().work_request_ring();
    let byte_count = byteorder::BigEndian::read_u32(&ring[32..36]) as usize;
    let addr = byteorder::BigEndian::read_u64(&ring[40..48]);
    assert_eq!(byte_count, FRAME_HEADER_LEN + payload.len());
    let sent = unsafe { std::slice::from_raw_parts(addr as *const u8, byte_count) };
    assert_eq!(NetworkEndian::read_u32(&sent[14..18]), 7);
    assert_eq!(NetworkEndian::read_u32(&sent[18..22]), 1);
    assert_eq!(&sent[FRAME_HEADER_LEN..], payload);

    let _ = conn.pop().unwrap();
    conn.teardown().unwrap();
}

#[test]
fn add_memory_pool_bounds_per_thread_pools() {
    let path = write_config("pools");
    let mut conn = Mlx5Connection::new(&path, "10.0.0.7").unwrap();
    // one default pool exists; 63 more fit, the 65th is refused
    for _ in 0..63 {
        conn.add_memory_pool(2048, 64).unwrap();
    }
    let err = conn.add_memory_pool(2048, 64).unwrap_err();
    assert_eq!(err.errno, libc::ENOSPC);
    conn.teardown().unwrap();
}
