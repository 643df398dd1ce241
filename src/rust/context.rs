// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Global and per-thread datapath state. The global context owns the device
//! hooks and is created first and dropped last; each per-thread context
//! borrows it for the lifetime of its queues and pools.

//==============================================================================
// Imports
//==============================================================================

use crate::{
    device::{
        Mlx5DirectDevice,
        ACCESS_LOCAL_WRITE,
    },
    fail::Fail,
    macaddr::MacAddress,
    memory::{
        mbuf::Mbuf,
        registered::{
            MempoolTable,
            RegisteredMempool,
        },
        sizes::MempoolAllocationParams,
    },
    queues::{
        Mlx5Rxq,
        Mlx5Txq,
        COMPLETION_BUDGET,
        RECEIVE_BATCH_SIZE,
        RQ_NUM_DESC,
        SQ_NUM_DESC,
    },
};
use ::arrayvec::ArrayVec;
use ::std::{
    cell::{
        RefCell,
        RefMut,
    },
    ptr::NonNull,
    rc::Rc,
};

//==============================================================================
// Structures
//==============================================================================

/// Process-wide datapath root: device handle, protection domain and
/// steering state live behind the device hooks; the link address and thread
/// count live here.
pub struct Mlx5GlobalContext {
    device: RefCell<Box<dyn Mlx5DirectDevice>>,
    our_eth: MacAddress,
    num_threads: usize,
}

/// State pinned to one datapath thread: its queue pair and its pool table.
pub struct Mlx5PerThreadContext {
    thread_id: usize,
    global_context: Rc<Mlx5GlobalContext>,
    rxq: Mlx5Rxq,
    txq: Mlx5Txq,
    pools: MempoolTable,
}

//==============================================================================
// Associate Functions
//==============================================================================

impl Mlx5GlobalContext {
    pub fn new(device: Box<dyn Mlx5DirectDevice>, our_eth: MacAddress, num_threads: usize) -> Result<Self, Fail> {
        if num_threads == 0 {
            return Err(Fail::new(libc::EINVAL, "need at least one datapath thread"));
        }
        Ok(Self {
            device: RefCell::new(device),
            our_eth,
            num_threads,
        })
    }

    #[inline]
    pub fn device_mut(&self) -> RefMut<Box<dyn Mlx5DirectDevice>> {
        self.device.borrow_mut()
    }

    #[inline]
    pub fn our_eth(&self) -> MacAddress {
        self.our_eth
    }

    #[inline]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Points the steering tables at the created receive queues. Called once
    /// all per-thread contexts exist.
    pub fn install_flow_steering(&self) -> Result<(), Fail> {
        self.device.borrow_mut().install_flow_steering(self.our_eth, self.num_threads)
    }
}

impl Mlx5PerThreadContext {
    /// Brings up one thread's datapath state: receive pool table first, then
    /// the receive and send queues, then a full ring of posted buffers.
    pub fn new(
        global_context: Rc<Mlx5GlobalContext>,
        thread_id: usize,
        rx_params: &MempoolAllocationParams,
    ) -> Result<Self, Fail> {
        if thread_id >= global_context.num_threads() {
            return Err(Fail::new(libc::EINVAL, "thread id out of range"));
        }
        let (mut pools, rxq, txq) = {
            let mut device: RefMut<Box<dyn Mlx5DirectDevice>> = global_context.device_mut();
            let pools: MempoolTable = MempoolTable::new(device.as_mut(), rx_params, ACCESS_LOCAL_WRITE)?;
            let rxq: Mlx5Rxq = Mlx5Rxq::new(device.create_rxq(RQ_NUM_DESC)?);
            let txq: Mlx5Txq = Mlx5Txq::new(device.create_txq(SQ_NUM_DESC)?);
            (pools, rxq, txq)
        };
        let mut rxq: Mlx5Rxq = rxq;
        rxq.refill(RQ_NUM_DESC as usize, &mut pools)?;
        debug!("thread {} brought up with a full receive ring", thread_id);
        Ok(Self {
            thread_id,
            global_context,
            rxq,
            txq,
            pools,
        })
    }

    #[inline]
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    #[inline]
    pub fn global_context(&self) -> &Rc<Mlx5GlobalContext> {
        &self.global_context
    }

    #[inline]
    pub fn rxq(&self) -> &Mlx5Rxq {
        &self.rxq
    }

    #[inline]
    pub fn txq(&self) -> &Mlx5Txq {
        &self.txq
    }

    #[inline]
    pub fn txq_mut(&mut self) -> &mut Mlx5Txq {
        &mut self.txq
    }

    #[inline]
    pub fn pools(&self) -> &MempoolTable {
        &self.pools
    }

    #[inline]
    pub fn pools_mut(&mut self) -> &mut MempoolTable {
        &mut self.pools
    }

    /// Splits the send queue from the pool table so transmit construction
    /// can borrow both at once.
    #[inline]
    pub fn txq_and_pools(&mut self) -> (&mut Mlx5Txq, &mut MempoolTable) {
        (&mut self.txq, &mut self.pools)
    }

    /// Drains up to one batch of received packets.
    pub fn gather_rx(&mut self, out: &mut ArrayVec<NonNull<Mbuf>, RECEIVE_BATCH_SIZE>) -> Result<usize, Fail> {
        self.rxq.gather_rx(out, RECEIVE_BATCH_SIZE, &mut self.pools)
    }

    /// Retires send completions, releasing borrowed buffers.
    pub fn process_completions(&mut self) -> Result<usize, Fail> {
        self.txq.process_completions(COMPLETION_BUDGET, &mut self.pools)
    }

    /// Allocates, registers and installs one more transmit pool for this
    /// thread. The per-thread pool count is bounded.
    pub fn add_tx_pool(&mut self, params: &MempoolAllocationParams, use_atomic_ops: bool) -> Result<(), Fail> {
        let pool: RegisteredMempool = {
            let mut device: RefMut<Box<dyn Mlx5DirectDevice>> = self.global_context.device_mut();
            RegisteredMempool::create(device.as_mut(), params, ACCESS_LOCAL_WRITE, use_atomic_ops, true)?
        };
        self.pools.add_tx_pool(pool)?;
        Ok(())
    }

    /// Tears this thread's state down: posted receive buffers come back,
    /// then every pool is deregistered and released. Buffers still held by
    /// the application make this fail.
    pub fn teardown(self) -> Result<(), Fail> {
        let Self {
            global_context,
            mut rxq,
            mut pools,
            ..
        } = self;
        rxq.release_posted(&mut pools);
        let mut device: RefMut<Box<dyn Mlx5DirectDevice>> = global_context.device_mut();
        pools.destroy(device.as_mut())
    }
}
