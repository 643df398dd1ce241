// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The send and receive halves of a queue pair. Each queue is owned by
//! exactly one thread and busy-polled; nothing here blocks.

pub mod rxq;
pub mod txq;

pub use self::{
    rxq::Mlx5Rxq,
    txq::Mlx5Txq,
};

//==============================================================================
// Constants
//==============================================================================

/// Depth of the receive work queue.
pub const RQ_NUM_DESC: u32 = 1024;

/// Depth of the send work queue.
pub const SQ_NUM_DESC: u32 = 128;

/// Largest number of packets one drain call hands back.
pub const RECEIVE_BATCH_SIZE: usize = 32;

/// Completions retired per poll of the send completion queue.
pub const COMPLETION_BUDGET: usize = 32;
