// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Kernel-bypass packet datapath driving an mlx5-class NIC through its
//! direct-verbs queue interface: registered memory pools, zero-copy
//! transmit work-request construction, and a busy-polled receive loop.

#[macro_use]
extern crate log;

//==============================================================================
// Exports
//==============================================================================

pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod fail;
pub mod interop;
pub mod logging;
pub mod macaddr;
pub mod memory;
pub mod queues;
pub mod sga;
pub mod wire;

pub use self::{
    connection::Mlx5Connection,
    context::{
        Mlx5GlobalContext,
        Mlx5PerThreadContext,
    },
    fail::Fail,
};
