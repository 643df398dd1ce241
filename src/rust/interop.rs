// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Foreign-function surface. Failures never unwind across the boundary:
//! they come back as null handles, zero counts or skipped operations, with
//! the cause logged.

#![allow(non_camel_case_types)]

//==============================================================================
// Imports
//==============================================================================

use crate::{
    connection::Mlx5Connection,
    sga::OrderedSga,
};
use ::libc::{
    c_char,
    c_void,
};
use ::std::{
    ffi::CStr,
    ptr,
};

//==============================================================================
// Structures
//==============================================================================

/// One received message as seen by the layer above. `data` points into the
/// receive pool and stays valid until the next pop on the same connection.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReceivedPkt {
    pub data: *const u8,
    pub data_len: usize,
    pub msg_id: u32,
    pub conn_id: usize,
}

//==============================================================================
// Standalone Functions
//==============================================================================

unsafe fn connection<'a>(conn: *mut c_void) -> Option<&'a mut Mlx5Connection> {
    (conn as *mut Mlx5Connection).as_mut()
}

/// Allocates a block of `size` scatter-gather descriptors.
#[no_mangle]
pub extern "C" fn OrderedSga_allocate(size: usize, return_ptr: *mut *mut c_void) {
    if return_ptr.is_null() {
        return;
    }
    let block: *mut OrderedSga = OrderedSga::allocate(size);
    unsafe { *return_ptr = block as *mut c_void };
}

/// Parses the configuration and brings the datapath up. Returns a null
/// handle on failure.
#[no_mangle]
pub extern "C" fn Mlx5Connection_new(config_file: *const c_char, server_ip: *const c_char) -> *mut c_void {
    if config_file.is_null() || server_ip.is_null() {
        return ptr::null_mut();
    }
    let config_file: &str = match unsafe { CStr::from_ptr(config_file) }.to_str() {
        Ok(s) => s,
        Err(_) => return ptr::null_mut(),
    };
    let server_ip: &str = match unsafe { CStr::from_ptr(server_ip) }.to_str() {
        Ok(s) => s,
        Err(_) => return ptr::null_mut(),
    };
    match Mlx5Connection::new(config_file, server_ip) {
        Ok(conn) => Box::into_raw(Box::new(conn)) as *mut c_void,
        Err(e) => {
            error!("could not bring up connection: {:?}", e);
            ptr::null_mut()
        },
    }
}

#[no_mangle]
pub extern "C" fn Mlx5Connection_set_copying_threshold(conn: *mut c_void, copying_threshold: usize) {
    if let Some(conn) = unsafe { connection(conn) } {
        conn.set_copying_threshold(copying_threshold);
    }
}

#[no_mangle]
pub extern "C" fn Mlx5Connection_set_inline_mode(conn: *mut c_void, inline_mode: usize) {
    if let Some(conn) = unsafe { connection(conn) } {
        if let Err(e) = conn.set_inline_mode(inline_mode) {
            warn!("rejected inline mode {}: {:?}", inline_mode, e);
        }
    }
}

#[no_mangle]
pub extern "C" fn Mlx5Connection_add_memory_pool(conn: *mut c_void, buf_size: usize, min_elts: usize) {
    if let Some(conn) = unsafe { connection(conn) } {
        if let Err(e) = conn.add_memory_pool(buf_size, min_elts) {
            warn!("could not add memory pool of {} x {} bytes: {:?}", min_elts, buf_size, e);
        }
    }
}

/// Drains received messages. Writes the message count through `n` and
/// returns a pointer into the connection that stays valid until the next
/// call; the caller must consume or copy before popping again.
#[no_mangle]
pub extern "C" fn Mlx5Connection_pop(conn: *mut c_void, n: *mut usize) -> *mut ReceivedPkt {
    if n.is_null() {
        return ptr::null_mut();
    }
    unsafe { *n = 0 };
    let conn: &mut Mlx5Connection = match unsafe { connection(conn) } {
        Some(conn) => conn,
        None => return ptr::null_mut(),
    };
    match conn.pop() {
        Ok(pkts) => {
            unsafe { *n = pkts.len() };
            pkts.as_ptr() as *mut ReceivedPkt
        },
        Err(e) => {
            error!("pop failed: {:?}", e);
            ptr::null_mut()
        },
    }
}

/// Transmits `n` ordered scatter-gather messages with their ids.
#[no_mangle]
pub extern "C" fn Mlx5Connection_push_ordered_sgas(
    conn: *mut c_void,
    n: usize,
    msg_ids: *mut u32,
    conn_ids: *mut usize,
    ordered_sgas: *mut c_void,
) {
    if n == 0 || msg_ids.is_null() || conn_ids.is_null() || ordered_sgas.is_null() {
        return;
    }
    if let Some(conn) = unsafe { connection(conn) } {
        let msg_ids: &[u32] = unsafe { std::slice::from_raw_parts(msg_ids, n) };
        let conn_ids: &[usize] = unsafe { std::slice::from_raw_parts(conn_ids, n) };
        let sgas: &[OrderedSga] = unsafe { std::slice::from_raw_parts(ordered_sgas as *const OrderedSga, n) };
        if let Err(e) = conn.push_ordered_sgas(msg_ids, conn_ids, sgas) {
            error!("push failed: {:?}", e);
        }
    }
}

/// Tears the connection down and releases the handle.
#[no_mangle]
pub extern "C" fn Mlx5Connection_teardown(conn: *mut c_void) {
    if conn.is_null() {
        return;
    }
    let conn: Box<Mlx5Connection> = unsafe { Box::from_raw(conn as *mut Mlx5Connection) };
    if let Err(e) = conn.teardown() {
        warn!("teardown left state behind: {:?}", e);
    }
}
