// src/config/constants.rs
//! Protocol constants and fixed settings.
//!
//! This module contains fixed values that are used throughout the server,
//! such as message limits, buffer sizes and timeouts. Both ends of a control
//! connection must agree on the protocol limits.

use std::time::Duration;

/// Protocol constants
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024; // 128KB, header included
pub const LENGTH_HEADER_SIZE: usize = 4;
pub const MAX_PACKETS_PER_MESSAGE: usize = 32;

/// Virtual interface constants
pub const PACKET_BUFFER_SIZE: usize = 8192;
pub const PROTOCOL_HEADER_SIZE: usize = 4;
pub const TUN_MTU: u16 = 1500;
pub const HOST_NETMASK: &str = "255.255.255.255";

/// Flow constants
pub const TCP_READ_CHUNK: usize = 8192;
pub const UDP_RECV_BUFFER_SIZE: usize = 65536;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Control connection read buffer
pub const CONTROL_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Accept loop back-off after a failed accept
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Batches are flushed early once their raw size passes this mark, leaving
/// room for base64 expansion inside a single message.
pub const PACKET_BATCH_BYTE_LIMIT: usize = MAX_MESSAGE_SIZE / 2;
