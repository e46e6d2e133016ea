// src/network/mod.rs
//! Network module for the tunnel server.
//!
//! This module provides the virtual address pool, TUN interface creation
//! and the host resolver defaults.

pub mod dns;
pub mod ip_pool;
pub mod tun;

// Re-export commonly used items
pub use ip_pool::AddressPool;
pub use self::tun::{FrameHeader, InterfaceProvider, PacketDevice, TunError, TunInterfaceProvider};
