// src/config/defaults.rs
//! Default configurations for the tunnel server.
//!
//! This module provides default values for command line settings
//! when not explicitly specified by the user.

/// Default listen address (the port always comes from the command line)
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default MTU for virtual interfaces
pub const DEFAULT_TUN_MTU: u16 = crate::config::constants::TUN_MTU;

/// Resolver configuration consulted for DNS defaults
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
