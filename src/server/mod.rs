// src/server/mod.rs
//! Server module for the tunnel server.
//!
//! This module provides the accept loop, the per-client tunnel, and the
//! TCP, UDP and IP flows multiplexed over a control connection.

pub mod connection;
pub mod core;
pub mod outbox;
pub mod packet;
pub mod tcp;
pub mod tunnel;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use self::core::{ServerContext, ServerError, ServerState, TunnelHandle, TunnelServer};
pub use connection::{FlowEvent, FlowEventKind, FlowHandler, FlowState};
pub use outbox::Outbox;
pub use tunnel::ServerTunnel;
