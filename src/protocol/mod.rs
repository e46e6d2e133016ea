// src/protocol/mod.rs
//! Protocol module for the tunnel server.
//!
//! This module defines the control messages exchanged with clients, their
//! framing on the control stream, and request validation.

pub mod serialization;
pub mod types;
pub mod validation;

// Re-export commonly used items
pub use serialization::TunnelCodec;
pub use types::{
    CloseDirection, CommandType, FlowKind, Message, MessageError, ResultCode, TunnelLayer,
};
pub use validation::{parse_request, OpenTarget, TunnelRequest};
