// src/protocol/validation.rs
//! Protocol message validation.
//!
//! This module turns decoded messages into typed requests, checking that
//! each command carries the fields it needs.

use crate::protocol::types::{
    keys, CloseDirection, CommandType, FlowKind, Message, MessageError, TunnelLayer,
};

/// What an `open` asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenTarget {
    /// A TCP stream to a remote endpoint
    Tcp { host: String, port: u16 },
    /// A UDP flow, endpoints given per datagram
    Udp,
    /// The IP-layer flow bridged to a virtual interface
    Ip,
}

/// A validated request from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRequest {
    Open {
        identifier: u64,
        target: OpenTarget,
    },
    Data {
        identifier: u64,
        data: Vec<u8>,
        /// Datagram endpoint, present for UDP flows
        endpoint: Option<(String, u16)>,
    },
    Suspend {
        identifier: u64,
    },
    Resume {
        identifier: u64,
    },
    Close {
        identifier: u64,
        direction: CloseDirection,
    },
    Packets {
        identifier: u64,
        packets: Vec<(u32, Vec<u8>)>,
    },
    OpenResult {
        identifier: u64,
    },
    FetchConfiguration,
}

impl TunnelRequest {
    /// Flow the request is addressed to
    pub fn identifier(&self) -> u64 {
        match self {
            TunnelRequest::Open { identifier, .. }
            | TunnelRequest::Data { identifier, .. }
            | TunnelRequest::Suspend { identifier }
            | TunnelRequest::Resume { identifier }
            | TunnelRequest::Close { identifier, .. }
            | TunnelRequest::Packets { identifier, .. }
            | TunnelRequest::OpenResult { identifier } => *identifier,
            TunnelRequest::FetchConfiguration => 0,
        }
    }
}

/// Validate a message received from a client
pub fn parse_request(message: &Message) -> Result<TunnelRequest, MessageError> {
    let identifier = message
        .identifier()
        .ok_or(MessageError::MissingField(keys::IDENTIFIER))?;
    let code = message
        .command_code()
        .ok_or(MessageError::MissingField(keys::COMMAND_TYPE))?;
    let command = CommandType::from_code(code)
        .ok_or_else(|| MessageError::InvalidValue(format!("unknown command type {}", code)))?;

    let request = match command {
        CommandType::Open => TunnelRequest::Open {
            identifier,
            target: parse_open_target(message)?,
        },
        CommandType::Data => {
            let data = message
                .get_bytes(keys::DATA)?
                .ok_or(MessageError::MissingField(keys::DATA))?;
            let endpoint = match message.get_str(keys::HOST) {
                Some(host) => Some((host.to_string(), parse_port(message)?)),
                None => None,
            };
            TunnelRequest::Data {
                identifier,
                data,
                endpoint,
            }
        }
        CommandType::Suspend => TunnelRequest::Suspend { identifier },
        CommandType::Resume => TunnelRequest::Resume { identifier },
        CommandType::Close => {
            let direction = match message.get_u64(keys::CLOSE_TYPE) {
                Some(code) => CloseDirection::from_code(code).ok_or_else(|| {
                    MessageError::InvalidValue(format!("unknown close type {}", code))
                })?,
                None => CloseDirection::All,
            };
            TunnelRequest::Close {
                identifier,
                direction,
            }
        }
        CommandType::Packets => TunnelRequest::Packets {
            identifier,
            packets: parse_packets(message)?,
        },
        CommandType::OpenResult => TunnelRequest::OpenResult { identifier },
        CommandType::FetchConfiguration => TunnelRequest::FetchConfiguration,
    };

    Ok(request)
}

fn parse_open_target(message: &Message) -> Result<OpenTarget, MessageError> {
    let layer = message
        .get_u64(keys::TUNNEL_LAYER)
        .ok_or(MessageError::MissingField(keys::TUNNEL_LAYER))?;
    let layer = TunnelLayer::from_code(layer)
        .ok_or_else(|| MessageError::InvalidValue(format!("unknown tunnel layer {}", layer)))?;

    if layer == TunnelLayer::Ip {
        return Ok(OpenTarget::Ip);
    }

    let kind = message
        .get_u64(keys::FLOW_KIND)
        .ok_or(MessageError::MissingField(keys::FLOW_KIND))?;
    match FlowKind::from_code(kind) {
        Some(FlowKind::Tcp) => {
            let host = message
                .get_str(keys::HOST)
                .ok_or(MessageError::MissingField(keys::HOST))?;
            Ok(OpenTarget::Tcp {
                host: host.to_string(),
                port: parse_port(message)?,
            })
        }
        Some(FlowKind::Udp) => Ok(OpenTarget::Udp),
        None => Err(MessageError::InvalidValue(format!("unknown flow kind {}", kind))),
    }
}

fn parse_port(message: &Message) -> Result<u16, MessageError> {
    let port = message
        .get_u64(keys::PORT)
        .ok_or(MessageError::MissingField(keys::PORT))?;
    u16::try_from(port).map_err(|_| MessageError::InvalidValue(format!("port {} out of range", port)))
}

fn parse_packets(message: &Message) -> Result<Vec<(u32, Vec<u8>)>, MessageError> {
    let packets = message
        .get(keys::PACKETS)
        .and_then(|v| v.as_array())
        .ok_or(MessageError::MissingField(keys::PACKETS))?;
    let protocols = message
        .get(keys::PROTOCOLS)
        .and_then(|v| v.as_array())
        .ok_or(MessageError::MissingField(keys::PROTOCOLS))?;

    if packets.len() != protocols.len() {
        return Err(MessageError::InvalidValue(format!(
            "{} packets with {} protocols",
            packets.len(),
            protocols.len()
        )));
    }

    packets
        .iter()
        .zip(protocols)
        .map(|(packet, protocol)| {
            let protocol = protocol
                .as_u64()
                .and_then(|p| u32::try_from(p).ok())
                .ok_or_else(|| MessageError::InvalidValue("protocol number".into()))?;
            let packet = packet
                .as_str()
                .ok_or_else(|| MessageError::InvalidValue("packet is not a string".into()))?;
            let packet = base64::decode(packet)
                .map_err(|e| MessageError::InvalidValue(format!("packet: {}", e)))?;
            Ok((protocol, packet))
        })
        .collect()
}
