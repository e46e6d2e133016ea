// src/network/tun.rs
//! Virtual interface management.
//!
//! This module creates the TUN interfaces that back IP flows and defines the
//! frame layout used on them: every frame starts with a 4-byte header
//! followed by the packet. The header names the address family, either
//! directly or as a Linux ethertype.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::constants::PROTOCOL_HEADER_SIZE;

/// Error type for TUN device operations
#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device creation failed: {0}")]
    Creation(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

/// An open virtual interface: frames are read and written whole
pub trait PacketDevice: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PacketDevice for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Creates a virtual interface for an assigned client address
pub trait InterfaceProvider: Send + Sync {
    fn create(&self, address: Ipv4Addr) -> Result<Box<dyn PacketDevice>, TunError>;

    /// Header layout of the frames on created interfaces
    fn frame_header(&self) -> FrameHeader {
        FrameHeader::Family
    }
}

/// Kernel TUN interfaces
#[derive(Debug, Clone)]
pub struct TunInterfaceProvider {
    /// Interface MTU
    mtu: u16,
}

impl TunInterfaceProvider {
    pub fn new(mtu: u16) -> Self {
        Self { mtu }
    }
}

impl InterfaceProvider for TunInterfaceProvider {
    fn create(&self, address: Ipv4Addr) -> Result<Box<dyn PacketDevice>, TunError> {
        let network = Ipv4Network::new(address, 32)
            .map_err(|e| TunError::InvalidAddress(e.to_string()))?;

        debug!(
            "TUN configuration: IP={}, Mask={}, MTU={}",
            address,
            network.mask(),
            self.mtu
        );

        // Point-to-point interface with the client address on both ends
        let mut config = tun::Configuration::default();
        config
            .address(address)
            .destination(address)
            .netmask(network.mask())
            .mtu(self.mtu as i32)
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|config| {
            config.packet_information(true);
        });

        let device = tun::create_as_async(&config).map_err(|e| {
            let err_str = e.to_string();
            if err_str.contains("permission denied") || err_str.contains("Operation not permitted")
            {
                TunError::PermissionDenied(
                    "Run as root or with CAP_NET_ADMIN to create TUN interfaces".into(),
                )
            } else {
                TunError::Creation(err_str)
            }
        })?;

        info!("TUN interface created for {}/{}", address, network.prefix());
        Ok(Box::new(device))
    }

    fn frame_header(&self) -> FrameHeader {
        FrameHeader::native()
    }
}

/// Address family carried in a `packets` message for IPv4
pub const FAMILY_INET: u32 = 2;
/// Address family carried in a `packets` message for IPv6 (Darwin numbering)
pub const FAMILY_INET6: u32 = 30;
/// Linux numbering for IPv6, accepted from clients as well
const FAMILY_INET6_LINUX: u32 = 10;

const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;

/// Address family of a raw IP packet, from its version nibble
pub fn packet_family(packet: &[u8]) -> Option<u32> {
    match packet.first().map(|byte| byte >> 4) {
        Some(4) => Some(FAMILY_INET),
        Some(6) => Some(FAMILY_INET6),
        _ => None,
    }
}

/// Layout of the 4-byte header in front of every device frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameHeader {
    /// Big-endian address family, as utun devices use
    #[default]
    Family,
    /// Linux `tun_pi`: 16-bit flags, then a big-endian ethertype
    PacketInformation,
}

impl FrameHeader {
    /// Header used by kernel TUN devices on this platform
    pub fn native() -> Self {
        if cfg!(target_os = "linux") {
            FrameHeader::PacketInformation
        } else {
            FrameHeader::Family
        }
    }

    /// Build a device frame from an address family and a packet.
    ///
    /// Returns `None` when the packet's family has no ethertype.
    pub fn encode(self, family: u32, packet: &[u8]) -> Option<Vec<u8>> {
        let mut frame = Vec::with_capacity(PROTOCOL_HEADER_SIZE + packet.len());
        match self {
            FrameHeader::Family => frame.extend_from_slice(&family.to_be_bytes()),
            FrameHeader::PacketInformation => {
                let ethertype = match packet_family(packet).unwrap_or(family) {
                    FAMILY_INET => ETH_P_IP,
                    FAMILY_INET6 | FAMILY_INET6_LINUX => ETH_P_IPV6,
                    _ => return None,
                };
                frame.extend_from_slice(&[0, 0]);
                frame.extend_from_slice(&ethertype.to_be_bytes());
            }
        }
        frame.extend_from_slice(packet);
        Some(frame)
    }

    /// Split a device frame into its address family and packet.
    ///
    /// Returns `None` for frames that do not carry a whole header and for
    /// ethertypes other than IPv4 and IPv6.
    pub fn decode(self, frame: &[u8]) -> Option<(u32, &[u8])> {
        if frame.len() < PROTOCOL_HEADER_SIZE {
            return None;
        }

        let (header, packet) = frame.split_at(PROTOCOL_HEADER_SIZE);
        let family = match self {
            FrameHeader::Family => u32::from_be_bytes([header[0], header[1], header[2], header[3]]),
            FrameHeader::PacketInformation => match u16::from_be_bytes([header[2], header[3]]) {
                ETH_P_IP => FAMILY_INET,
                ETH_P_IPV6 => FAMILY_INET6,
                _ => return None,
            },
        };
        Some((family, packet))
    }
}
