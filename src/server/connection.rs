// src/server/connection.rs
//! Shared flow state and the flow capability trait.
//!
//! Every logical flow multiplexed over a control connection (TCP stream,
//! UDP socket, IP interface) implements `FlowHandler`. Backends report
//! readiness through `FlowEvent`s posted to the owning tunnel task, which is
//! the only place flow state is touched.

use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{CloseDirection, ResultCode};
use crate::server::outbox::Outbox;
use crate::server::tcp::StreamBackend;

/// What a backend watcher observed
pub enum FlowEventKind {
    /// Outbound TCP connect finished
    Connected(Arc<dyn StreamBackend>),
    /// Outbound TCP connect failed, mapped to the code reported to the client
    ConnectFailed(ResultCode),
    /// Bytes read from a stream
    Data(Vec<u8>),
    /// Stream reached end of file
    ReadClosed,
    ReadFailed(io::Error),
    /// Stream can accept more bytes
    Writable,
    WriteFailed(io::Error),
    /// Datagram received on a UDP socket
    Datagram { data: Vec<u8>, from: SocketAddr },
    DatagramFailed(io::Error),
    /// A batch of frames read from a virtual interface
    Packets(Vec<(u32, Vec<u8>)>),
    InterfaceFailed(io::Error),
}

impl FlowEventKind {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            FlowEventKind::Connected(_) => "connected",
            FlowEventKind::ConnectFailed(_) => "connect-failed",
            FlowEventKind::Data(_) => "data",
            FlowEventKind::ReadClosed => "read-closed",
            FlowEventKind::ReadFailed(_) => "read-failed",
            FlowEventKind::Writable => "writable",
            FlowEventKind::WriteFailed(_) => "write-failed",
            FlowEventKind::Datagram { .. } => "datagram",
            FlowEventKind::DatagramFailed(_) => "datagram-failed",
            FlowEventKind::Packets(_) => "packets",
            FlowEventKind::InterfaceFailed(_) => "interface-failed",
        }
    }
}

/// An event addressed to one flow instance
pub struct FlowEvent {
    pub identifier: u64,
    /// Distinguishes flows that reused the same identifier
    pub generation: u64,
    pub kind: FlowEventKind,
}

/// Handle used by watcher tasks to report on their flow
#[derive(Debug, Clone)]
pub struct EventSink {
    identifier: u64,
    generation: u64,
    tx: mpsc::UnboundedSender<FlowEvent>,
}

impl EventSink {
    pub fn new(identifier: u64, generation: u64, tx: mpsc::UnboundedSender<FlowEvent>) -> Self {
        Self {
            identifier,
            generation,
            tx,
        }
    }

    /// Post an event, returning false once the tunnel has gone away
    pub fn send(&self, kind: FlowEventKind) -> bool {
        self.tx
            .send(FlowEvent {
                identifier: self.identifier,
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// State common to every flow
#[derive(Debug)]
pub struct FlowState {
    /// Client-assigned identifier, unique within the tunnel
    pub identifier: u64,
    pub closed_for_read: bool,
    pub closed_for_write: bool,
    /// Outbound bytes not yet accepted by the backend
    pub pending: BytesMut,
}

impl FlowState {
    pub fn new(identifier: u64) -> Self {
        Self {
            identifier,
            closed_for_read: false,
            closed_for_write: false,
            pending: BytesMut::new(),
        }
    }

    /// Mark the given directions closed
    pub fn close(&mut self, direction: CloseDirection) {
        if direction.closes_read() {
            self.closed_for_read = true;
        }
        if direction.closes_write() {
            self.closed_for_write = true;
        }
    }

    /// Both directions closed
    pub fn is_closed(&self) -> bool {
        self.closed_for_read && self.closed_for_write
    }
}

/// Operations the tunnel performs on a flow.
///
/// Messages for the client are queued on the `Outbox`; none of these
/// methods block.
pub trait FlowHandler: Send {
    fn state(&self) -> &FlowState;

    /// Flow type for logging
    fn kind(&self) -> &'static str;

    /// Stream data from the client
    fn send_data(&mut self, data: Vec<u8>, _out: &mut Outbox) {
        debug!(
            "{} flow {} does not take stream data, dropping {} bytes",
            self.kind(),
            self.state().identifier,
            data.len()
        );
    }

    /// A datagram from the client for `host`:`port`
    fn send_datagram(&mut self, data: Vec<u8>, host: &str, port: u16, _out: &mut Outbox) {
        debug!(
            "{} flow {} does not take datagrams, dropping {} bytes for {}:{}",
            self.kind(),
            self.state().identifier,
            data.len(),
            host,
            port
        );
    }

    /// IP packets from the client
    fn send_packets(&mut self, packets: Vec<(u32, Vec<u8>)>, _out: &mut Outbox) {
        debug!(
            "{} flow {} does not take packets, dropping {}",
            self.kind(),
            self.state().identifier,
            packets.len()
        );
    }

    /// Stop reading from the backend
    fn suspend(&mut self);

    /// Start reading from the backend again
    fn resume(&mut self);

    /// Close one or both directions
    fn close(&mut self, direction: CloseDirection);

    /// React to a backend event
    fn handle_event(&mut self, event: FlowEventKind, out: &mut Outbox);

    /// Tell the client the flow is gone and tear it down
    fn abort(&mut self, out: &mut Outbox) {
        let identifier = self.state().identifier;
        debug!("Aborting {} flow {}", self.kind(), identifier);
        out.send_close(identifier, CloseDirection::All);
        self.close(CloseDirection::All);
    }

    /// Ready to be removed from the connection table
    fn is_closed(&self) -> bool {
        self.state().is_closed()
    }
}
