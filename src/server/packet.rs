// src/server/packet.rs
//! IP flows.
//!
//! An IP flow bridges the client's packets to a virtual interface created
//! for it, with an address taken from the shared pool. Packets read from
//! the interface are sent to the client in batches.

use futures::FutureExt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::constants::{
    MAX_PACKETS_PER_MESSAGE, PACKET_BATCH_BYTE_LIMIT, PACKET_BUFFER_SIZE, PROTOCOL_HEADER_SIZE,
};
use crate::network::{FrameHeader, PacketDevice};
use crate::protocol::{CloseDirection, ResultCode};
use crate::server::connection::{EventSink, FlowEventKind, FlowHandler, FlowState};
use crate::server::core::ServerContext;
use crate::server::outbox::Outbox;

/// Collects frames into a batch for one `packets` message
#[derive(Debug)]
struct PacketBatch {
    header: FrameHeader,
    packets: Vec<(u32, Vec<u8>)>,
    bytes: usize,
}

impl PacketBatch {
    fn new(header: FrameHeader) -> Self {
        Self {
            header,
            packets: Vec::new(),
            bytes: 0,
        }
    }

    /// Add a frame read from the device; short or non-IP frames are discarded
    fn push_frame(&mut self, frame: &[u8]) {
        match self.header.decode(frame) {
            Some((family, packet)) => {
                self.bytes += packet.len();
                self.packets.push((family, packet.to_vec()));
            }
            None => debug!("Discarding {} byte frame without IP header", frame.len()),
        }
    }

    fn is_full(&self) -> bool {
        self.packets.len() >= MAX_PACKETS_PER_MESSAGE || self.bytes >= PACKET_BATCH_BYTE_LIMIT
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8])
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match writer.write(frame).await {
        Ok(n) if n < frame.len() => warn!("Short interface write: {} of {} bytes", n, frame.len()),
        Ok(_) => trace!("Wrote {} byte frame to interface", frame.len()),
        Err(e) => warn!("Interface write failed: {}", e),
    }
}

/// Owns the device: reads batches unless paused, writes queued frames
async fn run_device(
    device: Box<dyn PacketDevice>,
    header: FrameHeader,
    sink: EventSink,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    mut paused: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = tokio::io::split(device);
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE + PROTOCOL_HEADER_SIZE];

    loop {
        let is_paused = *paused.borrow();
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => write_frame(&mut writer, &frame).await,
                None => return,
            },
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            read = reader.read(&mut buf), if !is_paused => {
                let mut batch = PacketBatch::new(header);
                let mut failure = match read {
                    Ok(0) => Some(io::Error::from(io::ErrorKind::UnexpectedEof)),
                    Ok(n) => {
                        batch.push_frame(&buf[..n]);
                        None
                    }
                    Err(e) => Some(e),
                };

                // Take whatever else is ready without waiting
                while failure.is_none() && !batch.is_full() {
                    match reader.read(&mut buf).now_or_never() {
                        Some(Ok(0)) => failure = Some(io::ErrorKind::UnexpectedEof.into()),
                        Some(Ok(n)) => batch.push_frame(&buf[..n]),
                        Some(Err(e)) => failure = Some(e),
                        None => break,
                    }
                }

                if !batch.packets.is_empty() && !sink.send(FlowEventKind::Packets(batch.packets)) {
                    return;
                }
                if let Some(e) = failure {
                    sink.send(FlowEventKind::InterfaceFailed(e));
                    return;
                }
            }
        }
    }
}

/// The IP-layer flow of a tunnel
pub struct IpFlow {
    state: FlowState,
    context: Arc<ServerContext>,
    /// Address assigned from the pool, taken back on teardown
    address: Option<Ipv4Addr>,
    header: FrameHeader,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    paused: watch::Sender<bool>,
    device_task: Option<JoinHandle<()>>,
}

impl IpFlow {
    /// Assign an address and bring up an interface for it.
    ///
    /// The open result is queued either way; `None` means no flow was
    /// created.
    pub fn open(
        identifier: u64,
        context: &Arc<ServerContext>,
        sink: EventSink,
        out: &mut Outbox,
    ) -> Option<Self> {
        let address = match context.address_pool.allocate() {
            Some(address) => address,
            None => {
                warn!("IP flow {}: no addresses left", identifier);
                out.send_open_result(identifier, ResultCode::Refused, None);
                return None;
            }
        };

        let configuration = match context.settings.personalized(address) {
            Some(configuration) => configuration,
            None => {
                warn!("IP flow {}: no IPv4 settings configured", identifier);
                context.address_pool.deallocate(address);
                out.send_open_result(identifier, ResultCode::InternalError, None);
                return None;
            }
        };

        let device = match context.interfaces.create(address) {
            Ok(device) => device,
            Err(e) => {
                warn!("IP flow {}: failed to set up the interface: {}", identifier, e);
                context.address_pool.deallocate(address);
                out.send_open_result(identifier, ResultCode::InternalError, None);
                return None;
            }
        };

        let header = context.interfaces.frame_header();
        let (frames, frame_rx) = mpsc::unbounded_channel();
        let (paused, paused_rx) = watch::channel(false);
        let device_task = tokio::spawn(run_device(device, header, sink, frame_rx, paused_rx));

        info!("IP flow {} assigned {}", identifier, address);
        out.send_open_result(identifier, ResultCode::Success, Some(configuration));

        Some(Self {
            state: FlowState::new(identifier),
            context: context.clone(),
            address: Some(address),
            header,
            frames,
            paused,
            device_task: Some(device_task),
        })
    }

    /// Address assigned to the flow
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    fn set_paused(&self, paused: bool) {
        let _ = self.paused.send(paused);
    }

    fn teardown(&mut self) {
        if let Some(task) = self.device_task.take() {
            task.abort();
        }
        if let Some(address) = self.address.take() {
            self.context.address_pool.deallocate(address);
            info!("IP flow {} released {}", self.state.identifier, address);
        }
    }
}

impl FlowHandler for IpFlow {
    fn state(&self) -> &FlowState {
        &self.state
    }

    fn kind(&self) -> &'static str {
        "ip"
    }

    fn send_packets(&mut self, packets: Vec<(u32, Vec<u8>)>, _out: &mut Outbox) {
        if self.state.closed_for_write {
            debug!(
                "IP flow {} closed for write, dropping {} packets",
                self.state.identifier,
                packets.len()
            );
            return;
        }

        for (family, packet) in packets {
            let frame = match self.header.encode(family, &packet) {
                Some(frame) => frame,
                None => {
                    debug!(
                        "IP flow {} dropping packet of unknown family {}",
                        self.state.identifier, family
                    );
                    continue;
                }
            };
            if self.frames.send(frame).is_err() {
                debug!("IP flow {} interface is gone", self.state.identifier);
                return;
            }
        }
    }

    fn suspend(&mut self) {
        self.set_paused(true);
    }

    fn resume(&mut self) {
        if !self.state.closed_for_read {
            self.set_paused(false);
        }
    }

    fn close(&mut self, direction: CloseDirection) {
        debug!("Closing IP flow {} ({:?})", self.state.identifier, direction);
        self.state.close(direction);
        if self.state.is_closed() {
            self.teardown();
        } else if direction.closes_read() {
            self.set_paused(true);
        }
    }

    fn handle_event(&mut self, event: FlowEventKind, out: &mut Outbox) {
        let identifier = self.state.identifier;
        match event {
            FlowEventKind::Packets(packets) => {
                if !self.state.closed_for_read {
                    trace!("IP flow {} read {} packets", identifier, packets.len());
                    out.send_packets(identifier, &packets);
                }
            }
            FlowEventKind::InterfaceFailed(e) => {
                warn!("IP flow {} interface failed: {}", identifier, e);
                self.device_task = None;
                self.abort(out);
            }
            other => debug!("IP flow {} ignoring {} event", identifier, other.name()),
        }
    }
}

impl Drop for IpFlow {
    fn drop(&mut self) {
        self.teardown();
    }
}
