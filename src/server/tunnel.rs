// src/server/tunnel.rs
//! Per-client tunnel.
//!
//! A `ServerTunnel` owns one control connection. It decodes client
//! messages, dispatches them to the flows multiplexed over the connection,
//! applies events reported by backend watcher tasks, and writes everything
//! queued for the client back without ever blocking on a slow reader.

use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::constants::CONTROL_READ_BUFFER_SIZE;
use crate::protocol::{
    parse_request, CloseDirection, Message, OpenTarget, ResultCode, TunnelCodec, TunnelRequest,
};
use crate::server::connection::{EventSink, FlowEvent, FlowHandler};
use crate::server::core::{ServerContext, ServerError};
use crate::server::outbox::Outbox;
use crate::server::packet::IpFlow;
use crate::server::tcp::TcpFlow;
use crate::server::udp::UdpFlow;

/// A flow in the connection table
struct FlowEntry {
    /// Events tagged with another generation belong to an earlier flow
    generation: u64,
    handler: Box<dyn FlowHandler>,
}

/// Server side of one client control connection
pub struct ServerTunnel<R, W> {
    reader: FramedRead<R, TunnelCodec>,
    writer: W,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
    flows: HashMap<u64, FlowEntry>,
    events_tx: mpsc::UnboundedSender<FlowEvent>,
    events_rx: mpsc::UnboundedReceiver<FlowEvent>,
    outbox: Outbox,
    /// Every flow was suspended because the client is not keeping up
    flows_suspended: bool,
    next_generation: u64,
}

impl<R, W> ServerTunnel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, context: Arc<ServerContext>, cancel: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            reader: FramedRead::with_capacity(reader, TunnelCodec::new(), CONTROL_READ_BUFFER_SIZE),
            writer,
            context,
            cancel,
            flows: HashMap::new(),
            events_tx,
            events_rx,
            outbox: Outbox::new(),
            flows_suspended: false,
            next_generation: 0,
        }
    }

    /// Serve the control connection until it closes, breaks the protocol,
    /// or the tunnel is cancelled. All flows are torn down on return.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let result = self.serve().await;
        self.close_all();
        result
    }

    async fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            let has_pending = self.outbox.has_pending();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Tunnel cancelled");
                    return Ok(());
                }
                frame = self.reader.next() => match frame {
                    Some(Ok(message)) => self.handle_message(message),
                    Some(Err(e)) => {
                        if e.is_protocol_violation() {
                            warn!("Protocol violation, closing tunnel: {}", e);
                        }
                        return Err(e.into());
                    }
                    None => {
                        info!("Control connection closed by client");
                        return Ok(());
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                written = self.writer.write(self.outbox.pending()), if has_pending => {
                    match written {
                        Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                        Ok(n) => self.outbox.consume(n),
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            self.reap();
            self.flush_outbox()?;
        }
    }

    fn handle_message(&mut self, message: Message) {
        let request = match parse_request(&message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Ignoring message: {}", e);
                return;
            }
        };
        trace!("Request for flow {}: {:?}", request.identifier(), request);

        match request {
            TunnelRequest::Open { identifier, target } => self.open_flow(identifier, target),
            TunnelRequest::FetchConfiguration => {
                let configuration = self.context.settings.client_configuration();
                self.outbox.send_configuration(configuration);
            }
            TunnelRequest::OpenResult { identifier } => {
                debug!("Ignoring open result for flow {}", identifier);
            }
            request => self.route_request(request),
        }
    }

    /// Hand a request to the flow it names
    fn route_request(&mut self, request: TunnelRequest) {
        let identifier = request.identifier();
        let entry = match self.flows.get_mut(&identifier) {
            Some(entry) => entry,
            None => {
                debug!("No flow {}, dropping request", identifier);
                return;
            }
        };
        let handler = &mut entry.handler;
        let out = &mut self.outbox;

        match request {
            TunnelRequest::Data {
                data,
                endpoint: Some((host, port)),
                ..
            } => handler.send_datagram(data, &host, port, out),
            TunnelRequest::Data { data, .. } => handler.send_data(data, out),
            TunnelRequest::Packets { packets, .. } => handler.send_packets(packets, out),
            TunnelRequest::Suspend { .. } => handler.suspend(),
            TunnelRequest::Resume { .. } => handler.resume(),
            TunnelRequest::Close { direction, .. } => handler.close(direction),
            _ => {}
        }
    }

    fn open_flow(&mut self, identifier: u64, target: OpenTarget) {
        if self.flows.contains_key(&identifier) {
            warn!("Flow {} already open, ignoring open", identifier);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = EventSink::new(identifier, generation, self.events_tx.clone());

        let mut handler: Box<dyn FlowHandler> = match target {
            OpenTarget::Tcp { host, port } => Box::new(TcpFlow::open(identifier, host, port, sink)),
            OpenTarget::Udp => {
                self.outbox
                    .send_open_result(identifier, ResultCode::Success, None);
                Box::new(UdpFlow::new(identifier, sink))
            }
            OpenTarget::Ip => match IpFlow::open(identifier, &self.context, sink, &mut self.outbox) {
                Some(flow) => Box::new(flow),
                None => return,
            },
        };

        if self.flows_suspended {
            handler.suspend();
        }
        self.flows.insert(
            identifier,
            FlowEntry {
                generation,
                handler,
            },
        );
    }

    fn handle_event(&mut self, event: FlowEvent) {
        match self.flows.get_mut(&event.identifier) {
            Some(entry) if entry.generation == event.generation => {
                entry.handler.handle_event(event.kind, &mut self.outbox)
            }
            _ => trace!(
                "Dropping stale {} event for flow {}",
                event.kind.name(),
                event.identifier
            ),
        }
    }

    /// Remove flows closed in both directions
    fn reap(&mut self) {
        self.flows.retain(|identifier, entry| {
            let closed = entry.handler.is_closed();
            if closed {
                debug!("Removed {} flow {}", entry.handler.kind(), identifier);
            }
            !closed
        });
    }

    /// Write as much of the outbox as the control stream takes right now,
    /// suspending every flow while bytes are left over
    fn flush_outbox(&mut self) -> io::Result<()> {
        while self.outbox.has_pending() {
            match self.writer.write(self.outbox.pending()).now_or_never() {
                Some(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Some(Ok(n)) => self.outbox.consume(n),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        let backlogged = self.outbox.has_pending();
        if backlogged != self.flows_suspended {
            self.flows_suspended = backlogged;
            if backlogged {
                debug!(
                    "Control stream backlogged with {} bytes, suspending {} flows",
                    self.outbox.pending().len(),
                    self.flows.len()
                );
            } else {
                debug!("Control stream drained, resuming {} flows", self.flows.len());
            }
            for entry in self.flows.values_mut() {
                if backlogged {
                    entry.handler.suspend();
                } else {
                    entry.handler.resume();
                }
            }
        }
        Ok(())
    }

    fn close_all(&mut self) {
        if !self.flows.is_empty() {
            info!("Tearing down {} flows", self.flows.len());
        }
        for (_, mut entry) in self.flows.drain() {
            entry.handler.close(CloseDirection::All);
        }
    }
}
