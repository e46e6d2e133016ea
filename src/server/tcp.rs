// src/server/tcp.rs
//! TCP flows.
//!
//! A TCP flow relays a byte stream between the client and an outbound TCP
//! connection. When the remote side stops accepting bytes the flow buffers
//! the remainder, stops reading from the remote and asks the client to
//! suspend; once the buffer drains the client is told to resume.

use async_trait::async_trait;
use bytes::Buf;
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::constants::{CONNECT_TIMEOUT, TCP_READ_CHUNK};
use crate::protocol::{CloseDirection, ResultCode};
use crate::server::connection::{EventSink, FlowEventKind, FlowHandler, FlowState};
use crate::server::outbox::Outbox;

/// Non-blocking byte stream behind a TCP flow
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Wait until a read may make progress
    async fn readable(&self) -> io::Result<()>;

    /// Wait until a write may make progress
    async fn writable(&self) -> io::Result<()>;

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Send FIN, leaving the read half open
    fn shutdown_write(&self) -> io::Result<()>;
}

#[async_trait]
impl StreamBackend for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        SockRef::from(self).shutdown(Shutdown::Write)
    }
}

/// Outcome of pushing bytes into the backend
enum WriteOutcome {
    /// Everything was accepted
    Complete,
    /// The backend would block; holds the number of bytes accepted
    Partial(usize),
}

/// Write as much of `data` as the backend takes right now
fn write_available(backend: &dyn StreamBackend, data: &[u8]) -> io::Result<WriteOutcome> {
    let mut written = 0;
    while written < data.len() {
        match backend.try_write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteOutcome::Partial(written))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(WriteOutcome::Complete)
}

/// Map a connect failure to the code reported to the client
pub fn connect_result_code(error: &io::Error) -> ResultCode {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => ResultCode::Refused,
        io::ErrorKind::TimedOut => ResultCode::Timeout,
        io::ErrorKind::NotFound => ResultCode::NoSuchHost,
        _ => ResultCode::InternalError,
    }
}

/// Resolve `host` and connect to the first address that accepts
async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let addresses: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?
        .collect();
    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host),
        ));
    }

    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect(address).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", address, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| io::ErrorKind::NotConnected.into()))
}

fn spawn_connect(host: String, port: u16, sink: EventSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = match time::timeout(CONNECT_TIMEOUT, connect(&host, port)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", CONNECT_TIMEOUT),
            )),
        };

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}:{}: {}", host, port, e);
                }
                sink.send(FlowEventKind::Connected(Arc::new(stream)));
            }
            Err(e) => {
                info!("Failed to connect to {}:{}: {}", host, port, e);
                sink.send(FlowEventKind::ConnectFailed(connect_result_code(&e)));
            }
        }
    })
}

/// Reads until the stream ends, posting each chunk to the tunnel.
///
/// There is one reader for the life of a flow so chunks reach the tunnel in
/// stream order. While `paused` is set it reads nothing.
fn spawn_reader(
    backend: Arc<dyn StreamBackend>,
    sink: EventSink,
    mut paused: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_READ_CHUNK];
        loop {
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    break;
                }
                if paused.changed().await.is_err() {
                    return;
                }
            }

            tokio::select! {
                ready = backend.readable() => {
                    if let Err(e) = ready {
                        sink.send(FlowEventKind::ReadFailed(e));
                        return;
                    }
                }
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }

            while !*paused.borrow() {
                match backend.try_read(&mut buf) {
                    Ok(0) => {
                        sink.send(FlowEventKind::ReadClosed);
                        return;
                    }
                    Ok(n) => {
                        if !sink.send(FlowEventKind::Data(buf[..n].to_vec())) {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        sink.send(FlowEventKind::ReadFailed(e));
                        return;
                    }
                }
            }
        }
    })
}

/// One-shot write readiness
fn spawn_write_watcher(backend: Arc<dyn StreamBackend>, sink: EventSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        match backend.writable().await {
            Ok(()) => sink.send(FlowEventKind::Writable),
            Err(e) => sink.send(FlowEventKind::WriteFailed(e)),
        };
    })
}

/// A flow relayed to an outbound TCP connection
pub struct TcpFlow {
    state: FlowState,
    sink: EventSink,
    /// Set once the connect completes
    backend: Option<Arc<dyn StreamBackend>>,
    connect_task: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    /// Holds the reader while the flow should not read
    read_paused: watch::Sender<bool>,
    write_watcher: Option<JoinHandle<()>>,
    /// Client asked us to stop sending
    suspended: bool,
    /// Backend would not take all our bytes
    write_blocked: bool,
    write_shut: bool,
}

impl TcpFlow {
    /// Start connecting to `host`:`port`
    pub fn open(identifier: u64, host: String, port: u16, sink: EventSink) -> Self {
        info!("Flow {} connecting to {}:{}", identifier, host, port);
        let mut flow = Self::new(identifier, sink);
        flow.connect_task = Some(spawn_connect(host, port, flow.sink.clone()));
        flow
    }

    fn new(identifier: u64, sink: EventSink) -> Self {
        Self {
            state: FlowState::new(identifier),
            sink,
            backend: None,
            connect_task: None,
            reader: None,
            read_paused: watch::channel(false).0,
            write_watcher: None,
            suspended: false,
            write_blocked: false,
            write_shut: false,
        }
    }

    /// Take over a connected backend
    fn attach(&mut self, backend: Arc<dyn StreamBackend>, out: &mut Outbox) {
        let identifier = self.state.identifier;
        self.connect_task = None;
        self.backend = Some(backend);
        out.send_open_result(identifier, ResultCode::Success, None);
        debug!("Flow {} connected", identifier);

        if !self.state.pending.is_empty() {
            let buffered = self.state.pending.split().freeze();
            self.write_or_buffer(&buffered, out);
        } else if self.state.closed_for_write {
            self.finish_write_close();
        }
        self.update_reader();
    }

    /// Write to the backend, buffering whatever it does not take
    fn write_or_buffer(&mut self, data: &[u8], out: &mut Outbox) {
        let backend = match &self.backend {
            Some(backend) => backend.clone(),
            None => {
                self.state.pending.extend_from_slice(data);
                return;
            }
        };

        match write_available(backend.as_ref(), data) {
            Ok(WriteOutcome::Complete) => {
                if self.state.closed_for_write {
                    self.finish_write_close();
                }
            }
            Ok(WriteOutcome::Partial(written)) => {
                let identifier = self.state.identifier;
                debug!(
                    "Flow {} backend took {} of {} bytes, suspending",
                    identifier,
                    written,
                    data.len()
                );
                self.state.pending.extend_from_slice(&data[written..]);
                self.write_blocked = true;
                self.update_reader();
                out.send_suspend(identifier);
                self.watch_writable(backend);
            }
            Err(e) => {
                warn!("Flow {} write failed: {}", self.state.identifier, e);
                self.abort(out);
            }
        }
    }

    fn watch_writable(&mut self, backend: Arc<dyn StreamBackend>) {
        if self.write_watcher.is_none() {
            self.write_watcher = Some(spawn_write_watcher(backend, self.sink.clone()));
        }
    }

    /// Flush buffered bytes after write readiness
    fn on_writable(&mut self, out: &mut Outbox) {
        self.write_watcher = None;
        let backend = match &self.backend {
            Some(backend) => backend.clone(),
            None => return,
        };
        if self.state.pending.is_empty() {
            return;
        }

        let identifier = self.state.identifier;
        match write_available(backend.as_ref(), &self.state.pending) {
            Ok(WriteOutcome::Partial(written)) => {
                self.state.pending.advance(written);
                self.watch_writable(backend);
            }
            Ok(WriteOutcome::Complete) => {
                self.state.pending.clear();
                self.write_blocked = false;
                if self.state.closed_for_write {
                    self.finish_write_close();
                } else {
                    debug!("Flow {} drained, resuming", identifier);
                    out.send_resume(identifier);
                }
                self.update_reader();
            }
            Err(e) => {
                warn!("Flow {} write failed: {}", identifier, e);
                self.abort(out);
            }
        }
    }

    /// Shut down the write half once nothing is left to send
    fn finish_write_close(&mut self) {
        if self.write_shut || !self.state.pending.is_empty() {
            return;
        }
        if let Some(backend) = &self.backend {
            self.write_shut = true;
            if let Err(e) = backend.shutdown_write() {
                debug!("Flow {} write shutdown failed: {}", self.state.identifier, e);
            }
        }
    }

    fn should_read(&self) -> bool {
        self.backend.is_some() && !self.state.closed_for_read && !self.suspended && !self.write_blocked
    }

    /// Pause or release the reader to match the flow state.
    ///
    /// The reader is started with the backend and only stopped once the flow
    /// is closed for read.
    fn update_reader(&mut self) {
        if self.state.closed_for_read {
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            return;
        }

        self.read_paused.send_replace(!self.should_read());
        if self.reader.is_none() {
            if let Some(backend) = &self.backend {
                self.reader = Some(spawn_reader(
                    backend.clone(),
                    self.sink.clone(),
                    self.read_paused.subscribe(),
                ));
            }
        }
    }

    fn teardown(&mut self) {
        for task in [
            self.connect_task.take(),
            self.reader.take(),
            self.write_watcher.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        self.backend = None;
        self.state.pending.clear();
    }
}

impl FlowHandler for TcpFlow {
    fn state(&self) -> &FlowState {
        &self.state
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn send_data(&mut self, data: Vec<u8>, out: &mut Outbox) {
        if self.state.closed_for_write {
            debug!(
                "Flow {} closed for write, dropping {} bytes",
                self.state.identifier,
                data.len()
            );
            return;
        }

        if self.backend.is_none() || !self.state.pending.is_empty() {
            self.state.pending.extend_from_slice(&data);
            return;
        }
        self.write_or_buffer(&data, out);
    }

    fn suspend(&mut self) {
        self.suspended = true;
        self.update_reader();
    }

    fn resume(&mut self) {
        self.suspended = false;
        self.update_reader();
    }

    fn close(&mut self, direction: CloseDirection) {
        debug!("Closing flow {} ({:?})", self.state.identifier, direction);
        self.state.close(direction);

        if self.state.is_closed() {
            self.teardown();
            return;
        }
        if direction.closes_read() {
            self.update_reader();
        }
        if direction.closes_write() {
            self.finish_write_close();
        }
    }

    fn handle_event(&mut self, event: FlowEventKind, out: &mut Outbox) {
        let identifier = self.state.identifier;
        match event {
            FlowEventKind::Connected(backend) => self.attach(backend, out),
            FlowEventKind::ConnectFailed(code) => {
                self.connect_task = None;
                out.send_open_result(identifier, code, None);
                self.abort(out);
            }
            FlowEventKind::Data(data) => {
                if !self.state.closed_for_read {
                    out.send_data(identifier, &data);
                }
            }
            FlowEventKind::ReadClosed => {
                debug!("Flow {} got EOF", identifier);
                self.reader = None;
                out.send_close(identifier, CloseDirection::Write);
                self.close(CloseDirection::Read);
            }
            FlowEventKind::ReadFailed(e) => {
                warn!("Flow {} read failed: {}", identifier, e);
                self.reader = None;
                self.abort(out);
            }
            FlowEventKind::Writable => self.on_writable(out),
            FlowEventKind::WriteFailed(e) => {
                warn!("Flow {} write failed: {}", identifier, e);
                self.write_watcher = None;
                self.abort(out);
            }
            other => debug!("Flow {} ignoring {} event", identifier, other.name()),
        }
    }
}

impl Drop for TcpFlow {
    fn drop(&mut self) {
        self.teardown();
    }
}
