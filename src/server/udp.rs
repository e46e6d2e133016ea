// src/server/udp.rs
//! UDP flows.
//!
//! A UDP flow relays datagrams between the client and arbitrary remote
//! endpoints. The socket is created on the first outbound datagram, with
//! the address family of its destination.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::constants::UDP_RECV_BUFFER_SIZE;
use crate::protocol::CloseDirection;
use crate::server::connection::{EventSink, FlowEventKind, FlowHandler, FlowState};
use crate::server::outbox::Outbox;

/// Bind an unconnected socket of the family of `destination`
fn bind_socket(destination: &IpAddr) -> io::Result<UdpSocket> {
    let (domain, local): (Domain, SocketAddr) = match destination {
        IpAddr::V4(_) => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into()),
        IpAddr::V6(_) => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into()),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    UdpSocket::from_std(socket.into())
}

/// Forwards received datagrams to the tunnel
fn spawn_receiver(socket: Arc<UdpSocket>, sink: EventSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let datagram = FlowEventKind::Datagram {
                        data: buf[..n].to_vec(),
                        from,
                    };
                    if !sink.send(datagram) {
                        return;
                    }
                }
                Err(e) => {
                    sink.send(FlowEventKind::DatagramFailed(e));
                    return;
                }
            }
        }
    })
}

/// A flow relayed over an outbound UDP socket
pub struct UdpFlow {
    state: FlowState,
    sink: EventSink,
    socket: Option<Arc<UdpSocket>>,
    receiver: Option<JoinHandle<()>>,
    suspended: bool,
}

impl UdpFlow {
    pub fn new(identifier: u64, sink: EventSink) -> Self {
        debug!("Opened UDP flow {}", identifier);
        Self {
            state: FlowState::new(identifier),
            sink,
            socket: None,
            receiver: None,
            suspended: false,
        }
    }

    /// Local address of the socket, once one exists
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    fn update_receiver(&mut self) {
        if self.suspended || self.state.closed_for_read {
            if let Some(receiver) = self.receiver.take() {
                receiver.abort();
            }
            return;
        }
        if self.receiver.is_none() {
            if let Some(socket) = &self.socket {
                self.receiver = Some(spawn_receiver(socket.clone(), self.sink.clone()));
            }
        }
    }

    fn socket_for(&mut self, destination: &IpAddr) -> io::Result<Arc<UdpSocket>> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }

        let socket = Arc::new(bind_socket(destination)?);
        debug!(
            "UDP flow {} bound to {:?}",
            self.state.identifier,
            socket.local_addr()
        );
        self.socket = Some(socket.clone());
        self.update_receiver();
        Ok(socket)
    }

    fn teardown(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        self.socket = None;
    }
}

impl FlowHandler for UdpFlow {
    fn state(&self) -> &FlowState {
        &self.state
    }

    fn kind(&self) -> &'static str {
        "udp"
    }

    fn send_datagram(&mut self, data: Vec<u8>, host: &str, port: u16, out: &mut Outbox) {
        let identifier = self.state.identifier;
        if self.state.closed_for_write {
            debug!("UDP flow {} closed for write, dropping datagram", identifier);
            return;
        }

        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(
                    "UDP flow {}: {} is not an address literal, dropping datagram",
                    identifier, host
                );
                return;
            }
        };

        let socket = match self.socket_for(&ip) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("UDP flow {} failed to create a socket: {}", identifier, e);
                self.abort(out);
                return;
            }
        };

        // The socket's family is fixed by the first destination
        if let Ok(local) = socket.local_addr() {
            if local.is_ipv4() != ip.is_ipv4() {
                warn!(
                    "UDP flow {} is bound to {}, dropping datagram for {}",
                    identifier, local, ip
                );
                return;
            }
        }

        let destination = SocketAddr::new(ip, port);
        match socket.try_send_to(&data, destination) {
            Ok(sent) if sent < data.len() => warn!(
                "UDP flow {} sent {} of {} bytes to {}",
                identifier,
                sent,
                data.len(),
                destination
            ),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(
                    "UDP flow {} socket busy, dropping datagram for {}",
                    identifier, destination
                );
            }
            Err(e) => {
                warn!("UDP flow {} send to {} failed: {}", identifier, destination, e);
                self.abort(out);
            }
        }
    }

    fn suspend(&mut self) {
        self.suspended = true;
        self.update_receiver();
    }

    fn resume(&mut self) {
        self.suspended = false;
        self.update_receiver();
    }

    fn close(&mut self, direction: CloseDirection) {
        debug!("Closing UDP flow {} ({:?})", self.state.identifier, direction);
        self.state.close(direction);
        if self.state.is_closed() {
            self.teardown();
        } else {
            self.update_receiver();
        }
    }

    fn handle_event(&mut self, event: FlowEventKind, out: &mut Outbox) {
        let identifier = self.state.identifier;
        match event {
            FlowEventKind::Datagram { data, from } => {
                if !self.state.closed_for_read {
                    out.send_datagram(identifier, &data, &from.ip().to_string(), from.port());
                }
            }
            FlowEventKind::DatagramFailed(e) => {
                warn!("UDP flow {} receive failed: {}", identifier, e);
                self.receiver = None;
                self.abort(out);
            }
            other => debug!("UDP flow {} ignoring {} event", identifier, other.name()),
        }
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_request, TunnelCodec, TunnelRequest};
    use crate::server::connection::FlowEvent;
    use bytes::BytesMut;
    use tokio::sync::mpsc;
    use tokio_util::codec::Decoder;

    fn flow() -> (UdpFlow, mpsc::UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UdpFlow::new(3, EventSink::new(3, 1, tx)), rx)
    }

    #[cfg(target_os = "linux")]
    const EAFNOSUPPORT: i32 = 97;
    #[cfg(not(target_os = "linux"))]
    const EAFNOSUPPORT: i32 = 47;

    #[tokio::test]
    async fn test_socket_family_follows_destination() {
        let mut out = Outbox::new();

        let (mut v4, _rx) = flow();
        assert!(v4.local_addr().is_none());
        v4.send_datagram(b"x".to_vec(), "127.0.0.1", 9, &mut out);
        assert!(v4.local_addr().unwrap().is_ipv4());

        match bind_socket(&IpAddr::V6(Ipv6Addr::LOCALHOST)) {
            Ok(socket) => assert!(socket.local_addr().unwrap().is_ipv6()),
            Err(e) if e.raw_os_error() == Some(EAFNOSUPPORT) => {
                eprintln!("skipping IPv6 socket check: {}", e);
            }
            Err(e) => panic!("IPv6 bind failed: {}", e),
        }
    }

    #[tokio::test]
    async fn test_ipv6_datagram_sent_from_ipv6_socket() {
        let echo = match UdpSocket::bind("[::1]:0").await {
            Ok(echo) => echo,
            Err(e) => {
                eprintln!("skipping, no IPv6 loopback: {}", e);
                return;
            }
        };
        let port = echo.local_addr().unwrap().port();

        let (mut flow, _rx) = flow();
        let mut out = Outbox::new();
        flow.send_datagram(b"six".to_vec(), "::1", port, &mut out);
        assert!(!flow.is_closed());
        assert!(flow.local_addr().unwrap().is_ipv6());

        let mut buf = [0u8; 16];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"six");
        assert!(from.is_ipv6());
    }

    #[tokio::test]
    async fn test_other_family_datagram_dropped() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();

        let (mut flow, _rx) = flow();
        let mut out = Outbox::new();
        flow.send_datagram(b"first".to_vec(), "127.0.0.1", port, &mut out);
        let bound = flow.local_addr().unwrap();

        // An IPv6 destination on an IPv4 socket is dropped, the flow stays up
        flow.send_datagram(b"lost".to_vec(), "::1", port, &mut out);
        assert!(!flow.is_closed());
        assert!(!out.has_pending());
        assert_eq!(flow.local_addr(), Some(bound));

        flow.send_datagram(b"second".to_vec(), "127.0.0.1", port, &mut out);
        let mut buf = [0u8; 16];
        let (n, _) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        let (n, _) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[tokio::test]
    async fn test_hostname_rejected() {
        let (mut flow, _rx) = flow();
        let mut out = Outbox::new();
        flow.send_datagram(b"x".to_vec(), "localhost", 53, &mut out);
        assert!(flow.local_addr().is_none());
        assert!(!flow.is_closed());
        assert!(!out.has_pending());
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        let (mut flow, mut rx) = flow();
        let mut out = Outbox::new();
        flow.send_datagram(b"query".to_vec(), "127.0.0.1", echo_addr.port(), &mut out);

        let mut buf = [0u8; 64];
        let (n, from) = echo.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        echo.send_to(b"answer", from).await.unwrap();

        let event = rx.recv().await.unwrap();
        flow.handle_event(event.kind, &mut out);

        let mut bytes = BytesMut::from(out.pending());
        let message = TunnelCodec::new().decode(&mut bytes).unwrap().unwrap();
        assert_eq!(
            parse_request(&message).unwrap(),
            TunnelRequest::Data {
                identifier: 3,
                data: b"answer".to_vec(),
                endpoint: Some(("127.0.0.1".into(), echo_addr.port())),
            }
        );
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let (mut flow, _rx) = flow();
        let mut out = Outbox::new();
        flow.send_datagram(b"x".to_vec(), "127.0.0.1", 9, &mut out);
        assert!(flow.receiver.is_some());

        flow.close(CloseDirection::Read);
        assert!(flow.receiver.is_none());
        assert!(flow.local_addr().is_some());

        flow.close(CloseDirection::Write);
        assert!(flow.is_closed());
        assert!(flow.local_addr().is_none());
    }
}
