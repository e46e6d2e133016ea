// src/server/tests.rs
//! End-to-end tunnel tests over in-memory control connections.

use bytes::BytesMut;
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::config::ServerSettings;
use crate::network::dns::ResolverConfig;
use crate::network::tun::testing::DuplexInterfaceProvider;
use crate::protocol::types::keys;
use crate::protocol::{CloseDirection, CommandType, Message, ResultCode, TunnelCodec};
use crate::server::core::{ServerContext, ServerError, ServerState, TunnelServer};
use crate::server::tunnel::ServerTunnel;

const WAIT: Duration = Duration::from_secs(5);

fn settings() -> ServerSettings {
    ServerSettings::from_value(
        json!({
            "IPv4": {
                "Pool": { "StartAddress": "10.0.0.1", "EndAddress": "10.0.0.4" },
                "Routes": [{ "Address": "10.0.0.0", "Netmask": "255.255.255.0" }]
            }
        }),
        || ResolverConfig {
            servers: vec!["192.0.2.53".into()],
            search_domains: vec!["example.net".into()],
        },
    )
    .unwrap()
}

/// Client end of a tunnel served in the background
struct TestClient {
    reader: FramedRead<ReadHalf<DuplexStream>, TunnelCodec>,
    writer: WriteHalf<DuplexStream>,
    codec: TunnelCodec,
}

impl TestClient {
    async fn send(&mut self, message: &Message) {
        let mut buf = BytesMut::new();
        self.codec.encode(message, &mut buf).unwrap();
        self.writer.write_all(&buf).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.reader.next())
            .await
            .expect("timed out waiting for a message")
            .expect("control connection closed")
            .unwrap()
    }

    /// Next message for `identifier` with the given command
    async fn expect(&mut self, identifier: u64, command: CommandType) -> Message {
        let message = self.recv().await;
        assert_eq!(message.identifier(), Some(identifier), "{:?}", message);
        assert_eq!(message.command_code(), Some(command.code()), "{:?}", message);
        message
    }
}

struct Harness {
    client: TestClient,
    context: Arc<ServerContext>,
    interfaces: Arc<DuplexInterfaceProvider>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ServerError>>,
}

fn start() -> Harness {
    let interfaces = Arc::new(DuplexInterfaceProvider::default());
    let context = Arc::new(ServerContext::new(settings(), interfaces.clone()));
    let cancel = CancellationToken::new();

    let (server, client) = tokio::io::duplex(256 * 1024);
    let (server_reader, server_writer) = tokio::io::split(server);
    let tunnel = ServerTunnel::new(server_reader, server_writer, context.clone(), cancel.clone());
    let task = tokio::spawn(tunnel.run());

    let (reader, writer) = tokio::io::split(client);
    Harness {
        client: TestClient {
            reader: FramedRead::new(reader, TunnelCodec::new()),
            writer,
            codec: TunnelCodec::new(),
        },
        context,
        interfaces,
        cancel,
        task,
    }
}

fn open_ip(identifier: u64) -> Message {
    Message::new(identifier, CommandType::Open).with(keys::TUNNEL_LAYER, 1)
}

fn open_tcp(identifier: u64, port: u16) -> Message {
    Message::new(identifier, CommandType::Open)
        .with(keys::TUNNEL_LAYER, 0)
        .with(keys::FLOW_KIND, 1)
        .with(keys::HOST, "127.0.0.1")
        .with(keys::PORT, port)
}

fn assigned_address(message: &Message) -> String {
    message.get_object(keys::CONFIGURATION).unwrap()["IPv4"]["Address"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_ip_flows_exhaust_pool() {
    let mut h = start();

    let mut addresses = Vec::new();
    for identifier in 1..=3 {
        h.client.send(&open_ip(identifier)).await;
        let reply = h.client.expect(identifier, CommandType::OpenResult).await;
        assert_eq!(reply.get_u64(keys::RESULT_CODE), Some(ResultCode::Success.code()));
        let configuration = reply.get_object(keys::CONFIGURATION).unwrap();
        assert_eq!(configuration["IPv4"]["Netmask"], "255.255.255.255");
        assert!(configuration["IPv4"].get("Pool").is_none());
        addresses.push(assigned_address(&reply));
    }
    assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

    h.client.send(&open_ip(4)).await;
    let reply = h.client.expect(4, CommandType::OpenResult).await;
    assert_eq!(reply.get_u64(keys::RESULT_CODE), Some(ResultCode::Refused.code()));
    assert!(reply.get(keys::CONFIGURATION).is_none());

    // Closing a flow hands its address to the next one
    h.client.send(&Message::new(2, CommandType::Close)).await;
    h.client.send(&open_ip(5)).await;
    let reply = h.client.expect(5, CommandType::OpenResult).await;
    assert_eq!(assigned_address(&reply), "10.0.0.2");
}

#[tokio::test]
async fn test_unreachable_tcp_endpoint() {
    let mut h = start();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    h.client.send(&open_tcp(7, port)).await;
    let reply = h.client.expect(7, CommandType::OpenResult).await;
    assert_eq!(reply.get_u64(keys::RESULT_CODE), Some(ResultCode::Refused.code()));
    let close = h.client.expect(7, CommandType::Close).await;
    assert_eq!(close.get_u64(keys::CLOSE_TYPE), Some(CloseDirection::All.code()));

    // The identifier is free again
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    h.client.send(&open_tcp(7, port)).await;
    let reply = h.client.expect(7, CommandType::OpenResult).await;
    assert_eq!(reply.get_u64(keys::RESULT_CODE), Some(ResultCode::Success.code()));
}

#[tokio::test]
async fn test_fetch_configuration() {
    let mut h = start();
    h.client
        .send(&Message::new(0, CommandType::FetchConfiguration))
        .await;

    let reply = h.client.expect(0, CommandType::FetchConfiguration).await;
    let configuration = Value::Object(reply.get_object(keys::CONFIGURATION).unwrap().clone());
    assert_eq!(
        configuration,
        json!({ "DNS": { "Servers": ["192.0.2.53"], "SearchDomains": ["example.net"] } })
    );
}

#[tokio::test]
async fn test_tcp_echo_through_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
    });

    let mut h = start();
    h.client.send(&open_tcp(9, port)).await;
    let reply = h.client.expect(9, CommandType::OpenResult).await;
    assert_eq!(reply.get_u64(keys::RESULT_CODE), Some(ResultCode::Success.code()));

    h.client
        .send(&Message::new(9, CommandType::Data).with_bytes(keys::DATA, b"ping"))
        .await;
    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        let message = h.client.expect(9, CommandType::Data).await;
        echoed.extend(message.get_bytes(keys::DATA).unwrap().unwrap());
    }
    assert_eq!(echoed, b"ping");

    // Half-closing our side ends the echo, which closes the remote side
    h.client
        .send(&Message::new(9, CommandType::Close).with(keys::CLOSE_TYPE, CloseDirection::Write.code()))
        .await;
    let close = h.client.expect(9, CommandType::Close).await;
    assert_eq!(close.get_u64(keys::CLOSE_TYPE), Some(CloseDirection::Write.code()));
}

#[tokio::test]
async fn test_ip_packets_framed_on_interface() {
    let mut h = start();
    h.client.send(&open_ip(1)).await;
    h.client.expect(1, CommandType::OpenResult).await;
    let mut interface = h.interfaces.take(Ipv4Addr::new(10, 0, 0, 1)).unwrap();

    h.client
        .send(
            &Message::new(1, CommandType::Packets)
                .with(keys::PACKETS, vec![base64::encode([0x45u8, 0, 0, 20])])
                .with(keys::PROTOCOLS, vec![2]),
        )
        .await;
    let mut frame = [0u8; 8];
    timeout(WAIT, interface.read_exact(&mut frame)).await.unwrap().unwrap();
    assert_eq!(frame, [0, 0, 0, 2, 0x45, 0, 0, 20]);

    interface.write_all(&[0, 0, 0, 2, 0x45, 1, 2]).await.unwrap();
    let message = h.client.expect(1, CommandType::Packets).await;
    assert_eq!(message.get(keys::PROTOCOLS), Some(&json!([2])));
    assert_eq!(
        message.get(keys::PACKETS),
        Some(&json!([base64::encode([0x45u8, 1, 2])]))
    );
}

#[tokio::test]
async fn test_oversize_message_ends_tunnel() {
    let mut h = start();
    h.client.send(&open_ip(1)).await;
    h.client.expect(1, CommandType::OpenResult).await;
    assert_eq!(h.context.address_pool.available(), 2);

    h.client.writer.write_all(&[0, 0x10, 0, 0]).await.unwrap();
    let result = timeout(WAIT, h.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Protocol(_))));
    assert_eq!(h.context.address_pool.available(), 3);
}

#[tokio::test]
async fn test_cancel_releases_flows() {
    let mut h = start();
    h.client.send(&open_ip(1)).await;
    h.client.expect(1, CommandType::OpenResult).await;

    h.cancel.cancel();
    let result = timeout(WAIT, h.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(h.context.address_pool.available(), 3);
}

#[tokio::test]
async fn test_server_accepts_and_shuts_down() {
    let context = Arc::new(ServerContext::new(
        settings(),
        Arc::new(DuplexInterfaceProvider::default()),
    ));
    let server = Arc::new(
        TunnelServer::bind("127.0.0.1:0".parse().unwrap(), context)
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let running = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut codec = TunnelCodec::new();
    let mut buf = BytesMut::new();
    codec
        .encode(&Message::new(0, CommandType::FetchConfiguration), &mut buf)
        .unwrap();
    writer.write_all(&buf).await.unwrap();

    let mut reader = FramedRead::new(reader, TunnelCodec::new());
    let reply = timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.command_code(), Some(CommandType::FetchConfiguration.code()));
    assert_eq!(server.tunnels().len(), 1);
    assert_eq!(server.state().await, ServerState::Running);

    server.shutdown().await;
    timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(server.state().await, ServerState::Stopped);

    // The tunnel task drops its end of the connection
    assert!(timeout(WAIT, reader.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_server_errors() {
    let context = Arc::new(ServerContext::new(
        settings(),
        Arc::new(DuplexInterfaceProvider::default()),
    ));
    let server = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), context.clone())
        .await
        .unwrap();

    // A second listener on the same address fails with the bind error
    let taken = server.local_addr().unwrap();
    match TunnelServer::bind(taken, context).await {
        Err(ServerError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("bound an address in use"),
    }

    // A server that was shut down cannot be run
    server.shutdown().await;
    assert!(matches!(server.run().await, Err(ServerError::Internal(_))));
}

#[tokio::test]
async fn test_message_split_across_reads() {
    let mut encoded = BytesMut::new();
    TunnelCodec::new()
        .encode(&Message::new(0, CommandType::FetchConfiguration), &mut encoded)
        .unwrap();
    // Header arrives as 1 + 3 bytes, then the payload
    let reader = tokio_test::io::Builder::new()
        .read(&encoded[..1])
        .read(&encoded[1..4])
        .read(&encoded[4..])
        .build();

    let context = Arc::new(ServerContext::new(
        settings(),
        Arc::new(DuplexInterfaceProvider::default()),
    ));
    let (writer, client) = tokio::io::duplex(64 * 1024);
    let result = ServerTunnel::new(reader, writer, context, CancellationToken::new())
        .run()
        .await;
    assert!(result.is_ok());

    let mut replies = FramedRead::new(client, TunnelCodec::new());
    let reply = timeout(WAIT, replies.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(reply.command_code(), Some(CommandType::FetchConfiguration.code()));
    assert!(timeout(WAIT, replies.next()).await.unwrap().is_none());
}
