// src/server/outbox.rs
//! Outbound control stream buffer.
//!
//! Messages for the client are encoded straight into this buffer. The
//! tunnel drains it into the control stream without blocking and uses its
//! fill level to apply backpressure to every flow.

use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};
use tokio_util::codec::Encoder;
use tracing::{error, trace};

use crate::protocol::types::keys;
use crate::protocol::{CloseDirection, CommandType, Message, ResultCode, TunnelCodec};

/// Encoded messages waiting for the control stream
#[derive(Debug, Default)]
pub struct Outbox {
    buffer: BytesMut,
    codec: TunnelCodec,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message
    pub fn send(&mut self, message: &Message) {
        match self.codec.encode(message, &mut self.buffer) {
            Ok(()) => trace!(
                "Queued command {:?} for flow {:?}, {} bytes pending",
                message.command_code(),
                message.identifier(),
                self.buffer.len()
            ),
            Err(e) => error!("Dropping outbound message: {}", e),
        }
    }

    /// Bytes not yet written
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop bytes the control stream accepted
    pub fn consume(&mut self, written: usize) {
        self.buffer.advance(written);
    }

    pub fn send_data(&mut self, identifier: u64, data: &[u8]) {
        self.send(&Message::new(identifier, CommandType::Data).with_bytes(keys::DATA, data));
    }

    /// A datagram received from `host`:`port`
    pub fn send_datagram(&mut self, identifier: u64, data: &[u8], host: &str, port: u16) {
        self.send(
            &Message::new(identifier, CommandType::Data)
                .with_bytes(keys::DATA, data)
                .with(keys::HOST, host)
                .with(keys::PORT, port),
        );
    }

    pub fn send_suspend(&mut self, identifier: u64) {
        self.send(&Message::new(identifier, CommandType::Suspend));
    }

    pub fn send_resume(&mut self, identifier: u64) {
        self.send(&Message::new(identifier, CommandType::Resume));
    }

    pub fn send_close(&mut self, identifier: u64, direction: CloseDirection) {
        self.send(
            &Message::new(identifier, CommandType::Close).with(keys::CLOSE_TYPE, direction.code()),
        );
    }

    pub fn send_open_result(
        &mut self,
        identifier: u64,
        result: ResultCode,
        configuration: Option<Map<String, Value>>,
    ) {
        let mut message =
            Message::new(identifier, CommandType::OpenResult).with(keys::RESULT_CODE, result.code());
        if let Some(configuration) = configuration {
            message = message.with(keys::CONFIGURATION, Value::Object(configuration));
        }
        self.send(&message);
    }

    /// A batch of interface frames as parallel `packets`/`protocols` arrays
    pub fn send_packets(&mut self, identifier: u64, packets: &[(u32, Vec<u8>)]) {
        let (protocols, packets): (Vec<Value>, Vec<Value>) = packets
            .iter()
            .map(|(protocol, packet)| (Value::from(*protocol), Value::from(base64::encode(packet))))
            .unzip();

        self.send(
            &Message::new(identifier, CommandType::Packets)
                .with(keys::PACKETS, packets)
                .with(keys::PROTOCOLS, protocols),
        );
    }

    /// Reply to a configuration fetch
    pub fn send_configuration(&mut self, configuration: Map<String, Value>) {
        self.send(
            &Message::new(0, CommandType::FetchConfiguration)
                .with(keys::CONFIGURATION, Value::Object(configuration)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::MAX_MESSAGE_SIZE;
    use crate::protocol::{parse_request, TunnelRequest};
    use serde_json::json;
    use tokio_util::codec::Decoder;

    fn drain(outbox: &mut Outbox) -> Vec<Message> {
        let mut buf = BytesMut::from(outbox.pending());
        outbox.consume(buf.len());
        let mut codec = TunnelCodec::new();
        let mut messages = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_messages_are_framed_in_order() {
        let mut outbox = Outbox::new();
        outbox.send_suspend(4);
        outbox.send_close(4, CloseDirection::Write);
        outbox.send_open_result(5, ResultCode::Refused, None);

        let messages = drain(&mut outbox);
        assert!(!outbox.has_pending());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].command_code(), Some(2));
        assert_eq!(messages[1].get_u64(keys::CLOSE_TYPE), Some(3));
        assert_eq!(messages[2].get_u64(keys::RESULT_CODE), Some(3));
        assert!(messages[2].get(keys::CONFIGURATION).is_none());
    }

    #[test]
    fn test_partial_consume() {
        let mut outbox = Outbox::new();
        outbox.send_resume(1);
        let total = outbox.pending().len();
        outbox.consume(3);
        assert_eq!(outbox.pending().len(), total - 3);
    }

    #[test]
    fn test_datagram_and_packets_parse_back() {
        let mut outbox = Outbox::new();
        outbox.send_datagram(6, b"answer", "10.0.0.53", 53);
        outbox.send_packets(1, &[(2, vec![0x45, 1]), (30, vec![0x60])]);

        let messages = drain(&mut outbox);
        assert_eq!(
            parse_request(&messages[0]).unwrap(),
            TunnelRequest::Data {
                identifier: 6,
                data: b"answer".to_vec(),
                endpoint: Some(("10.0.0.53".into(), 53)),
            }
        );
        assert_eq!(
            parse_request(&messages[1]).unwrap(),
            TunnelRequest::Packets {
                identifier: 1,
                packets: vec![(2, vec![0x45, 1]), (30, vec![0x60])],
            }
        );
    }

    #[test]
    fn test_configuration_reply() {
        let mut outbox = Outbox::new();
        let configuration = json!({ "DNS": { "Servers": ["10.0.0.53"] } });
        outbox.send_configuration(configuration.as_object().unwrap().clone());

        let messages = drain(&mut outbox);
        assert_eq!(messages[0].identifier(), Some(0));
        assert_eq!(messages[0].command_code(), Some(9));
        assert_eq!(messages[0].get(keys::CONFIGURATION), Some(&configuration));
    }

    #[test]
    fn test_oversize_message_dropped() {
        let mut outbox = Outbox::new();
        outbox.send_data(1, &vec![0u8; MAX_MESSAGE_SIZE]);
        assert!(!outbox.has_pending());
    }
}
