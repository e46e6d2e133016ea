// src/protocol/serialization.rs
//! Control message framing.
//!
//! Each message on the control stream is a 4-byte big-endian length
//! (covering the header itself) followed by the JSON-encoded message.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::constants::{LENGTH_HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::protocol::types::{Message, MessageError};

/// Decoder position within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for a complete length header
    ReadingLength,
    /// Waiting for `remaining` payload bytes
    ReadingPayload { remaining: usize },
}

/// Length-prefixed message codec for the control stream
#[derive(Debug)]
pub struct TunnelCodec {
    state: DecodeState,
}

impl TunnelCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingLength,
        }
    }
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TunnelCodec {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, MessageError> {
        loop {
            match self.state {
                DecodeState::ReadingLength => {
                    if src.len() < LENGTH_HEADER_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if length > MAX_MESSAGE_SIZE {
                        return Err(MessageError::MessageTooLarge(length));
                    }
                    if length < LENGTH_HEADER_SIZE {
                        return Err(MessageError::InvalidFormat(format!(
                            "declared length {} is shorter than the header",
                            length
                        )));
                    }

                    src.advance(LENGTH_HEADER_SIZE);
                    let remaining = length - LENGTH_HEADER_SIZE;
                    src.reserve(remaining);
                    self.state = DecodeState::ReadingPayload { remaining };
                }
                DecodeState::ReadingPayload { remaining } => {
                    if src.len() < remaining {
                        return Ok(None);
                    }

                    let payload = src.split_to(remaining);
                    self.state = DecodeState::ReadingLength;

                    return match serde_json::from_slice::<Value>(&payload)? {
                        Value::Object(fields) => {
                            trace!("Decoded message of {} bytes", remaining);
                            Ok(Some(Message::from(fields)))
                        }
                        _ => Err(MessageError::InvalidFormat(
                            "message is not a mapping".into(),
                        )),
                    };
                }
            }
        }
    }
}

impl Encoder<&Message> for TunnelCodec {
    type Error = MessageError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), MessageError> {
        let payload = serde_json::to_vec(message.as_map())?;
        let length = payload.len() + LENGTH_HEADER_SIZE;
        if length > MAX_MESSAGE_SIZE {
            return Err(MessageError::MessageTooLarge(length));
        }

        dst.reserve(length);
        dst.put_u32(length as u32);
        dst.extend_from_slice(&payload);

        trace!("Encoded message of {} bytes", length);
        Ok(())
    }
}
