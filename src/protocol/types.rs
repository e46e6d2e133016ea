// src/protocol/types.rs
//! Control message types.
//!
//! A control message is a JSON object. Every message carries an
//! `identifier` naming the flow it belongs to and a `command-type`; the
//! remaining keys depend on the command. Byte blobs travel as base64 strings.

use serde_json::{Map, Value};
use thiserror::Error;

/// Error type for protocol message handling
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessageError {
    /// Errors after which the control stream cannot be trusted
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            MessageError::InvalidFormat(_)
                | MessageError::MessageTooLarge(_)
                | MessageError::Serialization(_)
                | MessageError::Io(_)
        )
    }
}

/// Message keys
pub mod keys {
    pub const IDENTIFIER: &str = "identifier";
    pub const COMMAND_TYPE: &str = "command-type";
    pub const TUNNEL_LAYER: &str = "tunnel-layer";
    pub const FLOW_KIND: &str = "flow-kind";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const RESULT_CODE: &str = "result-code";
    pub const CLOSE_TYPE: &str = "close-type";
    pub const CONFIGURATION: &str = "configuration";
    pub const DATA: &str = "data";
    pub const PACKETS: &str = "packets";
    pub const PROTOCOLS: &str = "protocols";
}

/// Declares a wire enum with fixed integer codes
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Integer carried on the wire
            pub fn code(self) -> u64 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            /// Look up a wire code
            pub fn from_code(code: u64) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Command carried by a message
    CommandType {
        Data = 1,
        Suspend = 2,
        Resume = 3,
        Close = 4,
        Open = 6,
        OpenResult = 7,
        Packets = 8,
        FetchConfiguration = 9,
    }
}

wire_enum! {
    /// Layer a flow is opened at
    TunnelLayer {
        App = 0,
        Ip = 1,
    }
}

wire_enum! {
    /// Transport of an app-layer flow
    FlowKind {
        Tcp = 1,
        Udp = 3,
    }
}

wire_enum! {
    /// Outcome of an open
    ResultCode {
        Success = 0,
        InvalidParam = 1,
        NoSuchHost = 2,
        Refused = 3,
        Timeout = 4,
        InternalError = 5,
    }
}

wire_enum! {
    /// Direction(s) a close applies to
    CloseDirection {
        None = 1,
        Read = 2,
        Write = 3,
        All = 4,
    }
}

impl CloseDirection {
    pub fn closes_read(self) -> bool {
        matches!(self, CloseDirection::Read | CloseDirection::All)
    }

    pub fn closes_write(self) -> bool {
        matches!(self, CloseDirection::Write | CloseDirection::All)
    }
}

/// A control message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    /// Create a message for a flow
    pub fn new(identifier: u64, command: CommandType) -> Self {
        let mut fields = Map::new();
        fields.insert(keys::IDENTIFIER.to_string(), Value::from(identifier));
        fields.insert(keys::COMMAND_TYPE.to_string(), Value::from(command.code()));
        Self { fields }
    }

    /// Add a field
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Add a byte blob as base64
    pub fn with_bytes(self, key: &str, bytes: &[u8]) -> Self {
        self.with(key, base64::encode(bytes))
    }

    pub fn identifier(&self) -> Option<u64> {
        self.get_u64(keys::IDENTIFIER)
    }

    pub fn command_code(&self) -> Option<u64> {
        self.get_u64(keys::COMMAND_TYPE)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.fields.get(key).and_then(Value::as_object)
    }

    /// Decode a base64 field, `None` when absent
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, MessageError> {
        match self.fields.get(key) {
            None => Ok(None),
            Some(Value::String(encoded)) => base64::decode(encoded)
                .map(Some)
                .map_err(|e| MessageError::InvalidValue(format!("{}: {}", key, e))),
            Some(_) => Err(MessageError::InvalidValue(format!("{} is not a string", key))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}
