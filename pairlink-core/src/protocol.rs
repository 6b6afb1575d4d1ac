//! LAN discovery messages. Session traffic itself is raw bytes and has no message type.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current discovery protocol version. Also sent in the TCP service preamble.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Advertise presence: human-readable name, offered service, transport listen port.
    Beacon {
        protocol_version: u8,
        device_name: String,
        service_id: Uuid,
        listen_port: u16,
    },
}

impl Message {
    pub fn beacon(device_name: impl Into<String>, service_id: Uuid, listen_port: u16) -> Self {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            device_name: device_name.into(),
            service_id,
            listen_port,
        }
    }
}
