//! Discovery datagram codec. One datagram carries exactly one bincode-encoded [`Message`];
//! the datagram boundary is the frame, so there is no length prefix.

use bincode::Options;

use crate::protocol::Message;

/// Largest beacon accepted or produced. Stays under a typical LAN MTU.
pub const MAX_DATAGRAM_LEN: usize = 512;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_LEN as u64)
        .reject_trailing_bytes()
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram too large")]
    TooLarge,
    #[error("codec error: {0}")]
    Codec(bincode::Error),
}

impl From<bincode::Error> for WireError {
    fn from(e: bincode::Error) -> Self {
        if matches!(*e, bincode::ErrorKind::SizeLimit) {
            WireError::TooLarge
        } else {
            WireError::Codec(e)
        }
    }
}

pub fn encode_datagram(msg: &Message) -> Result<Vec<u8>, WireError> {
    Ok(codec().serialize(msg)?)
}

/// Decode a whole datagram. Truncated input and trailing bytes are both errors.
pub fn decode_datagram(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::TooLarge);
    }
    Ok(codec().deserialize(bytes)?)
}
