//! Binary wire protocol
//!
//! Every WebSocket binary message starts with a one-byte kind tag followed by
//! the payload:
//!
//! | Byte | Direction       | Payload            |
//! |------|-----------------|--------------------|
//! | 0x00 | server → client | none (handshake)   |
//! | 0x01 | both            | encoded audio      |
//! | 0x02 | server → client | UTF-8 text         |

use thiserror::Error;

/// Message kind tag carried in the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 0x00,
    Audio = 0x01,
    Text = 0x02,
}

impl MessageKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageKind::Handshake),
            0x01 => Ok(MessageKind::Audio),
            0x02 => Ok(MessageKind::Text),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Malformed inbound messages. These are logged and skipped, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("message kind {0:?} is not accepted from clients")]
    Unexpected(MessageKind),
}

/// A message received from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Encoded audio bytes for the frame codec's decoder
    Audio(Vec<u8>),
}

impl ClientFrame {
    /// Demultiplex a raw binary message by its kind byte
    pub fn parse(message: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind, payload) = message.split_first().ok_or(ProtocolError::Empty)?;
        match MessageKind::try_from(kind)? {
            MessageKind::Audio => Ok(ClientFrame::Audio(payload.to_vec())),
            other => Err(ProtocolError::Unexpected(other)),
        }
    }
}

/// A message sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Session is primed and ready for live audio
    Handshake,
    /// Encoded audio chunk produced by the frame codec's encoder
    Audio(Vec<u8>),
    /// Incremental text token
    Text(String),
}

impl ServerFrame {
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerFrame::Handshake => MessageKind::Handshake,
            ServerFrame::Audio(_) => MessageKind::Audio,
            ServerFrame::Text(_) => MessageKind::Text,
        }
    }

    /// Serialize to the binary wire format
    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = match self {
            ServerFrame::Handshake => &[],
            ServerFrame::Audio(bytes) => bytes,
            ServerFrame::Text(text) => text.as_bytes(),
        };
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(self.kind().as_byte());
        out.extend_from_slice(payload);
        out
    }
}
