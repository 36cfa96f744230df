//! The typed messages two agents exchange, and the framing that carries
//! them over a byte stream.
//!
//! Frames are a 4-byte big-endian length followed by the bincode encoding of
//! a [`Message`]. The encoding only carries envelopes; signatures bind the
//! canonical transaction bytes derived from the details, never the wire
//! encoding, so the framing can change without invalidating agreements.

use libsluice::envelope::{CloseEnvelope, CloseSignatures, OpenEnvelope, OpenSignatures};
use libsluice::keys::Address;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use thiserror::Error;

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Identifies a participant to its peer before any channel exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub channel_account: Address,
    pub signer: Address,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    OpenRequest(OpenEnvelope),
    OpenResponse(OpenSignatures),
    PaymentRequest(CloseEnvelope),
    PaymentResponse(CloseSignatures),
    CloseRequest(CloseEnvelope),
    CloseResponse(CloseSignatures),
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Message::Hello(_) => "Hello",
            Message::OpenRequest(_) => "OpenRequest",
            Message::OpenResponse(_) => "OpenResponse",
            Message::PaymentRequest(_) => "PaymentRequest",
            Message::PaymentResponse(_) => "PaymentResponse",
            Message::CloseRequest(_) => "CloseRequest",
            Message::CloseResponse(_) => "CloseResponse",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Error)]
pub enum MsgError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),
}

impl MsgError {
    /// True when the peer closed the connection.
    pub fn is_eof(&self) -> bool {
        matches!(self, MsgError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Write one length-delimited message.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), MsgError> {
    let encoded = bincode::serialize(message)?;
    let len = u32::try_from(encoded.len()).map_err(|_| MsgError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(MsgError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&encoded)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-delimited message.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, MsgError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(MsgError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len as usize];
    reader.read_exact(&mut frame)?;
    Ok(bincode::deserialize(&frame)?)
}
