//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │   bincode(Message)          │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//! The length is big-endian and excludes the 5-byte header.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{HarborError, Result};

use super::{Command, Message, MessageKind, Response};

/// Header size: 1 byte kind + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Message Encoding/Decoding
// =============================================================================

/// Encode a message into a single frame
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(HarborError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_u8(message.kind() as u8);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decode a message from a complete frame
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < HEADER_SIZE {
        return Err(HarborError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }

    let (kind, payload_len) = parse_header(&bytes[..HEADER_SIZE])?;

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(HarborError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }

    decode_payload(kind, &bytes[HEADER_SIZE..total_len])
}

fn parse_header(header: &[u8]) -> Result<(MessageKind, usize)> {
    let kind = MessageKind::from_byte(header[0]).ok_or_else(|| {
        HarborError::Protocol(format!("Unknown message kind: 0x{:02x}", header[0]))
    })?;
    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(HarborError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok((kind, payload_len as usize))
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<Message> {
    let message: Message = bincode::deserialize(payload)
        .map_err(|e| HarborError::Protocol(format!("Malformed {:?} payload: {}", kind, e)))?;
    if message.kind() != kind {
        return Err(HarborError::Protocol(format!(
            "Frame kind {:?} does not match payload {:?}",
            kind,
            message.kind()
        )));
    }
    Ok(message)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete message from a stream
///
/// Blocks until a complete message is received or an error occurs
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let (kind, payload_len) = parse_header(&header)?;

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    decode_payload(kind, &payload)
}

/// Write a message to a stream
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode_message(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Send a client command and wait for its reply
pub fn round_trip<S: Read + Write>(stream: &mut S, command: Command) -> Result<Response> {
    write_message(stream, &Message::Client(command))?;
    match read_message(stream)? {
        Message::ClientReply(response) => Ok(response),
        Message::Error { message } => Err(HarborError::Protocol(message)),
        other => Err(HarborError::Protocol(format!(
            "Unexpected reply: {:?}",
            other.kind()
        ))),
    }
}
