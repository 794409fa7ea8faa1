//! Protocol Module
//!
//! Defines the wire protocol shared by nodes and clients.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │   bincode(Message)          │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Message Kinds
//! - 0x10..0x14: elections and log shipping (primary-secondary)
//! - 0x20..0x26: quorum writes, reads and anti-entropy (masterless)
//! - 0x30, 0x31: client command and reply
//! - 0x3f: error
//!
//! ### Client Status Codes
//! - 0x00: OK
//! - 0x01: NOT_FOUND
//! - 0x02: ERROR
//! - 0x03: NOT_LEADER
//! - 0x04: CONFLICT

mod codec;
mod command;
mod message;
mod response;

pub use codec::{
    decode_message, encode_message, read_message, round_trip, write_message, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use command::{Command, CommandType};
pub use message::{Message, MessageKind};
pub use response::{Response, Status};
