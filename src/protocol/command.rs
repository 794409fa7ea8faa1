//! Command definitions
//!
//! Represents commands from clients.

use serde::{Deserialize, Serialize};

/// Command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    Get = 0x01,
    Set = 0x02,
    Delete = 0x03,
    Ping = 0x04,
    BulkSet = 0x05,
    DeleteRange = 0x06,
    Status = 0x07,
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Get a value by key
    Get { key: Vec<u8> },

    /// Set a key-value pair
    Set { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },

    /// Atomically set several pairs
    BulkSet { pairs: Vec<(Vec<u8>, Vec<u8>)> },

    /// Atomically delete every key in `[start, end)`
    DeleteRange { start: Vec<u8>, end: Vec<u8> },

    /// Ping (health check)
    Ping,

    /// Node role, term, leader and storage counters
    Status,
}

impl Command {
    /// Get the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Get { .. } => CommandType::Get,
            Command::Set { .. } => CommandType::Set,
            Command::Delete { .. } => CommandType::Delete,
            Command::BulkSet { .. } => CommandType::BulkSet,
            Command::DeleteRange { .. } => CommandType::DeleteRange,
            Command::Ping => CommandType::Ping,
            Command::Status => CommandType::Status,
        }
    }

    /// Whether the command mutates data
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Delete { .. }
                | Command::BulkSet { .. }
                | Command::DeleteRange { .. }
        )
    }
}
