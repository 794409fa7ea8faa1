//! Response definitions
//!
//! Represents responses to clients.

use serde::{Deserialize, Serialize};

use crate::cluster::{NodeId, Versioned};
use crate::error::{HarborError, Result};

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    Error = 0x02,
    /// Payload holds the known leader id, if any
    NotLeader = 0x03,
    /// Payload holds the bincode-encoded concurrent siblings
    Conflict = 0x04,
}

/// A response to send to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload (value for GET, error message for ERROR)
    pub payload: Option<Vec<u8>>,
}

impl Response {
    /// Create an OK response with optional payload
    pub fn ok(payload: Option<Vec<u8>>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    /// Create a NOT_FOUND response
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: None,
        }
    }

    /// Create an ERROR response
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: Some(message.as_bytes().to_vec()),
        }
    }

    pub fn not_leader(leader: Option<NodeId>) -> Self {
        Self {
            status: Status::NotLeader,
            payload: leader.map(|id| id.to_string().into_bytes()),
        }
    }

    pub fn conflict(siblings: &[Versioned]) -> Result<Self> {
        Ok(Self {
            status: Status::Conflict,
            payload: Some(bincode::serialize(siblings)?),
        })
    }

    /// Map an operation outcome onto a response
    pub fn from_result(result: Result<Option<Vec<u8>>>) -> Self {
        match result {
            Ok(payload) => Self::ok(payload),
            Err(HarborError::KeyNotFound) => Self::not_found(),
            Err(HarborError::NotLeader { leader }) => Self::not_leader(leader),
            Err(HarborError::ConcurrentWriteConflict { siblings }) => Self::conflict(&siblings)
                .unwrap_or_else(|e| Self::error(&e.to_string())),
            Err(e) => Self::error(&e.to_string()),
        }
    }

    /// Leader hint carried by a NOT_LEADER response
    pub fn leader_hint(&self) -> Option<NodeId> {
        if self.status != Status::NotLeader {
            return None;
        }
        let text = std::str::from_utf8(self.payload.as_deref()?).ok()?;
        text.parse().ok()
    }

    /// Siblings carried by a CONFLICT response
    pub fn siblings(&self) -> Result<Vec<Versioned>> {
        match (&self.status, &self.payload) {
            (Status::Conflict, Some(payload)) => Ok(bincode::deserialize(payload)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Payload as UTF-8 text, lossy
    pub fn text(&self) -> String {
        self.payload
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }
}
