//! Control protocol between file servers.
//!
//! Messages travel bincode encoded inside framed control RPCs. Bulk file data
//! never goes through a message; it follows on the same connection as a raw
//! stream whose length the message (or the stream header) announces.
//!
//! ```text
//! store:   A ── StoreFile{op,key,size} ─▶ B
//!          A ◀───────── Ack{op} ──────── B
//!          A ── 0x2 ‖ ciphertext[size] ─▶ B
//!
//! get:     A ──── GetFile{op,key} ─────▶ B
//!          A ◀─ 0x2 ‖ len:u64 LE ‖ ciphertext[len] ── B   (len 0: miss)
//!
//! remove:  A ─── RemoveFile{op,key} ───▶ B
//!          A ◀───────── Ack{op} ──────── B
//! ```

use crate::node::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Identifies one operation on its originating node; acknowledgements carry
/// it back.
pub type OperationId = u64;

/// Control message carried in an RPC payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sender is about to stream `size` bytes of ciphertext for `key`
    StoreFile {
        /// Operation awaiting the ack
        op: OperationId,
        /// Network key
        key: String,
        /// Ciphertext length, IV included
        size: u64,
    },
    /// Sender wants `key` streamed back
    GetFile {
        /// Requesting operation
        op: OperationId,
        /// Network key
        key: String,
    },
    /// Sender asks for `key` to be deleted
    RemoveFile {
        /// Operation awaiting the ack
        op: OperationId,
        /// Network key
        key: String,
    },
    /// Acknowledges the operation `op`
    Ack {
        /// Acknowledged operation
        op: OperationId,
    },
}

impl Message {
    /// Encode for the wire.
    ///
    /// # Errors
    /// Returns `NodeError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NodeError::Serialization(Cow::Owned(e.to_string())))
    }

    /// Decode a received payload.
    ///
    /// # Errors
    /// Returns `NodeError::Decode` for malformed payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| NodeError::Decode(Cow::Owned(format!("invalid control message: {e}"))))
    }

    /// Operation the message belongs to
    #[must_use]
    pub fn op(&self) -> OperationId {
        match self {
            Message::StoreFile { op, .. }
            | Message::GetFile { op, .. }
            | Message::RemoveFile { op, .. }
            | Message::Ack { op } => *op,
        }
    }

    /// Variant name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StoreFile { .. } => "store_file",
            Message::GetFile { .. } => "get_file",
            Message::RemoveFile { .. } => "remove_file",
            Message::Ack { .. } => "ack",
        }
    }
}
