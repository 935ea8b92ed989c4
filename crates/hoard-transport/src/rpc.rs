//! Decoded wire units.

use serde::{Deserialize, Serialize};

/// Frame tag: a length-prefixed control message follows
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Frame tag: raw stream bytes follow, owned by whoever accepts the stream
pub const INCOMING_STREAM: u8 = 0x2;

/// Largest control payload accepted from the wire (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One decoded unit from a peer connection.
///
/// `from` is filled in by the receiving transport with the remote address, so
/// whatever a sender put there is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    /// Remote address of the sending peer
    pub from: String,
    /// Control message bytes (empty for stream markers)
    pub payload: Vec<u8>,
    /// A raw byte stream follows this frame on the same connection
    pub stream: bool,
}

impl Rpc {
    /// A control message frame
    #[must_use]
    pub fn message(payload: Vec<u8>) -> Self {
        Self {
            from: String::new(),
            payload,
            stream: false,
        }
    }

    /// A stream-begin marker
    #[must_use]
    pub fn stream_begin() -> Self {
        Self {
            from: String::new(),
            payload: Vec::new(),
            stream: true,
        }
    }
}
