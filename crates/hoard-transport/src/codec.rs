//! Frame codecs.
//!
//! Two wire formats are provided:
//!
//! - [`LengthPrefixedCodec`] (default): a tag byte per frame.
//!
//!   ```text
//!   0x1 │ len: u32 BE │ payload[len]     control message
//!   0x2                                  stream begin, raw bytes follow
//!   ```
//!
//! - [`ObjectCodec`]: each frame is a `u32` BE length followed by a bincode
//!   encoded [`Rpc`]. Only suitable between trusted peers, since the whole
//!   envelope is deserialized before validation.

use crate::rpc::{INCOMING_MESSAGE, INCOMING_STREAM, MAX_FRAME_SIZE, Rpc};
use crate::transport::{TransportError, TransportResult};
use crate::{DynReader, DynWriter};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Reads one frame at a time off a connection.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decode the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    ///
    /// # Errors
    /// Returns `TransportError::Decode` for malformed frames and
    /// `TransportError::Io` if the connection fails mid-frame.
    async fn decode(&self, reader: &mut DynReader) -> TransportResult<Option<Rpc>>;
}

/// Writes frames onto a connection.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Write a control message frame and flush.
    ///
    /// # Errors
    /// Returns `TransportError` if the payload is too large or the write fails.
    async fn encode_message(&self, writer: &mut DynWriter, payload: &[u8]) -> TransportResult<()>;

    /// Write a stream-begin marker. Raw bytes written afterwards bypass the
    /// codec.
    ///
    /// # Errors
    /// Returns `TransportError` if the write fails.
    async fn encode_stream_begin(&self, writer: &mut DynWriter) -> TransportResult<()>;
}

fn check_len(len: usize) -> TransportResult<()> {
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Decode(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"
        )));
    }
    Ok(())
}

/// Read the first byte of a frame, mapping EOF to `None`.
async fn read_first(reader: &mut DynReader) -> TransportResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Tag-byte codec used on production connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

#[async_trait]
impl Decoder for LengthPrefixedCodec {
    async fn decode(&self, reader: &mut DynReader) -> TransportResult<Option<Rpc>> {
        let Some(tag) = read_first(reader).await? else {
            return Ok(None);
        };

        match tag {
            INCOMING_STREAM => Ok(Some(Rpc::stream_begin())),
            INCOMING_MESSAGE => {
                let len = reader.read_u32().await? as usize;
                check_len(len)?;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Ok(Some(Rpc::message(payload)))
            }
            other => Err(TransportError::Decode(format!(
                "unknown frame tag {other:#04x}"
            ))),
        }
    }
}

#[async_trait]
impl Encoder for LengthPrefixedCodec {
    async fn encode_message(&self, writer: &mut DynWriter, payload: &[u8]) -> TransportResult<()> {
        check_len(payload.len())?;
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(INCOMING_MESSAGE);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn encode_stream_begin(&self, writer: &mut DynWriter) -> TransportResult<()> {
        writer.write_all(&[INCOMING_STREAM]).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Whole-envelope bincode codec for trusted peers and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectCodec;

impl ObjectCodec {
    async fn write_rpc(writer: &mut DynWriter, rpc: &Rpc) -> TransportResult<()> {
        let body = bincode::serialize(rpc).map_err(|e| TransportError::Other(e.to_string()))?;
        check_len(body.len())?;
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Decoder for ObjectCodec {
    async fn decode(&self, reader: &mut DynReader) -> TransportResult<Option<Rpc>> {
        let Some(first) = read_first(reader).await? else {
            return Ok(None);
        };
        let mut rest = [0u8; 3];
        reader.read_exact(&mut rest).await?;
        let len = u32::from_be_bytes([first, rest[0], rest[1], rest[2]]) as usize;
        check_len(len)?;

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let rpc: Rpc = bincode::deserialize(&body)
            .map_err(|e| TransportError::Decode(format!("invalid envelope: {e}")))?;
        Ok(Some(rpc))
    }
}

#[async_trait]
impl Encoder for ObjectCodec {
    async fn encode_message(&self, writer: &mut DynWriter, payload: &[u8]) -> TransportResult<()> {
        Self::write_rpc(writer, &Rpc::message(payload.to_vec())).await
    }

    async fn encode_stream_begin(&self, writer: &mut DynWriter) -> TransportResult<()> {
        Self::write_rpc(writer, &Rpc::stream_begin()).await
    }
}

/// True when the connection ended in the middle of a frame.
pub(crate) fn is_truncated_frame(err: &TransportError) -> bool {
    matches!(err, TransportError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}
