//! Reader adapters used on the upload and download paths.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Wraps a reader and records every byte the consumer reads.
///
/// Used to persist an upload locally while keeping the bytes for
/// replication, without reading the source twice.
#[derive(Debug)]
pub struct TeeReader<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    /// Bytes read so far
    #[must_use]
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Take the recorded bytes
    #[must_use]
    pub fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        res
    }
}

/// Yields exactly `len` bytes from a reader.
///
/// Unlike [`tokio::io::AsyncReadExt::take`], running out of input before
/// `len` bytes is an `UnexpectedEof` error rather than a short read, so a
/// store write fed from a dropped connection fails instead of committing a
/// truncated object.
#[derive(Debug)]
pub struct ExactReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> ExactReader<R> {
    /// Read exactly `len` bytes from `inner`
    pub fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
        }
    }

    /// Bytes still owed
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let max = this.remaining.min(buf.remaining() as u64) as usize;
        let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(max));
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
        let n = chunk.filled().len();
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("input ended with {} bytes outstanding", this.remaining),
            )));
        }

        buf.advance(n);
        this.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}
