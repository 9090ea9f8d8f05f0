//! Logical stream abstraction over one transport stream.
//!
//! [`H3Stream`] adds a read-ahead buffer to a raw transport stream so the
//! codecs can peek at varints (stream-type tags, capsule types) without
//! consuming them, and exposes the abort/reset control plane next to the
//! data path.

use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::protocol::varint;
use crate::transport::{Direction, StreamController, TransportReader, TransportStream, TransportWriter};

const READ_CHUNK: usize = 4096;

struct RecvHalf {
    reader: Box<dyn TransportReader>,
    buf: BytesMut,
    eof: bool,
}

/// A typed logical stream: buffered reads, writes, and abort/reset.
pub struct H3Stream {
    id: u64,
    direction: Direction,
    recv: Option<RecvHalf>,
    send: Option<Box<dyn TransportWriter>>,
    controller: Arc<dyn StreamController>,
}

impl std::fmt::Debug for H3Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H3Stream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("readable", &self.recv.is_some())
            .field("writable", &self.send.is_some())
            .finish()
    }
}

impl H3Stream {
    /// Wrap a transport stream.
    pub fn new(stream: TransportStream) -> Self {
        Self {
            id: stream.id,
            direction: stream.direction,
            recv: stream.reader.map(|reader| RecvHalf {
                reader,
                buf: BytesMut::new(),
                eof: false,
            }),
            send: stream.writer,
            controller: stream.controller,
        }
    }

    /// Transport-assigned stream identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream directionality.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether this stream is bidirectional.
    pub fn is_bidirectional(&self) -> bool {
        self.direction == Direction::Bidirectional
    }

    /// Split into independently usable read and write halves.
    ///
    /// Both halves keep the same id and control handle; the read half
    /// carries any buffered bytes along.
    pub fn split(self) -> (H3Stream, H3Stream) {
        let read_half = H3Stream {
            id: self.id,
            direction: self.direction,
            recv: self.recv,
            send: None,
            controller: self.controller.clone(),
        };
        let write_half = H3Stream {
            id: self.id,
            direction: self.direction,
            recv: None,
            send: self.send,
            controller: self.controller,
        };
        (read_half, write_half)
    }

    fn recv_mut(&mut self) -> io::Result<&mut RecvHalf> {
        self.recv
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "stream is not readable"))
    }

    fn send_mut(&mut self) -> io::Result<&mut Box<dyn TransportWriter>> {
        self.send
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "stream is not writable"))
    }

    /// Ensure at least `n` bytes are buffered. Returns `false` if the
    /// stream ended first.
    async fn fill(&mut self, n: usize) -> io::Result<bool> {
        let recv = self.recv_mut()?;
        while recv.buf.len() < n {
            if recv.eof {
                return Ok(false);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let got = recv.reader.read(&mut chunk).await?;
            if got == 0 {
                recv.eof = true;
                return Ok(recv.buf.len() >= n);
            }
            recv.buf.extend_from_slice(&chunk[..got]);
        }
        Ok(true)
    }

    /// Read up to `out.len()` bytes. Returns 0 at end of stream.
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.fill(1).await? {
            return Ok(0);
        }
        let recv = self.recv_mut()?;
        let n = out.len().min(recv.buf.len());
        out[..n].copy_from_slice(&recv.buf[..n]);
        recv.buf.advance(n);
        Ok(n)
    }

    /// Read exactly `n` bytes, failing with `UnexpectedEof` if the
    /// stream ends first.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        if !self.fill(n).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed by peer",
            ));
        }
        let recv = self.recv_mut()?;
        Ok(recv.buf.split_to(n).freeze())
    }

    /// Discard exactly `n` bytes, failing with `UnexpectedEof` if the
    /// stream ends first.
    pub async fn skip(&mut self, mut n: usize) -> io::Result<()> {
        while n > 0 {
            let take = n.min(READ_CHUNK);
            self.read_exact(take).await?;
            n -= take;
        }
        Ok(())
    }

    /// Decode one varint. Returns `None` on a clean end of stream at a
    /// varint boundary; a stream ending mid-varint is `UnexpectedEof`.
    pub async fn read_varint(&mut self) -> io::Result<Option<u64>> {
        match self.peek_varint_len().await? {
            None => Ok(None),
            Some((value, len)) => {
                self.recv_mut()?.buf.advance(len);
                Ok(Some(value))
            }
        }
    }

    /// Decode one varint without consuming it, so a following
    /// identifier can be inspected before dispatch.
    pub async fn peek_varint(&mut self) -> io::Result<Option<u64>> {
        Ok(self.peek_varint_len().await?.map(|(value, _)| value))
    }

    async fn peek_varint_len(&mut self) -> io::Result<Option<(u64, usize)>> {
        if !self.fill(1).await? {
            return Ok(None);
        }
        let first = self.recv_mut()?.buf[0];
        let len = 1usize << (first >> 6);
        if !self.fill(len).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a varint",
            ));
        }
        let recv = self.recv_mut()?;
        let decoded = varint::decode(&recv.buf[..len]).expect("buffered varint");
        Ok(Some(decoded))
    }

    /// Push bytes back onto the front of the read buffer.
    pub fn unread(&mut self, bytes: &[u8]) {
        if let Some(recv) = self.recv.as_mut() {
            let mut buf = BytesMut::with_capacity(bytes.len() + recv.buf.len());
            buf.extend_from_slice(bytes);
            buf.extend_from_slice(&recv.buf);
            recv.buf = buf;
        }
    }

    /// Write all of `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_mut()?.write_all(data).await
    }

    /// Flush buffered data toward the peer.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.send_mut()?.flush().await
    }

    /// Cleanly close the write side.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.send_mut()?.finish().await
    }

    /// Abort the read side with an application error code.
    pub fn abort_read(&self, error_code: u64) {
        self.controller.abort_read(error_code);
    }

    /// Abruptly terminate the write side with an application error code.
    pub fn reset(&self, error_code: u64) {
        self.controller.reset(error_code);
    }

    /// Clone of the control-plane handle, for teardown bookkeeping that
    /// outlives the stream hand-off.
    pub fn controller(&self) -> Arc<dyn StreamController> {
        self.controller.clone()
    }
}
