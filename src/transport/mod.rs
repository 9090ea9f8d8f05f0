//! Transport capability consumed by the protocol engine.
//!
//! The engine runs on top of an already-established multiplexed-stream
//! transport connection (QUIC). The transport is consumed through the
//! narrow traits in this module: per-stream byte read/write, stream
//! metadata, abort/reset signaling, and connection-level close. Stream
//! creation, flow control, congestion control, and encryption all live
//! behind this boundary.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

/// Directionality of a transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// One-way stream: the initiator writes, the acceptor reads.
    Unidirectional,
    /// Two-way stream.
    Bidirectional,
}

/// Read half of a transport stream.
#[async_trait]
pub trait TransportReader: Send {
    /// Read available bytes into `buf`, blocking until at least one byte
    /// arrives. Returns `Ok(0)` once the peer has finished the stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write half of a transport stream.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write all of `data` to the stream.
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush buffered data toward the peer.
    async fn flush(&mut self) -> io::Result<()>;

    /// Cleanly close the write side of the stream.
    async fn finish(&mut self) -> io::Result<()>;
}

/// Control-plane handle for a stream, usable independently of any
/// in-flight read or write on its data halves.
pub trait StreamController: Send + Sync {
    /// Ask the peer to stop sending on this stream (abort the read side)
    /// with the given application error code.
    fn abort_read(&self, error_code: u64);

    /// Abruptly terminate the write side of this stream with the given
    /// application error code.
    fn reset(&self, error_code: u64);
}

/// One transport stream as handed over by the transport: metadata plus
/// its data halves and control handle.
///
/// An incoming unidirectional stream has no writer; an outgoing
/// unidirectional stream has no reader.
pub struct TransportStream {
    /// Transport-assigned stream identifier.
    pub id: u64,
    /// Stream directionality.
    pub direction: Direction,
    /// Read half, if this endpoint may read.
    pub reader: Option<Box<dyn TransportReader>>,
    /// Write half, if this endpoint may write.
    pub writer: Option<Box<dyn TransportWriter>>,
    /// Control-plane handle for abort/reset.
    pub controller: Arc<dyn StreamController>,
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("reader", &self.reader.is_some())
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

/// An established transport connection.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Open a new unidirectional stream toward the peer.
    async fn open_uni(&self) -> io::Result<TransportStream>;

    /// Open a new bidirectional stream toward the peer.
    async fn open_bidi(&self) -> io::Result<TransportStream>;

    /// Wait for the next peer-initiated stream. Returns `None` once the
    /// connection is closed.
    async fn accept(&self) -> Option<TransportStream>;

    /// Close the whole connection with an application error code and
    /// reason phrase.
    fn close(&self, error_code: u64, reason: &[u8]);
}
