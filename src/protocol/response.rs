//! HTTP/3 response types, body delivery, and the response frame-sequence
//! state machine.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::{HeaderMap, StatusCode};
use tokio::sync::{mpsc, Notify};

use crate::error::{ConnectionError, H3Error, H3Result};
use crate::protocol::frame::HeaderBlock;

/// An HTTP/3 response: status and headers up front, body streamed.
#[derive(Debug)]
pub struct H3Response {
    /// Response status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body, delivered chunk by chunk in arrival order.
    pub body: ResponseBody,
}

impl H3Response {
    /// Check if the response is successful (2xx status code).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Trailing headers, available once the body has ended.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.body.trailers()
    }
}

/// Convert a decoded field section into an `http::HeaderMap`.
pub(crate) fn header_map(block: &HeaderBlock) -> H3Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in block.fields() {
        let name: http::HeaderName = name
            .parse()
            .map_err(|_| H3Error::Malformed(format!("invalid header name '{name}'")))?;
        let value: http::HeaderValue = value
            .parse()
            .map_err(|_| H3Error::Malformed(format!("invalid value for '{name}'")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Streaming response body backed by a dedicated reader worker.
#[derive(Debug)]
pub struct ResponseBody {
    chunks: mpsc::Receiver<H3Result<Bytes>>,
    cancel: Arc<Notify>,
    trailers: Arc<StdMutex<Option<HeaderMap>>>,
}

impl ResponseBody {
    /// Create a body handle and the sender side used by the reader
    /// worker.
    pub(crate) fn channel() -> (BodySender, ResponseBody) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = Arc::new(Notify::new());
        let trailers = Arc::new(StdMutex::new(None));
        (
            BodySender {
                tx,
                cancel: cancel.clone(),
                trailers: trailers.clone(),
            },
            ResponseBody {
                chunks: rx,
                cancel,
                trailers,
            },
        )
    }

    /// Receive the next body chunk, `None` once the body has ended.
    pub async fn chunk(&mut self) -> H3Result<Option<Bytes>> {
        match self.chunks.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Collect the remaining body into one buffer.
    pub async fn bytes(mut self) -> H3Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stop the body subscription: no further chunks are delivered and
    /// the underlying stream is abort-read with H3_REQUEST_CANCELLED.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Trailing headers, if the stream carried any.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.trailers.lock().unwrap().clone()
    }
}

impl Stream for ResponseBody {
    type Item = H3Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

/// Worker side of a [`ResponseBody`].
pub(crate) struct BodySender {
    tx: mpsc::Sender<H3Result<Bytes>>,
    cancel: Arc<Notify>,
    trailers: Arc<StdMutex<Option<HeaderMap>>>,
}

impl BodySender {
    pub(crate) async fn send_chunk(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    pub(crate) async fn fail(&self, err: H3Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    pub(crate) fn set_trailers(&self, trailers: HeaderMap) {
        *self.trailers.lock().unwrap() = Some(trailers);
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.notified().await;
    }
}

/// States of the response frame-sequence machine. Transitions only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSequence {
    /// Nothing received yet.
    Initial,
    /// The response HEADERS frame arrived.
    GotHeader,
    /// At least one DATA frame arrived.
    GotHeaderAndData,
    /// The single permitted trailing HEADERS frame arrived.
    GotHeaderAndDataAndTrailingHeader,
}

/// Which role a legal HEADERS frame plays at the current point of the
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersKind {
    /// The initial response header section.
    Response,
    /// The trailing header section.
    Trailer,
}

/// Enforces the legal HEADERS/DATA ordering on one response stream.
///
/// Unknown frame types never change the state; the caller simply skips
/// them, which is what lets greased frame types ride inline with data.
#[derive(Debug)]
pub struct ResponseSequencer {
    state: ResponseSequence,
}

impl ResponseSequencer {
    pub fn new() -> Self {
        Self {
            state: ResponseSequence::Initial,
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> ResponseSequence {
        self.state
    }

    /// Record a HEADERS frame and classify it.
    pub fn headers_received(&mut self) -> Result<HeadersKind, ConnectionError> {
        match self.state {
            ResponseSequence::Initial => {
                self.state = ResponseSequence::GotHeader;
                Ok(HeadersKind::Response)
            }
            ResponseSequence::GotHeaderAndData => {
                self.state = ResponseSequence::GotHeaderAndDataAndTrailingHeader;
                Ok(HeadersKind::Trailer)
            }
            ResponseSequence::GotHeader => Err(ConnectionError::frame_unexpected(
                "HEADERS frame directly after the response header section",
            )),
            ResponseSequence::GotHeaderAndDataAndTrailingHeader => Err(
                ConnectionError::frame_unexpected("HEADERS frame after the trailing section"),
            ),
        }
    }

    /// Record a DATA frame.
    pub fn data_received(&mut self) -> Result<(), ConnectionError> {
        match self.state {
            ResponseSequence::GotHeader | ResponseSequence::GotHeaderAndData => {
                self.state = ResponseSequence::GotHeaderAndData;
                Ok(())
            }
            ResponseSequence::Initial => Err(ConnectionError::frame_unexpected(
                "DATA frame before the response header section",
            )),
            ResponseSequence::GotHeaderAndDataAndTrailingHeader => Err(
                ConnectionError::frame_unexpected("DATA frame after the trailing section"),
            ),
        }
    }

    /// Record the end of the stream.
    pub fn done(&self) -> H3Result<()> {
        if self.state == ResponseSequence::Initial {
            return Err(H3Error::Malformed(
                "stream ended before a header frame".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ResponseSequencer {
    fn default() -> Self {
        Self::new()
    }
}
