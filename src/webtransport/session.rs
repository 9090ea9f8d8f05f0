//! WebTransport session over one extended CONNECT tunnel.
//!
//! A session is identified by the stream id of its CONNECT tunnel. It
//! creates outgoing WebTransport streams (prefixed with the required
//! signal and session id), receives incoming streams dispatched by the
//! registry, and watches the tunnel's capsule stream for close
//! signaling, which is the sole path that detects passive termination.

use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, trace};

use crate::connection::H3Connection;
use crate::error::{H3Error, H3Result, WEBTRANSPORT_SESSION_GONE};
use crate::protocol::capsule::{Capsule, CAPSULE_CLOSE_WEBTRANSPORT_SESSION};
use crate::protocol::stream::H3Stream;
use crate::protocol::{varint, STREAM_TYPE_WEBTRANSPORT, WEBTRANSPORT_STREAM_SIGNAL};
use crate::transport::{Direction, StreamController};
use crate::webtransport::capsule_stream::{CapsuleParser, CapsuleStream};
use crate::webtransport::registry::RegistryShared;

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Tunnel established, not yet started.
    Connecting,
    /// Started; streams flow in both directions.
    Open,
    /// Closed locally or by the peer; all owned streams torn down.
    Closed,
}

/// Receives WebTransport streams the peer opened within a session.
#[async_trait]
pub trait IncomingStreamHandler: Send + Sync {
    /// Take ownership of the stream, positioned after the session-id
    /// prefix.
    async fn handle(&self, session_id: u64, stream: H3Stream);
}

type TerminatedListener = Box<dyn FnOnce(u32, String) + Send>;

struct SessionInner {
    id: u64,
    conn: H3Connection,
    registry: Weak<RegistryShared>,
    state: StdMutex<SessionState>,
    capsule_rx: StdMutex<Option<CapsuleStream>>,
    capsule_tx: TokioMutex<Option<CapsuleStream>>,
    created: StdMutex<Vec<Arc<dyn StreamController>>>,
    uni_handler: StdMutex<Option<Arc<dyn IncomingStreamHandler>>>,
    bidi_handler: StdMutex<Option<Arc<dyn IncomingStreamHandler>>>,
    terminated: StdMutex<Option<TerminatedListener>>,
}

/// Handle to one WebTransport session.
#[derive(Clone)]
pub struct WebTransportSession {
    inner: Arc<SessionInner>,
}

/// Reads CLOSE_WEBTRANSPORT_SESSION capsules off the tunnel.
struct CloseSessionParser;

#[async_trait]
impl CapsuleParser for CloseSessionParser {
    async fn parse(&self, stream: &mut H3Stream) -> H3Result<Capsule> {
        Capsule::read(stream)
            .await?
            .ok_or_else(|| H3Error::Malformed("stream ended inside a capsule".into()))
    }
}

impl WebTransportSession {
    pub(crate) fn new(
        conn: H3Connection,
        registry: Weak<RegistryShared>,
        tunnel: H3Stream,
    ) -> Self {
        let id = tunnel.id();
        let mut capsules = CapsuleStream::new(tunnel);
        capsules.register_parser(CAPSULE_CLOSE_WEBTRANSPORT_SESSION, Arc::new(CloseSessionParser));
        let (rx, tx) = capsules.split();
        Self {
            inner: Arc::new(SessionInner {
                id,
                conn,
                registry,
                state: StdMutex::new(SessionState::Connecting),
                capsule_rx: StdMutex::new(Some(rx)),
                capsule_tx: TokioMutex::new(Some(tx)),
                created: StdMutex::new(Vec::new()),
                uni_handler: StdMutex::new(None),
                bidi_handler: StdMutex::new(None),
                terminated: StdMutex::new(None),
            }),
        }
    }

    /// The session id: the stream id of its CONNECT tunnel.
    pub fn session_id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Whether the session has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub(crate) fn mark_open(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == SessionState::Connecting {
            *state = SessionState::Open;
        }
    }

    /// Register the handler for peer-opened unidirectional streams.
    pub fn set_unidirectional_stream_handler(&self, handler: Arc<dyn IncomingStreamHandler>) {
        *self.inner.uni_handler.lock().unwrap() = Some(handler);
    }

    /// Register the handler for peer-opened bidirectional streams.
    pub fn set_bidirectional_stream_handler(&self, handler: Arc<dyn IncomingStreamHandler>) {
        *self.inner.bidi_handler.lock().unwrap() = Some(handler);
    }

    /// Register a listener invoked exactly once with the (error code,
    /// reason) the session terminated with.
    pub fn set_session_terminated_listener<F>(&self, listener: F)
    where
        F: FnOnce(u32, String) + Send + 'static,
    {
        *self.inner.terminated.lock().unwrap() = Some(Box::new(listener));
    }

    /// Start the session: begin watching the capsule stream and deliver
    /// any streams that arrived before the session was started, in
    /// arrival order.
    pub async fn open(&self) -> H3Result<()> {
        match self.state() {
            SessionState::Closed => {
                return Err(H3Error::SessionClosed {
                    session_id: self.inner.id,
                })
            }
            SessionState::Open => return Ok(()),
            SessionState::Connecting => {}
        }

        if let Some(rx) = self.inner.capsule_rx.lock().unwrap().take() {
            let session = self.clone();
            tokio::spawn(capsule_reader(session, rx));
        }

        let queued = match self.inner.registry.upgrade() {
            Some(registry) => registry.start_session(self),
            None => {
                self.mark_open();
                Vec::new()
            }
        };
        for stream in queued {
            self.dispatch_incoming(stream).await;
        }
        debug!(session_id = self.inner.id, "session opened");
        Ok(())
    }

    fn ensure_open(&self) -> H3Result<()> {
        match self.state() {
            SessionState::Open => Ok(()),
            SessionState::Connecting => Err(H3Error::InvalidInput(
                "session has not been opened yet".into(),
            )),
            SessionState::Closed => Err(H3Error::SessionClosed {
                session_id: self.inner.id,
            }),
        }
    }

    /// Open a unidirectional WebTransport stream within this session.
    pub async fn create_unidirectional_stream(&self) -> H3Result<H3Stream> {
        self.ensure_open()?;
        let mut stream = self.inner.conn.open_uni().await?;
        let mut prefix = BytesMut::new();
        varint::encode(&mut prefix, STREAM_TYPE_WEBTRANSPORT);
        varint::encode(&mut prefix, self.inner.id);
        stream.write_all(&prefix).await?;
        stream.flush().await?;
        self.inner.created.lock().unwrap().push(stream.controller());
        Ok(stream)
    }

    /// Open a bidirectional WebTransport stream within this session.
    pub async fn create_bidirectional_stream(&self) -> H3Result<H3Stream> {
        self.ensure_open()?;
        let mut stream = self.inner.conn.open_bidi().await?;
        let mut prefix = BytesMut::new();
        varint::encode(&mut prefix, WEBTRANSPORT_STREAM_SIGNAL);
        varint::encode(&mut prefix, self.inner.id);
        stream.write_all(&prefix).await?;
        stream.flush().await?;
        self.inner.created.lock().unwrap().push(stream.controller());
        Ok(stream)
    }

    /// Hand an incoming stream to the registered handler, or abort it if
    /// the session is already closed.
    pub(crate) async fn dispatch_incoming(&self, stream: H3Stream) {
        if self.is_closed() {
            stream.abort_read(WEBTRANSPORT_SESSION_GONE);
            if stream.is_bidirectional() {
                stream.reset(WEBTRANSPORT_SESSION_GONE);
            }
            return;
        }
        let handler = match stream.direction() {
            Direction::Unidirectional => self.inner.uni_handler.lock().unwrap().clone(),
            Direction::Bidirectional => self.inner.bidi_handler.lock().unwrap().clone(),
        };
        match handler {
            Some(handler) => handler.handle(self.inner.id, stream).await,
            None => {
                trace!(
                    session_id = self.inner.id,
                    stream_id = stream.id(),
                    "no receive handler registered, dropping stream"
                );
            }
        }
    }

    /// Close the session: send CLOSE_WEBTRANSPORT_SESSION on the capsule
    /// stream, tear down every stream this session created, and invoke
    /// the terminated listener. Closing twice is a no-op.
    pub async fn close(&self, error_code: u32, reason: &str) -> H3Result<()> {
        let capsule = Capsule::close_session(error_code, reason)?;
        if !self.transition_to_closed() {
            return Ok(());
        }
        if let Some(mut tx) = self.inner.capsule_tx.lock().await.take() {
            if let Err(err) = tx.send_and_close(&capsule).await {
                debug!(
                    session_id = self.inner.id,
                    error = %err,
                    "failed sending close capsule"
                );
            }
        }
        self.finish_close(error_code, reason.to_string());
        Ok(())
    }

    async fn close_from_peer(&self, error_code: u32, reason: String) {
        if !self.transition_to_closed() {
            return;
        }
        // The peer already considers the session gone; no capsule back.
        self.inner.capsule_tx.lock().await.take();
        self.finish_close(error_code, reason);
    }

    fn transition_to_closed(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    fn finish_close(&self, error_code: u32, reason: String) {
        let created: Vec<_> = self.inner.created.lock().unwrap().drain(..).collect();
        for controller in created {
            controller.reset(WEBTRANSPORT_SESSION_GONE);
            controller.abort_read(WEBTRANSPORT_SESSION_GONE);
        }
        if let Some(listener) = self.inner.terminated.lock().unwrap().take() {
            listener(error_code, reason.clone());
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove_session(self.inner.id);
        }
        debug!(
            session_id = self.inner.id,
            error_code,
            reason = %reason,
            "session closed"
        );
    }
}

impl std::fmt::Debug for WebTransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebTransportSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Background task watching the tunnel for close signaling for the
/// lifetime of the session.
async fn capsule_reader(session: WebTransportSession, mut rx: CapsuleStream) {
    let (error_code, reason) = loop {
        match rx.receive().await {
            Ok(Some(Capsule::CloseSession { error_code, reason })) => {
                debug!(
                    session_id = session.session_id(),
                    error_code, "received close capsule"
                );
                break (error_code, reason);
            }
            Ok(Some(capsule)) => {
                trace!(
                    session_id = session.session_id(),
                    capsule_type = capsule.capsule_type(),
                    "ignoring capsule"
                );
            }
            Ok(None) => break (0, String::new()),
            Err(err) => {
                trace!(
                    session_id = session.session_id(),
                    error = %err,
                    "capsule stream failed"
                );
                break (0, String::new());
            }
        }
    };
    session.close_from_peer(error_code, reason).await;
}
