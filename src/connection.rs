//! HTTP/3 connection engine.
//!
//! Owns the control-stream lifecycle and SETTINGS exchange, dispatches
//! incoming streams by type, runs request/response exchanges with the
//! frame-sequence rules, and signals connection- or stream-level errors
//! with the RFC 9114 codes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex as TokioMutex};
use tracing::{debug, error, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{
    H3Error, H3Result, H3_CLOSED_CRITICAL_STREAM, H3_FRAME_UNEXPECTED, H3_MISSING_SETTINGS,
    H3_NO_ERROR, H3_REQUEST_CANCELLED, H3_STREAM_CREATION_ERROR,
};
use crate::protocol::frame::{read_frame, write_frame, Frame, FrameLimits, Settings};
use crate::protocol::response::{header_map, BodySender, ResponseBody, ResponseSequencer};
use crate::protocol::stream::H3Stream;
use crate::protocol::{
    is_greased_stream_type, H3Request, H3Response, HeaderBlock, STREAM_TYPE_CONTROL,
    STREAM_TYPE_PUSH, STREAM_TYPE_QPACK_DECODER, STREAM_TYPE_QPACK_ENCODER,
};
use crate::qpack::{HeaderCodec, SharedHeaderCodec};
use crate::transport::{Direction, TransportConnection};

/// Handler for an accepted stream, registered per stream-type tag
/// (unidirectional) or signal value (bidirectional).
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Take ownership of the stream. The stream-type tag has already
    /// been consumed on unidirectional streams; on bidirectional streams
    /// the signal varint is still unconsumed.
    async fn handle(&self, stream: H3Stream);
}

/// Setup progress of the local connection half. The peer half is
/// tracked by the peer-SETTINGS latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    Created,
    ControlStreamStarted,
    SettingsSent,
}

struct ConnectionInner {
    transport: Arc<dyn TransportConnection>,
    codec: SharedHeaderCodec,
    config: ConnectionConfig,
    limits: FrameLimits,
    local_settings: Settings,
    state: StdMutex<EngineState>,
    control_tx: TokioMutex<Option<H3Stream>>,
    peer_settings: watch::Sender<Option<Settings>>,
    uni_handlers: StdMutex<HashMap<u64, Arc<dyn StreamHandler>>>,
    bidi_handlers: StdMutex<HashMap<u64, Arc<dyn StreamHandler>>>,
    control_stream_seen: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionInner {
    /// Close the whole connection with an HTTP/3 error code. Idempotent;
    /// only the first code wins.
    fn connection_error(&self, code: u64, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            error!(code, reason, "closing connection");
            self.transport.close(code, reason.as_bytes());
        }
    }

    /// Escalate an error: protocol violations close the connection,
    /// everything else passes through untouched.
    fn escalate(&self, err: H3Error) -> H3Error {
        if let H3Error::Connection(ref c) = err {
            self.connection_error(c.code, &c.message);
        }
        err
    }
}

/// An HTTP/3 connection over an established transport.
#[derive(Clone)]
pub struct H3Connection {
    inner: Arc<ConnectionInner>,
}

impl H3Connection {
    /// Build a connection engine over `transport`, using `codec` for
    /// header compression.
    pub fn new(
        transport: Arc<dyn TransportConnection>,
        codec: Box<dyn HeaderCodec>,
        config: ConnectionConfig,
    ) -> Self {
        let (peer_settings, _) = watch::channel(None);
        let inner = Arc::new(ConnectionInner {
            limits: FrameLimits::from(&config),
            local_settings: Settings::from_config(&config),
            transport,
            codec: crate::qpack::shared(codec),
            config,
            state: StdMutex::new(EngineState::Created),
            control_tx: TokioMutex::new(None),
            peer_settings,
            uni_handlers: StdMutex::new(HashMap::new()),
            bidi_handlers: StdMutex::new(HashMap::new()),
            control_stream_seen: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        {
            let mut uni = inner.uni_handlers.lock().unwrap();
            uni.insert(
                STREAM_TYPE_CONTROL,
                Arc::new(ControlStreamHandler { conn: weak.clone() }),
            );
            uni.insert(STREAM_TYPE_PUSH, Arc::new(DrainStreamHandler { name: "push" }));
            uni.insert(
                STREAM_TYPE_QPACK_ENCODER,
                Arc::new(DrainStreamHandler {
                    name: "qpack-encoder",
                }),
            );
            uni.insert(
                STREAM_TYPE_QPACK_DECODER,
                Arc::new(DrainStreamHandler {
                    name: "qpack-decoder",
                }),
            );
        }

        Self { inner }
    }

    /// Open the control stream, send local SETTINGS, and start accepting
    /// peer-initiated streams.
    pub async fn start(&self) -> H3Result<()> {
        let mut control = H3Stream::new(self.inner.transport.open_uni().await?);
        control
            .write_all(&crate::protocol::varint::encode_to_vec(STREAM_TYPE_CONTROL))
            .await?;
        *self.inner.state.lock().unwrap() = EngineState::ControlStreamStarted;

        write_frame(
            &mut control,
            &Frame::Settings(self.inner.local_settings.clone()),
            &self.inner.codec,
        )
        .await?;
        control.flush().await?;
        *self.inner.state.lock().unwrap() = EngineState::SettingsSent;
        debug!("control stream opened, SETTINGS sent");

        // The control stream must stay open for the connection lifetime.
        *self.inner.control_tx.lock().await = Some(control);

        let inner = self.inner.clone();
        tokio::spawn(accept_loop(inner));
        Ok(())
    }

    /// Register a handler for an extension unidirectional stream type.
    ///
    /// Standard types (0x00-0x03) and greased values are rejected as a
    /// programming error.
    pub fn register_uni_handler(
        &self,
        stream_type: u64,
        handler: Arc<dyn StreamHandler>,
    ) -> H3Result<()> {
        if stream_type <= STREAM_TYPE_QPACK_DECODER {
            return Err(H3Error::InvalidInput(format!(
                "stream type {stream_type:#x} is reserved for standard streams"
            )));
        }
        if is_greased_stream_type(stream_type) {
            return Err(H3Error::InvalidInput(format!(
                "stream type {stream_type:#x} is a reserved greasing value"
            )));
        }
        self.inner
            .uni_handlers
            .lock()
            .unwrap()
            .insert(stream_type, handler);
        Ok(())
    }

    /// Register a handler for bidirectional streams opening with the
    /// given signal varint.
    pub fn register_bidi_handler(
        &self,
        signal: u64,
        handler: Arc<dyn StreamHandler>,
    ) -> H3Result<()> {
        if is_greased_stream_type(signal) {
            return Err(H3Error::InvalidInput(format!(
                "signal {signal:#x} is a reserved greasing value"
            )));
        }
        self.inner
            .bidi_handlers
            .lock()
            .unwrap()
            .insert(signal, handler);
        Ok(())
    }

    /// Wait for the peer's SETTINGS, bounded by `wait`.
    pub async fn peer_settings(&self, wait: Duration) -> H3Result<Settings> {
        let mut rx = self.inner.peer_settings.subscribe();
        let current = rx.borrow().clone();
        if let Some(settings) = current {
            return Ok(settings);
        }
        let awaited = async {
            loop {
                rx.changed().await.map_err(|_| H3Error::Timeout)?;
                let current = rx.borrow().clone();
                if let Some(settings) = current {
                    return Ok(settings);
                }
            }
        };
        tokio::time::timeout(wait, awaited)
            .await
            .map_err(|_| H3Error::Timeout)?
    }

    /// Look up one peer SETTINGS parameter, returning `None` (rather
    /// than blocking forever) if the peer's SETTINGS have not arrived
    /// within `wait`.
    pub async fn peer_settings_parameter(&self, id: u64, wait: Duration) -> Option<u64> {
        match self.peer_settings(wait).await {
            Ok(settings) => settings.parameter(id),
            Err(_) => None,
        }
    }

    /// Close the connection without error.
    pub fn close(&self) {
        self.inner.connection_error(H3_NO_ERROR, "");
    }

    /// Close the connection with an HTTP/3 error code.
    pub fn connection_error(&self, code: u64, reason: &str) {
        self.inner.connection_error(code, reason);
    }

    /// Reset a single stream, leaving the connection usable.
    pub fn stream_error(&self, code: u64, stream: &H3Stream) {
        warn!(stream_id = stream.id(), code, "resetting stream");
        stream.reset(code);
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub(crate) async fn open_uni(&self) -> H3Result<H3Stream> {
        Ok(H3Stream::new(self.inner.transport.open_uni().await?))
    }

    pub(crate) async fn open_bidi(&self) -> H3Result<H3Stream> {
        Ok(H3Stream::new(self.inner.transport.open_bidi().await?))
    }

    #[cfg(test)]
    pub(crate) fn local_state(&self) -> EngineState {
        *self.inner.state.lock().unwrap()
    }

    /// Send a request and read the response header section. The body is
    /// delivered through the returned response's [`ResponseBody`] by a
    /// dedicated worker, preserving arrival order.
    pub async fn send_request(&self, request: H3Request) -> H3Result<H3Response> {
        let block = request.header_block()?;
        let mut stream = self.open_bidi().await?;

        write_frame(&mut stream, &Frame::Headers(block), &self.inner.codec).await?;
        if let Some(body) = &request.body {
            write_frame(
                &mut stream,
                &Frame::Data {
                    payload: body.clone(),
                },
                &self.inner.codec,
            )
            .await?;
        }
        stream.flush().await?;
        stream.finish().await?;
        let (mut rx, _tx) = stream.split();

        let mut sequencer = ResponseSequencer::new();
        let header_block = loop {
            match read_frame(&mut rx, &self.inner.codec, &self.inner.limits).await {
                Ok(Some(Frame::Headers(block))) => {
                    sequencer
                        .headers_received()
                        .map_err(|e| self.inner.escalate(e.into()))?;
                    break block;
                }
                Ok(Some(Frame::Data { .. })) => {
                    let err = sequencer.data_received().unwrap_err();
                    return Err(self.inner.escalate(err.into()));
                }
                Ok(Some(Frame::Settings(_))) => {
                    return Err(self.inner.escalate(H3Error::connection(
                        H3_FRAME_UNEXPECTED,
                        "SETTINGS frame on a request stream",
                    )));
                }
                Ok(Some(Frame::Unknown { .. })) => continue,
                Ok(None) => {
                    sequencer.done()?;
                    unreachable!("done() fails while awaiting the header section");
                }
                Err(err) => return Err(self.inner.escalate(err)),
            }
        };

        let status = header_block.status()?;
        let status = http::StatusCode::from_u16(status)
            .map_err(|_| H3Error::Malformed(format!("invalid :status {status}")))?;
        let headers = header_map(&header_block)?;

        let (sender, body) = ResponseBody::channel();
        let inner = self.inner.clone();
        tokio::spawn(body_worker(inner, rx, sequencer, sender));

        Ok(H3Response {
            status,
            headers,
            body,
        })
    }

    /// Establish an extended CONNECT tunnel (RFC 9220).
    ///
    /// Waits (bounded by the configured settings deadline) for the peer
    /// to advertise SETTINGS_ENABLE_CONNECT_PROTOCOL and fails fast
    /// without sending otherwise. On a 2xx response the stream is the
    /// tunnel; any other status surfaces as [`H3Error::Http`].
    pub async fn connect_extended(
        &self,
        protocol: &str,
        authority: &str,
        path: &str,
    ) -> H3Result<H3Stream> {
        let settings = self.peer_settings(self.inner.config.settings_wait).await?;
        if !settings.enable_connect_protocol {
            return Err(H3Error::ExtendedConnectNotEnabled);
        }

        let block = HeaderBlock::extended_connect(protocol, "https", authority, path);
        block.validate_request()?;

        let mut stream = self.open_bidi().await?;
        write_frame(&mut stream, &Frame::Headers(block), &self.inner.codec).await?;
        stream.flush().await?;

        let header_block = loop {
            match read_frame(&mut stream, &self.inner.codec, &self.inner.limits).await {
                Ok(Some(Frame::Headers(block))) => break block,
                Ok(Some(Frame::Unknown { .. })) => continue,
                Ok(Some(_)) => {
                    return Err(self.inner.escalate(H3Error::connection(
                        H3_FRAME_UNEXPECTED,
                        "non-HEADERS frame in response to CONNECT",
                    )));
                }
                Ok(None) => {
                    return Err(H3Error::Malformed(
                        "stream ended before the CONNECT response".into(),
                    ));
                }
                Err(err) => return Err(self.inner.escalate(err)),
            }
        };

        let status = header_block.status()?;
        if !(200..300).contains(&status) {
            debug!(status, "extended CONNECT refused");
            return Err(H3Error::Http { status });
        }
        debug!(protocol, authority, path, "extended CONNECT established");
        Ok(stream)
    }
}

/// Accept peer-initiated streams and dispatch each on its own task so
/// acceptance never blocks on handler processing.
async fn accept_loop(inner: Arc<ConnectionInner>) {
    while let Some(transport_stream) = inner.transport.accept().await {
        let inner = inner.clone();
        tokio::spawn(async move {
            dispatch_stream(inner, H3Stream::new(transport_stream)).await;
        });
    }
    trace!("transport stopped accepting streams");
}

async fn dispatch_stream(inner: Arc<ConnectionInner>, mut stream: H3Stream) {
    match stream.direction() {
        Direction::Unidirectional => {
            let tag = match stream.read_varint().await {
                Ok(Some(tag)) => tag,
                Ok(None) => return,
                Err(err) => {
                    trace!(error = %err, "failed reading stream-type tag");
                    return;
                }
            };
            if is_greased_stream_type(tag) {
                trace!(tag, "ignoring greased stream type");
                stream.abort_read(H3_STREAM_CREATION_ERROR);
                return;
            }
            let handler = inner.uni_handlers.lock().unwrap().get(&tag).cloned();
            match handler {
                Some(handler) => handler.handle(stream).await,
                None => {
                    trace!(tag, "unknown unidirectional stream type");
                    stream.abort_read(H3_STREAM_CREATION_ERROR);
                }
            }
        }
        Direction::Bidirectional => {
            let signal = match stream.peek_varint().await {
                Ok(Some(signal)) => signal,
                _ => return,
            };
            let handler = inner.bidi_handlers.lock().unwrap().get(&signal).cloned();
            match handler {
                Some(handler) => handler.handle(stream).await,
                None => {
                    inner.connection_error(
                        H3_STREAM_CREATION_ERROR,
                        "unexpected server-initiated bidirectional stream",
                    );
                }
            }
        }
    }
}

/// Reads the peer's control stream: SETTINGS first, then a stream that
/// must never end.
struct ControlStreamHandler {
    conn: Weak<ConnectionInner>,
}

#[async_trait]
impl StreamHandler for ControlStreamHandler {
    async fn handle(&self, mut stream: H3Stream) {
        let Some(inner) = self.conn.upgrade() else {
            return;
        };
        if inner.control_stream_seen.swap(true, Ordering::SeqCst) {
            inner.connection_error(H3_STREAM_CREATION_ERROR, "duplicate control stream");
            return;
        }

        match read_frame(&mut stream, &inner.codec, &inner.limits).await {
            Ok(Some(Frame::Settings(settings))) => {
                debug!(?settings, "peer SETTINGS received");
                let _ = inner.peer_settings.send(Some(settings));
            }
            Ok(Some(frame)) => {
                inner.connection_error(
                    H3_MISSING_SETTINGS,
                    &format!(
                        "control stream opened with {:?} instead of SETTINGS",
                        frame.frame_type()
                    ),
                );
                return;
            }
            Ok(None) => {
                inner.connection_error(
                    H3_CLOSED_CRITICAL_STREAM,
                    "control stream closed before SETTINGS",
                );
                return;
            }
            Err(err) => {
                control_stream_failure(&inner, err);
                return;
            }
        }

        loop {
            match read_frame(&mut stream, &inner.codec, &inner.limits).await {
                Ok(Some(Frame::Unknown { frame_type })) => {
                    trace!(frame_type, "ignoring unknown frame on control stream");
                }
                Ok(Some(Frame::Settings(_))) => {
                    inner.connection_error(H3_FRAME_UNEXPECTED, "second SETTINGS frame");
                    return;
                }
                Ok(Some(frame)) => {
                    inner.connection_error(
                        H3_FRAME_UNEXPECTED,
                        &format!("{:?} frame on control stream", frame.frame_type()),
                    );
                    return;
                }
                Ok(None) => {
                    inner.connection_error(
                        H3_CLOSED_CRITICAL_STREAM,
                        "control stream closed by peer",
                    );
                    return;
                }
                Err(err) => {
                    control_stream_failure(&inner, err);
                    return;
                }
            }
        }
    }
}

fn control_stream_failure(inner: &ConnectionInner, err: H3Error) {
    match err {
        H3Error::Connection(c) => inner.connection_error(c.code, &c.message),
        other => {
            trace!(error = %other, "control stream read failed");
            inner.connection_error(H3_CLOSED_CRITICAL_STREAM, "control stream failed");
        }
    }
}

/// Drains a standard stream whose content the engine does not interpret
/// (push payloads, QPACK encoder/decoder instructions handled by the
/// header-compression capability).
struct DrainStreamHandler {
    name: &'static str,
}

#[async_trait]
impl StreamHandler for DrainStreamHandler {
    async fn handle(&self, mut stream: H3Stream) {
        trace!(name = self.name, stream_id = stream.id(), "draining stream");
        let mut sink = [0u8; 4096];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

/// Body delivery worker: one per in-flight response, reading frames in
/// arrival order and handing chunks to the subscriber.
async fn body_worker(
    inner: Arc<ConnectionInner>,
    mut stream: H3Stream,
    mut sequencer: ResponseSequencer,
    sender: BodySender,
) {
    enum Step {
        Cancelled,
        Frame(H3Result<Option<Frame>>),
    }

    loop {
        let step = tokio::select! {
            _ = sender.cancelled() => Step::Cancelled,
            frame = read_frame(&mut stream, &inner.codec, &inner.limits) => Step::Frame(frame),
        };
        match step {
            Step::Cancelled => {
                debug!(stream_id = stream.id(), "body subscription cancelled");
                stream.abort_read(H3_REQUEST_CANCELLED);
                return;
            }
            Step::Frame(Ok(Some(Frame::Data { payload }))) => {
                if let Err(err) = sequencer.data_received() {
                    sender.fail(inner.escalate(err.into())).await;
                    return;
                }
                if !sender.send_chunk(payload).await {
                    // Subscriber dropped the body handle.
                    stream.abort_read(H3_REQUEST_CANCELLED);
                    return;
                }
            }
            Step::Frame(Ok(Some(Frame::Headers(block)))) => match sequencer.headers_received() {
                Ok(_) => match header_map(&block) {
                    Ok(trailers) => sender.set_trailers(trailers),
                    Err(err) => {
                        sender.fail(err).await;
                        return;
                    }
                },
                Err(err) => {
                    sender.fail(inner.escalate(err.into())).await;
                    return;
                }
            },
            Step::Frame(Ok(Some(Frame::Settings(_)))) => {
                let err =
                    H3Error::connection(H3_FRAME_UNEXPECTED, "SETTINGS frame on a request stream");
                sender.fail(inner.escalate(err)).await;
                return;
            }
            Step::Frame(Ok(Some(Frame::Unknown { .. }))) => {}
            Step::Frame(Ok(None)) => {
                if let Err(err) = sequencer.done() {
                    sender.fail(err).await;
                }
                return;
            }
            Step::Frame(Err(err)) => {
                sender.fail(inner.escalate(err)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{H3_FRAME_ERROR, WEBTRANSPORT_SESSION_GONE};
    use crate::protocol::varint;
    use crate::qpack::testing::{LiteralCodec, ScriptedDecoder};
    use crate::transport::testing::{mock_stream, wait_until, MockTransport, StreamProbe};
    use bytes::BytesMut;

    fn settings_frame_bytes(settings: &Settings) -> Vec<u8> {
        let mut payload = BytesMut::new();
        settings.encode(&mut payload);
        let mut buf = BytesMut::new();
        varint::encode(&mut buf, crate::protocol::frame::FRAME_SETTINGS);
        varint::encode(&mut buf, payload.len() as u64);
        buf.extend_from_slice(&payload);
        buf.to_vec()
    }

    fn control_stream_bytes(settings: &Settings) -> Vec<u8> {
        let mut bytes = varint::encode_to_vec(STREAM_TYPE_CONTROL);
        bytes.extend_from_slice(&settings_frame_bytes(settings));
        bytes
    }

    async fn started_connection(
        codec: Box<dyn HeaderCodec>,
        config: ConnectionConfig,
    ) -> (H3Connection, Arc<MockTransport>, StreamProbe) {
        let transport = MockTransport::new();
        let (control, control_probe) = mock_stream(2, Direction::Unidirectional, b"", false);
        transport.push_uni_open(control);
        let conn = H3Connection::new(transport.clone(), codec, config);
        conn.start().await.unwrap();
        (conn, transport, control_probe)
    }

    #[tokio::test]
    async fn test_start_writes_control_tag_and_settings() {
        let config = ConnectionConfig::builder()
            .qpack_max_table_capacity(4096)
            .build();
        let local = Settings::from_config(&config);
        let (conn, _transport, probe) = started_connection(Box::new(LiteralCodec), config).await;

        assert_eq!(conn.local_state(), EngineState::SettingsSent);
        let mut expected = varint::encode_to_vec(STREAM_TYPE_CONTROL);
        expected.extend_from_slice(&settings_frame_bytes(&local));
        assert_eq!(probe.written(), expected);
    }

    #[tokio::test]
    async fn test_peer_settings_latch_releases() {
        let (conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let settings = Settings {
            qpack_max_table_capacity: 256,
            enable_connect_protocol: true,
            ..Settings::default()
        };
        let (stream, _) = mock_stream(
            3,
            Direction::Unidirectional,
            &control_stream_bytes(&settings),
            false,
        );
        transport.deliver_incoming(stream);

        let received = conn.peer_settings(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.qpack_max_table_capacity, 256);
        assert!(received.enable_connect_protocol);
        assert_eq!(
            conn.peer_settings_parameter(
                crate::protocol::frame::SETTINGS_ENABLE_CONNECT_PROTOCOL,
                Duration::from_millis(10),
            )
            .await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_peer_settings_wait_times_out() {
        let (conn, _transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;
        let err = conn.peer_settings(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(H3Error::Timeout)));
        assert_eq!(
            conn.peer_settings_parameter(0x01, Duration::from_millis(20)).await,
            None
        );
    }

    #[tokio::test]
    async fn test_control_stream_without_settings_first() {
        let (_conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        // Control stream whose first frame is DATA.
        let mut bytes = varint::encode_to_vec(STREAM_TYPE_CONTROL);
        bytes.extend_from_slice(&[0x00, 0x02, b'h', b'i']);
        let (stream, _) = mock_stream(3, Direction::Unidirectional, &bytes, false);
        transport.deliver_incoming(stream);

        wait_until(|| transport.closed().is_some()).await;
        assert_eq!(transport.closed().unwrap().0, H3_MISSING_SETTINGS);
    }

    #[tokio::test]
    async fn test_control_stream_premature_close() {
        let (_conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let settings = Settings::default();
        let (stream, _) = mock_stream(
            3,
            Direction::Unidirectional,
            &control_stream_bytes(&settings),
            true, // EOF after SETTINGS
        );
        transport.deliver_incoming(stream);

        wait_until(|| transport.closed().is_some()).await;
        assert_eq!(transport.closed().unwrap().0, H3_CLOSED_CRITICAL_STREAM);
    }

    #[tokio::test]
    async fn test_unknown_uni_stream_type_aborted() {
        let (_conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let (stream, probe) = mock_stream(3, Direction::Unidirectional, &[0x42], false);
        transport.deliver_incoming(stream);

        wait_until(|| probe.abort_code().is_some()).await;
        assert_eq!(probe.abort_code(), Some(H3_STREAM_CREATION_ERROR));
        assert!(transport.closed().is_none());
    }

    #[tokio::test]
    async fn test_greased_uni_stream_type_aborted() {
        let (_conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let (stream, probe) = mock_stream(3, Direction::Unidirectional, &[0x21], false);
        transport.deliver_incoming(stream);

        wait_until(|| probe.abort_code().is_some()).await;
        assert_eq!(probe.abort_code(), Some(H3_STREAM_CREATION_ERROR));
    }

    #[tokio::test]
    async fn test_unexpected_bidi_stream_closes_connection() {
        let (_conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let (stream, _) = mock_stream(1, Direction::Bidirectional, &[0x33, 0x00], false);
        transport.deliver_incoming(stream);

        wait_until(|| transport.closed().is_some()).await;
        assert_eq!(transport.closed().unwrap().0, H3_STREAM_CREATION_ERROR);
    }

    #[tokio::test]
    async fn test_handler_registration_validation() {
        let (conn, _transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        struct Nop;
        #[async_trait]
        impl StreamHandler for Nop {
            async fn handle(&self, _stream: H3Stream) {}
        }

        assert!(matches!(
            conn.register_uni_handler(STREAM_TYPE_QPACK_ENCODER, Arc::new(Nop)),
            Err(H3Error::InvalidInput(_))
        ));
        assert!(matches!(
            conn.register_uni_handler(0x21 + 0x1f, Arc::new(Nop)),
            Err(H3Error::InvalidInput(_))
        ));
        conn.register_uni_handler(0x54, Arc::new(Nop)).unwrap();
        conn.register_bidi_handler(0x41, Arc::new(Nop)).unwrap();
    }

    // Response bytes: HEADERS (empty block, decoder scripted) + DATA "Nice!".
    fn nice_response_bytes() -> Vec<u8> {
        vec![0x01, 0x00, 0x00, 0x05, b'N', b'i', b'c', b'e', b'!']
    }

    #[tokio::test]
    async fn test_send_request_delivers_status_and_body() {
        let decoder = ScriptedDecoder::new(vec![vec![(":status".into(), "200".into())]]);
        let (conn, transport, _probe) =
            started_connection(Box::new(decoder), ConnectionConfig::default()).await;

        let (stream, req_probe) =
            mock_stream(0, Direction::Bidirectional, &nice_response_bytes(), true);
        transport.push_bidi_open(stream);

        let request = H3Request::get("https://example.com/").build().unwrap();
        let response = conn.send_request(request).await.unwrap();
        assert_eq!(response.status, http::StatusCode::OK);
        assert_eq!(response.body.bytes().await.unwrap(), "Nice!");
        assert!(req_probe.is_finished());
        // Request header frame went out first.
        assert_eq!(req_probe.written()[0], 0x01);
    }

    #[tokio::test]
    async fn test_data_before_headers_closes_connection() {
        let (conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let (stream, _) = mock_stream(
            0,
            Direction::Bidirectional,
            &[0x00, 0x02, b'h', b'i'],
            true,
        );
        transport.push_bidi_open(stream);

        let request = H3Request::get("https://example.com/").build().unwrap();
        let err = conn.send_request(request).await.unwrap_err();
        match err {
            H3Error::Connection(c) => assert_eq!(c.code, H3_FRAME_UNEXPECTED),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert_eq!(transport.closed().unwrap().0, H3_FRAME_UNEXPECTED);
    }

    #[tokio::test]
    async fn test_truncated_headers_closes_connection() {
        let (conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        // HEADERS declares 0x0f payload bytes, stream ends after 0.
        let (stream, _) = mock_stream(0, Direction::Bidirectional, &[0x01, 0x0f], true);
        transport.push_bidi_open(stream);

        let request = H3Request::get("https://example.com/").build().unwrap();
        let err = conn.send_request(request).await.unwrap_err();
        match err {
            H3Error::Connection(c) => assert_eq!(c.code, H3_FRAME_ERROR),
            other => panic!("expected connection error, got {other:?}"),
        }
        assert_eq!(transport.closed().unwrap().0, H3_FRAME_ERROR);
    }

    #[tokio::test]
    async fn test_trailing_headers_after_body() {
        let decoder = ScriptedDecoder::new(vec![
            vec![(":status".into(), "200".into())],
            vec![("grpc-status".into(), "0".into())],
        ]);
        let (conn, transport, _probe) =
            started_connection(Box::new(decoder), ConnectionConfig::default()).await;

        // HEADERS + DATA + trailing HEADERS.
        let bytes = vec![0x01, 0x00, 0x00, 0x02, b'o', b'k', 0x01, 0x00];
        let (stream, _) = mock_stream(0, Direction::Bidirectional, &bytes, true);
        transport.push_bidi_open(stream);

        let request = H3Request::get("https://example.com/").build().unwrap();
        let mut response = conn.send_request(request).await.unwrap();
        assert_eq!(response.body.chunk().await.unwrap().unwrap(), "ok");
        assert!(response.body.chunk().await.unwrap().is_none());
        let trailers = response.trailers().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
    }

    #[tokio::test]
    async fn test_body_cancel_aborts_stream() {
        let decoder = ScriptedDecoder::new(vec![vec![(":status".into(), "200".into())]]);
        let (conn, transport, _probe) =
            started_connection(Box::new(decoder), ConnectionConfig::default()).await;

        // HEADERS arrive, then the stream stays open with no data.
        let (stream, req_probe) = mock_stream(0, Direction::Bidirectional, &[0x01, 0x00], false);
        transport.push_bidi_open(stream);

        let request = H3Request::get("https://example.com/").build().unwrap();
        let response = conn.send_request(request).await.unwrap();
        response.body.cancel();

        wait_until(|| req_probe.abort_code().is_some()).await;
        assert_eq!(req_probe.abort_code(), Some(H3_REQUEST_CANCELLED));
    }

    #[tokio::test]
    async fn test_extended_connect_requires_peer_opt_in() {
        let config = ConnectionConfig::builder()
            .settings_wait(Duration::from_millis(50))
            .build();
        let (conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), config).await;

        // Peer SETTINGS without enable_connect_protocol.
        let (stream, _) = mock_stream(
            3,
            Direction::Unidirectional,
            &control_stream_bytes(&Settings::default()),
            false,
        );
        transport.deliver_incoming(stream);

        let err = conn
            .connect_extended("webtransport", "example.com", "/wt")
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::ExtendedConnectNotEnabled));
    }

    #[tokio::test]
    async fn test_extended_connect_times_out_without_settings() {
        let config = ConnectionConfig::builder()
            .settings_wait(Duration::from_millis(30))
            .build();
        let (conn, _transport, _probe) =
            started_connection(Box::new(LiteralCodec), config).await;

        let err = conn
            .connect_extended("webtransport", "example.com", "/wt")
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::Timeout));
    }

    #[tokio::test]
    async fn test_extended_connect_success_and_refusal() {
        let decoder = ScriptedDecoder::new(vec![
            vec![(":status".into(), "200".into())],
            vec![(":status".into(), "403".into())],
        ]);
        let (conn, transport, _probe) =
            started_connection(Box::new(decoder), ConnectionConfig::default()).await;

        let settings = Settings {
            enable_connect_protocol: true,
            ..Settings::default()
        };
        let (control, _) = mock_stream(
            3,
            Direction::Unidirectional,
            &control_stream_bytes(&settings),
            false,
        );
        transport.deliver_incoming(control);

        // First tunnel: 2xx response (empty HEADERS frame, scripted decode).
        let (accepted, accepted_probe) =
            mock_stream(4, Direction::Bidirectional, &[0x01, 0x00], false);
        transport.push_bidi_open(accepted);
        let tunnel = conn
            .connect_extended("webtransport", "example.com", "/wt")
            .await
            .unwrap();
        assert_eq!(tunnel.id(), 4);
        // CONNECT headers went out, write side still open for capsules.
        assert_eq!(accepted_probe.written()[0], 0x01);
        assert!(!accepted_probe.is_finished());

        // Second tunnel: refused with 403.
        let (refused, _) = mock_stream(8, Direction::Bidirectional, &[0x01, 0x00], false);
        transport.push_bidi_open(refused);
        let err = conn
            .connect_extended("webtransport", "example.com", "/wt")
            .await
            .unwrap_err();
        assert!(matches!(err, H3Error::Http { status: 403 }));
    }

    #[tokio::test]
    async fn test_stream_error_resets_only_that_stream() {
        let (conn, transport, _probe) =
            started_connection(Box::new(LiteralCodec), ConnectionConfig::default()).await;

        let (stream, probe) = mock_stream(12, Direction::Bidirectional, b"", false);
        let stream = H3Stream::new(stream);
        conn.stream_error(WEBTRANSPORT_SESSION_GONE, &stream);
        assert_eq!(probe.reset_code(), Some(WEBTRANSPORT_SESSION_GONE));
        assert!(transport.closed().is_none());
    }
}
