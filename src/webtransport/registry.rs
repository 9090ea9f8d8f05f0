//! WebTransport client: session registry, factory, and demultiplexing of
//! incoming WebTransport streams.
//!
//! Incoming streams carry a session id that may refer to a session whose
//! CONNECT exchange is still in flight. The registry buffers such
//! streams (bounded) and replays them when the session starts, and tells
//! "not yet created" apart from "already closed and gone" with a
//! monotonic session-id watermark. Registration, lookup, buffering, and
//! removal all happen under one lock so a stream arriving concurrently
//! with session registration cannot be lost.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::connection::{H3Connection, StreamHandler};
use crate::error::{
    H3Error, H3Result, WEBTRANSPORT_BUFFERED_STREAM_REJECTED, WEBTRANSPORT_SESSION_GONE,
};
use crate::protocol::stream::H3Stream;
use crate::protocol::{STREAM_TYPE_WEBTRANSPORT, WEBTRANSPORT_STREAM_SIGNAL};
use crate::webtransport::session::WebTransportSession;

/// Hard cap on streams buffered across all not-yet-started sessions.
const MAX_PENDING_STREAMS: usize = 3;

/// Factory and registry for WebTransport sessions over one HTTP/3
/// connection.
pub struct WebTransportClient {
    conn: H3Connection,
    shared: Arc<RegistryShared>,
}

pub(crate) struct RegistryShared {
    state: StdMutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<u64, WebTransportSession>,
    pending: HashMap<u64, VecDeque<H3Stream>>,
    pending_total: usize,
    /// Highest session id ever registered; ids at or below it that are
    /// no longer registered belong to sessions that are gone for good.
    latest_session_id: Option<u64>,
}

impl WebTransportClient {
    /// Attach a WebTransport layer to `conn`, registering the stream
    /// type 0x54 and signal 0x41 demultiplexers.
    pub fn new(conn: H3Connection) -> H3Result<Self> {
        let shared = Arc::new(RegistryShared {
            state: StdMutex::new(RegistryState::default()),
        });
        conn.register_uni_handler(
            STREAM_TYPE_WEBTRANSPORT,
            Arc::new(UniStreamDemux {
                registry: Arc::downgrade(&shared),
            }),
        )?;
        conn.register_bidi_handler(
            WEBTRANSPORT_STREAM_SIGNAL,
            Arc::new(BidiStreamDemux {
                registry: Arc::downgrade(&shared),
            }),
        )?;
        Ok(Self { conn, shared })
    }

    /// Establish a new WebTransport session via extended CONNECT and
    /// register it. The session still has to be started with
    /// [`WebTransportSession::open`].
    pub async fn create_session(
        &self,
        authority: &str,
        path: &str,
    ) -> H3Result<WebTransportSession> {
        let max_sessions = self.conn.config().max_webtransport_sessions;
        {
            let state = self.shared.state.lock().unwrap();
            if state.sessions.len() >= max_sessions {
                return Err(H3Error::Capacity(format!(
                    "maximum of {max_sessions} WebTransport sessions reached"
                )));
            }
        }

        let tunnel = tokio::time::timeout(
            self.conn.config().connect_timeout,
            self.conn.connect_extended("webtransport", authority, path),
        )
        .await
        .map_err(|_| H3Error::Timeout)??;
        let session =
            WebTransportSession::new(self.conn.clone(), Arc::downgrade(&self.shared), tunnel);

        let mut state = self.shared.state.lock().unwrap();
        let id = session.session_id();
        state.latest_session_id = Some(state.latest_session_id.map_or(id, |latest| latest.max(id)));
        state.sessions.insert(id, session.clone());
        debug!(session_id = id, authority, path, "session registered");
        Ok(session)
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().unwrap().sessions.len()
    }

    /// Number of streams currently buffered for not-yet-started
    /// sessions.
    pub fn pending_streams(&self) -> usize {
        self.shared.state.lock().unwrap().pending_total
    }
}

impl RegistryShared {
    /// Route an incoming stream for `session_id`: deliver to an open
    /// session, reject it if the session is gone, or buffer it until the
    /// session starts. Runs entirely under the registry lock.
    fn attach_or_queue(&self, session_id: u64, stream: H3Stream) {
        let mut state = self.state.lock().unwrap();

        let registered = state.sessions.get(&session_id).cloned();
        match registered {
            Some(session) if session.is_open() => {
                drop(state);
                tokio::spawn(async move {
                    session.dispatch_incoming(stream).await;
                });
                return;
            }
            Some(_) => {
                // Registered but not started: buffer below.
            }
            None => {
                if state
                    .latest_session_id
                    .map_or(false, |latest| session_id <= latest)
                {
                    drop(state);
                    trace!(session_id, "stream for a session that is gone");
                    reject(&stream, WEBTRANSPORT_SESSION_GONE);
                    return;
                }
            }
        }

        if state.pending_total >= MAX_PENDING_STREAMS {
            drop(state);
            warn!(session_id, "pending-stream buffer full, rejecting stream");
            reject(&stream, WEBTRANSPORT_BUFFERED_STREAM_REJECTED);
            return;
        }
        state.pending_total += 1;
        state
            .pending
            .entry(session_id)
            .or_default()
            .push_back(stream);
        trace!(session_id, "buffered stream for pending session");
    }

    /// Mark `session` open and hand back the streams buffered for it, in
    /// arrival order.
    pub(crate) fn start_session(&self, session: &WebTransportSession) -> Vec<H3Stream> {
        let mut state = self.state.lock().unwrap();
        session.mark_open();
        let queued: Vec<H3Stream> = state
            .pending
            .remove(&session.session_id())
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default();
        state.pending_total -= queued.len();
        queued
    }

    /// Drop a session's registry entry and any streams still buffered
    /// for it.
    pub(crate) fn remove_session(&self, session_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(&session_id);
        let stale = state.pending.remove(&session_id);
        if let Some(stale) = stale {
            state.pending_total -= stale.len();
            drop(state);
            for stream in stale {
                reject(&stream, WEBTRANSPORT_SESSION_GONE);
            }
        }
    }
}

fn reject(stream: &H3Stream, code: u64) {
    stream.abort_read(code);
    if stream.is_bidirectional() {
        stream.reset(code);
    }
}

/// Demultiplexer for unidirectional WebTransport streams (type 0x54).
/// The stream-type tag has been consumed; the session id follows.
struct UniStreamDemux {
    registry: Weak<RegistryShared>,
}

#[async_trait]
impl StreamHandler for UniStreamDemux {
    async fn handle(&self, mut stream: H3Stream) {
        let session_id = match stream.read_varint().await {
            Ok(Some(id)) => id,
            _ => return,
        };
        match self.registry.upgrade() {
            Some(registry) => registry.attach_or_queue(session_id, stream),
            None => stream.abort_read(WEBTRANSPORT_SESSION_GONE),
        }
    }
}

/// Demultiplexer for bidirectional WebTransport streams: the signal
/// varint 0x41 (still unconsumed) is followed by the session id.
struct BidiStreamDemux {
    registry: Weak<RegistryShared>,
}

#[async_trait]
impl StreamHandler for BidiStreamDemux {
    async fn handle(&self, mut stream: H3Stream) {
        let signal = stream.read_varint().await;
        debug_assert!(matches!(signal, Ok(Some(WEBTRANSPORT_STREAM_SIGNAL))));
        let session_id = match stream.read_varint().await {
            Ok(Some(id)) => id,
            _ => return,
        };
        match self.registry.upgrade() {
            Some(registry) => registry.attach_or_queue(session_id, stream),
            None => {
                stream.abort_read(WEBTRANSPORT_SESSION_GONE);
                stream.reset(WEBTRANSPORT_SESSION_GONE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::protocol::frame::Settings;
    use crate::protocol::varint;
    use crate::qpack::testing::ScriptedDecoder;
    use crate::transport::testing::{mock_stream, wait_until, MockTransport, StreamProbe};
    use crate::transport::Direction;
    use crate::webtransport::session::IncomingStreamHandler;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn control_stream_bytes() -> Vec<u8> {
        let settings = Settings {
            enable_connect_protocol: true,
            ..Settings::default()
        };
        let mut payload = BytesMut::new();
        settings.encode(&mut payload);
        let mut bytes = BytesMut::new();
        varint::encode(&mut bytes, crate::protocol::STREAM_TYPE_CONTROL);
        varint::encode(&mut bytes, crate::protocol::frame::FRAME_SETTINGS);
        varint::encode(&mut bytes, payload.len() as u64);
        bytes.extend_from_slice(&payload);
        bytes.to_vec()
    }

    /// Connection with WebTransport enabled by the peer, plus a client
    /// prepared for `tunnels` extended CONNECT exchanges (tunnel stream
    /// ids 4, 8, ...).
    async fn client_fixture(
        max_sessions: usize,
        tunnels: usize,
    ) -> (WebTransportClient, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let (control_out, _) = mock_stream(2, Direction::Unidirectional, b"", false);
        transport.push_uni_open(control_out);

        let decoder = ScriptedDecoder::new(vec![
            vec![(":status".into(), "200".into())];
            tunnels
        ]);
        let config = ConnectionConfig::builder()
            .max_webtransport_sessions(max_sessions)
            .settings_wait(Duration::from_secs(1))
            .build();
        let conn = H3Connection::new(transport.clone(), Box::new(decoder), config);
        conn.start().await.unwrap();

        let (control_in, _) =
            mock_stream(3, Direction::Unidirectional, &control_stream_bytes(), false);
        transport.deliver_incoming(control_in);

        for i in 0..tunnels {
            // Tunnel response: HEADERS frame with an empty block.
            let (tunnel, _) = mock_stream(
                4 * (i as u64 + 1),
                Direction::Bidirectional,
                &[0x01, 0x00],
                false,
            );
            transport.push_bidi_open(tunnel);
        }

        let client = WebTransportClient::new(conn).unwrap();
        (client, transport)
    }

    /// Incoming bidirectional WebTransport stream carrying `payload` for
    /// `session_id`.
    fn incoming_bidi(
        stream_id: u64,
        session_id: u64,
        payload: &[u8],
    ) -> (crate::transport::TransportStream, StreamProbe) {
        let mut bytes = BytesMut::new();
        varint::encode(&mut bytes, WEBTRANSPORT_STREAM_SIGNAL);
        varint::encode(&mut bytes, session_id);
        bytes.extend_from_slice(payload);
        mock_stream(stream_id, Direction::Bidirectional, &bytes, true)
    }

    /// Incoming unidirectional WebTransport stream (type 0x54).
    fn incoming_uni(
        stream_id: u64,
        session_id: u64,
        payload: &[u8],
    ) -> (crate::transport::TransportStream, StreamProbe) {
        let mut bytes = BytesMut::new();
        varint::encode(&mut bytes, STREAM_TYPE_WEBTRANSPORT);
        varint::encode(&mut bytes, session_id);
        bytes.extend_from_slice(payload);
        mock_stream(stream_id, Direction::Unidirectional, &bytes, true)
    }

    /// Handler that reads each stream to the end and reports its
    /// payload.
    struct Collector {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl IncomingStreamHandler for Collector {
        async fn handle(&self, _session_id: u64, mut stream: H3Stream) {
            let mut data = Vec::new();
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                }
            }
            let _ = self.tx.send(String::from_utf8_lossy(&data).into_owned());
        }
    }

    #[tokio::test]
    async fn test_stream_before_session_is_buffered_then_delivered() {
        let (client, transport) = client_fixture(1, 1).await;

        // Signal 0x41, session id 4, payload "hi" arrives before the
        // session exists.
        let (early, _) = incoming_bidi(16, 4, b"hi");
        transport.deliver_incoming(early);
        wait_until(|| client.pending_streams() == 1).await;

        let session = client.create_session("example.com", "/wt").await.unwrap();
        assert_eq!(session.session_id(), 4);

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_bidirectional_stream_handler(Arc::new(Collector { tx }));
        session.open().await.unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered, "hi");
        assert_eq!(client.pending_streams(), 0);
        // Exactly once.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_buffer_cap_rejects_overflow() {
        let (client, transport) = client_fixture(1, 1).await;

        let mut probes = Vec::new();
        for i in 0..5u64 {
            let (stream, probe) = incoming_uni(20 + 4 * i, 4, format!("s{i}").as_bytes());
            transport.deliver_incoming(stream);
            probes.push(probe);
            // Wait for this stream to be either buffered or rejected
            // before sending the next, keeping arrival order exact.
            let expected_buffered = (i as usize + 1).min(MAX_PENDING_STREAMS);
            let client = &client;
            let probes = &probes;
            wait_until(move || {
                let rejected = probes.iter().filter(|p| p.abort_code().is_some()).count();
                client.pending_streams() == expected_buffered
                    && rejected == (i as usize + 1) - expected_buffered
            })
            .await;
        }

        // First three buffered, last two rejected.
        for probe in &probes[..3] {
            assert_eq!(probe.abort_code(), None);
        }
        for probe in &probes[3..] {
            assert_eq!(
                probe.abort_code(),
                Some(WEBTRANSPORT_BUFFERED_STREAM_REJECTED)
            );
        }

        let session = client.create_session("example.com", "/wt").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.set_unidirectional_stream_handler(Arc::new(Collector { tx }));
        session.open().await.unwrap();

        // The three buffered streams are delivered in arrival order.
        assert_eq!(rx.recv().await.unwrap(), "s0");
        assert_eq!(rx.recv().await.unwrap(), "s1");
        assert_eq!(rx.recv().await.unwrap(), "s2");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_for_gone_session_is_rejected() {
        let (client, transport) = client_fixture(1, 1).await;

        let session = client.create_session("example.com", "/wt").await.unwrap();
        session.open().await.unwrap();
        session.close(0, "").await.unwrap();
        assert_eq!(client.session_count(), 0);

        let (late, probe) = incoming_bidi(24, 4, b"too late");
        transport.deliver_incoming(late);

        wait_until(|| probe.abort_code().is_some()).await;
        assert_eq!(probe.abort_code(), Some(WEBTRANSPORT_SESSION_GONE));
        assert_eq!(probe.reset_code(), Some(WEBTRANSPORT_SESSION_GONE));
    }

    #[tokio::test]
    async fn test_stream_for_future_session_still_buffers_after_close() {
        let (client, transport) = client_fixture(1, 1).await;

        let session = client.create_session("example.com", "/wt").await.unwrap();
        session.open().await.unwrap();
        session.close(0, "").await.unwrap();

        // Session id 8 is above the watermark: not gone, just not yet
        // created.
        let (early, probe) = incoming_uni(28, 8, b"early");
        transport.deliver_incoming(early);

        wait_until(|| client.pending_streams() == 1).await;
        assert_eq!(probe.abort_code(), None);
    }

    #[tokio::test]
    async fn test_session_capacity_is_enforced() {
        let (client, _transport) = client_fixture(1, 1).await;

        let _session = client.create_session("example.com", "/wt").await.unwrap();
        let err = client.create_session("example.com", "/wt").await.unwrap_err();
        assert!(matches!(err, H3Error::Capacity(_)));
    }

    #[tokio::test]
    async fn test_removed_session_drops_its_pending_queue() {
        let (client, transport) = client_fixture(2, 2).await;

        // Register session 4 but do not open it; a stream for it gets
        // buffered.
        let session = client.create_session("example.com", "/wt").await.unwrap();
        let (buffered, probe) = incoming_uni(32, 4, b"pending");
        transport.deliver_incoming(buffered);
        wait_until(|| client.pending_streams() == 1).await;

        // Closing the never-opened session drops the queue too.
        session.close(0, "").await.unwrap();
        assert_eq!(client.pending_streams(), 0);
        assert_eq!(probe.abort_code(), Some(WEBTRANSPORT_SESSION_GONE));
    }
}
