//! Capsule send/receive channel over an extended CONNECT tunnel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::trace;

use crate::error::H3Result;
use crate::protocol::capsule::Capsule;
use crate::protocol::stream::H3Stream;
use crate::transport::StreamController;

/// Decodes one capsule type from the raw tunnel stream.
///
/// A parser is handed the stream positioned at its capsule's type varint
/// and must consume exactly its own framing. Read failures surface to
/// the caller of [`CapsuleStream::receive`].
#[async_trait]
pub trait CapsuleParser: Send + Sync {
    async fn parse(&self, stream: &mut H3Stream) -> H3Result<Capsule>;
}

/// Turns a bidirectional stream into a capsule channel with pluggable
/// per-type parsers and a generic fallback.
pub struct CapsuleStream {
    stream: H3Stream,
    parsers: HashMap<u64, Arc<dyn CapsuleParser>>,
}

impl CapsuleStream {
    /// Wrap a tunnel stream.
    pub fn new(stream: H3Stream) -> Self {
        Self {
            stream,
            parsers: HashMap::new(),
        }
    }

    /// Register a parser for one capsule type.
    pub fn register_parser(&mut self, capsule_type: u64, parser: Arc<dyn CapsuleParser>) {
        self.parsers.insert(capsule_type, parser);
    }

    /// Receive the next capsule, dispatching on the (peeked, unconsumed)
    /// type varint. Types without a registered parser fall back to
    /// generic parsing. Returns `Ok(None)` at end of stream.
    pub async fn receive(&mut self) -> H3Result<Option<Capsule>> {
        let capsule_type = match self.stream.peek_varint().await? {
            Some(t) => t,
            None => return Ok(None),
        };
        match self.parsers.get(&capsule_type) {
            Some(parser) => {
                trace!(capsule_type, "dispatching to registered capsule parser");
                parser.clone().parse(&mut self.stream).await.map(Some)
            }
            None => Capsule::read(&mut self.stream).await,
        }
    }

    /// Send one capsule and flush, so the peer never has to buffer a
    /// capsule split across delivery boundaries.
    pub async fn send(&mut self, capsule: &Capsule) -> H3Result<()> {
        let mut buf = BytesMut::new();
        capsule.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send one capsule, then close the write side of the stream.
    pub async fn send_and_close(&mut self, capsule: &Capsule) -> H3Result<()> {
        self.send(capsule).await?;
        self.stream.finish().await?;
        Ok(())
    }

    /// Split into a receive half (keeping the registered parsers) and a
    /// send half.
    pub fn split(self) -> (CapsuleStream, CapsuleStream) {
        let (rx, tx) = self.stream.split();
        (
            CapsuleStream {
                stream: rx,
                parsers: self.parsers,
            },
            CapsuleStream {
                stream: tx,
                parsers: HashMap::new(),
            },
        )
    }

    /// Control-plane handle of the underlying stream.
    pub fn controller(&self) -> Arc<dyn StreamController> {
        self.stream.controller()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::H3Error;
    use crate::transport::testing::mock_stream;
    use crate::transport::Direction;
    use bytes::Bytes;

    fn capsule_stream(data: &[u8]) -> CapsuleStream {
        let (ts, _) = mock_stream(4, Direction::Bidirectional, data, true);
        CapsuleStream::new(H3Stream::new(ts))
    }

    #[tokio::test]
    async fn test_generic_fallback_parsing() {
        // Unknown capsule type 0x17, length 2.
        let mut stream = capsule_stream(&[0x17, 0x02, 0xaa, 0xbb]);
        let capsule = stream.receive().await.unwrap().unwrap();
        assert_eq!(
            capsule,
            Capsule::Unknown {
                capsule_type: 0x17,
                payload: Bytes::from_static(&[0xaa, 0xbb]),
            }
        );
        assert!(stream.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registered_parser_takes_precedence() {
        struct FixedParser;

        #[async_trait]
        impl CapsuleParser for FixedParser {
            async fn parse(&self, stream: &mut H3Stream) -> H3Result<Capsule> {
                // Consume exactly our framing: type, length, payload.
                let capsule_type = stream.read_varint().await?.unwrap();
                let length = stream.read_varint().await?.unwrap() as usize;
                stream.skip(length).await?;
                Ok(Capsule::Unknown {
                    capsule_type,
                    payload: Bytes::from_static(b"parsed"),
                })
            }
        }

        let mut stream = capsule_stream(&[0x17, 0x02, 0xaa, 0xbb]);
        stream.register_parser(0x17, Arc::new(FixedParser));
        let capsule = stream.receive().await.unwrap().unwrap();
        assert_eq!(
            capsule,
            Capsule::Unknown {
                capsule_type: 0x17,
                payload: Bytes::from_static(b"parsed"),
            }
        );
    }

    #[tokio::test]
    async fn test_parser_read_failure_surfaces() {
        struct FailingParser;

        #[async_trait]
        impl CapsuleParser for FailingParser {
            async fn parse(&self, stream: &mut H3Stream) -> H3Result<Capsule> {
                stream.read_varint().await?;
                // Demand more bytes than the stream holds.
                stream.read_exact(64).await?;
                unreachable!("read_exact fails first")
            }
        }

        let mut stream = capsule_stream(&[0x17, 0x00]);
        stream.register_parser(0x17, Arc::new(FailingParser));
        assert!(matches!(
            stream.receive().await,
            Err(H3Error::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_send_and_close_finishes_stream() {
        let (ts, probe) = mock_stream(4, Direction::Bidirectional, b"", true);
        let mut stream = CapsuleStream::new(H3Stream::new(ts));
        let capsule = Capsule::close_session(0, "done").unwrap();
        stream.send_and_close(&capsule).await.unwrap();

        let written = probe.written();
        assert_eq!(&written[..2], &[0x68, 0x43]);
        assert!(probe.is_finished());
    }

    #[tokio::test]
    async fn test_split_receive_keeps_parsers() {
        let close = Capsule::close_session(7, "x").unwrap();
        let mut buf = BytesMut::new();
        close.encode(&mut buf);

        let (ts, probe) = mock_stream(4, Direction::Bidirectional, &buf, true);
        let stream = CapsuleStream::new(H3Stream::new(ts));
        let (mut rx, mut tx) = stream.split();

        match rx.receive().await.unwrap().unwrap() {
            Capsule::CloseSession { error_code, .. } => assert_eq!(error_code, 7),
            other => panic!("expected CloseSession, got {other:?}"),
        }
        assert_eq!(
            rx.receive().await.unwrap(),
            None,
            "stream ends after one capsule"
        );

        tx.send(&Capsule::close_session(0, "").unwrap()).await.unwrap();
        assert!(!probe.written().is_empty());
    }
}
