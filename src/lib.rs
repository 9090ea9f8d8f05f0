//! # h3-webtransport
//!
//! An HTTP/3 (RFC 9114) and WebTransport (draft-ietf-webtrans-http3)
//! protocol engine running over an already-established multiplexed
//! stream transport (QUIC), consumed through a narrow capability trait.
//!
//! ## Features
//!
//! - **Frame engine**: HTTP/3 frame codec with strict per-stream
//!   frame-sequencing rules and RFC error codes
//! - **Connection engine**: control-stream lifecycle, SETTINGS exchange,
//!   per-stream-type dispatch
//! - **Extended CONNECT**: capsule-protocol tunnels (RFC 9220)
//! - **WebTransport**: sessions multiplexing streams over one CONNECT
//!   tunnel, with bounded buffering for streams that arrive before their
//!   session
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use h3_webtransport::{ConnectionConfig, H3Connection, H3Request, WebTransportClient};
//! # use std::sync::Arc;
//! # async fn run(
//! #     transport: Arc<dyn h3_webtransport::transport::TransportConnection>,
//! #     codec: Box<dyn h3_webtransport::qpack::HeaderCodec>,
//! # ) -> h3_webtransport::H3Result<()> {
//! let conn = H3Connection::new(transport, codec, ConnectionConfig::default());
//! conn.start().await?;
//!
//! let request = H3Request::get("https://example.com/").build().unwrap();
//! let response = conn.send_request(request).await?;
//! println!("status: {}", response.status);
//!
//! let client = WebTransportClient::new(conn)?;
//! let session = client.create_session("example.com", "/wt").await?;
//! session.open().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod qpack;
pub mod transport;
pub mod webtransport;

// Re-export main types for convenience
pub use config::ConnectionConfig;
pub use connection::{H3Connection, StreamHandler};
pub use error::{H3Error, H3Result};
pub use protocol::{Capsule, Frame, H3Request, H3Response, H3Stream, Settings};
pub use webtransport::{WebTransportClient, WebTransportSession};

// Re-export common HTTP types
pub use http::{HeaderMap, Method, StatusCode, Uri};
