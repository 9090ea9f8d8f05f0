//! WebTransport over HTTP/3 (draft-ietf-webtrans-http3): capsule
//! protocol streams, sessions, and the session registry.

pub mod capsule_stream;
pub mod registry;
pub mod session;

pub use capsule_stream::{CapsuleParser, CapsuleStream};
pub use registry::WebTransportClient;
pub use session::{IncomingStreamHandler, SessionState, WebTransportSession};
