//! Error types and HTTP/3 error codes.

use std::fmt;

/// Result type alias for protocol operations.
pub type H3Result<T> = Result<T, H3Error>;

// HTTP/3 error codes (RFC 9114 Section 8.1). These are the application
// error codes carried in transport-level close / reset / stop-sending
// signals.
pub const H3_NO_ERROR: u64 = 0x0100;
pub const H3_GENERAL_PROTOCOL_ERROR: u64 = 0x0101;
pub const H3_INTERNAL_ERROR: u64 = 0x0102;
pub const H3_STREAM_CREATION_ERROR: u64 = 0x0103;
pub const H3_CLOSED_CRITICAL_STREAM: u64 = 0x0104;
pub const H3_FRAME_UNEXPECTED: u64 = 0x0105;
pub const H3_FRAME_ERROR: u64 = 0x0106;
pub const H3_EXCESSIVE_LOAD: u64 = 0x0107;
pub const H3_ID_ERROR: u64 = 0x0108;
pub const H3_SETTINGS_ERROR: u64 = 0x0109;
pub const H3_MISSING_SETTINGS: u64 = 0x010a;
pub const H3_REQUEST_REJECTED: u64 = 0x010b;
pub const H3_REQUEST_CANCELLED: u64 = 0x010c;
pub const H3_REQUEST_INCOMPLETE: u64 = 0x010d;
pub const H3_MESSAGE_ERROR: u64 = 0x010e;
pub const H3_CONNECT_ERROR: u64 = 0x010f;
pub const H3_VERSION_FALLBACK: u64 = 0x0110;

// WebTransport error codes (draft-ietf-webtrans-http3).
pub const WEBTRANSPORT_BUFFERED_STREAM_REJECTED: u64 = 0x3994bd84;
pub const WEBTRANSPORT_SESSION_GONE: u64 = 0x170d7b68;

/// Main error type for HTTP/3 and WebTransport operations.
#[derive(Debug, thiserror::Error)]
pub enum H3Error {
    /// Transport-level I/O failure (connection or stream gone).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation that closes the whole connection.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Stream-local failure mapped to an HTTP status code.
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// The peer reset a stream with the given application error code.
    #[error("stream reset with code {code:#x}")]
    StreamReset { code: u64 },

    /// A received message could not be interpreted (e.g. missing or
    /// non-numeric `:status`).
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The header-compression capability failed to (de)compress a block.
    #[error("header compression failed: {0}")]
    HeaderCompression(String),

    /// A deadline-guarded wait expired.
    #[error("operation timed out")]
    Timeout,

    /// The peer did not advertise SETTINGS_ENABLE_CONNECT_PROTOCOL.
    #[error("extended CONNECT not enabled by peer")]
    ExtendedConnectNotEnabled,

    /// Operation on a WebTransport session that is already closed.
    #[error("WebTransport session {session_id} is closed")]
    SessionClosed { session_id: u64 },

    /// A local resource limit was reached; the caller may retry later.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Caller-supplied input rejected before any I/O.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl H3Error {
    /// Shorthand for a [`ConnectionError`] wrapped in [`H3Error`].
    pub fn connection<T: fmt::Display>(code: u64, message: T) -> Self {
        H3Error::Connection(ConnectionError::new(code, message))
    }

    /// Check if this error is recoverable without tearing down the
    /// connection (the caller may retry or back off).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            H3Error::Timeout | H3Error::Capacity(_) | H3Error::Http { .. }
        )
    }

    /// Check if this error must be resolved by closing the connection.
    pub fn should_close_connection(&self) -> bool {
        matches!(self, H3Error::Connection(_))
    }
}

/// A protocol violation resolved by closing the connection with an
/// HTTP/3 error code.
#[derive(Debug, thiserror::Error)]
#[error("connection error {code:#x}: {message}")]
pub struct ConnectionError {
    /// HTTP/3 error code sent in the transport close.
    pub code: u64,
    /// Human-readable description of the violation.
    pub message: String,
}

impl ConnectionError {
    /// Create a new connection error with the given code.
    pub fn new<T: fmt::Display>(code: u64, message: T) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }

    /// Illegal frame for the current stream state.
    pub fn frame_unexpected<T: fmt::Display>(message: T) -> Self {
        Self::new(H3_FRAME_UNEXPECTED, message)
    }

    /// Truncated or malformed frame.
    pub fn frame_error<T: fmt::Display>(message: T) -> Self {
        Self::new(H3_FRAME_ERROR, message)
    }
}
