//! HTTP/3 frame parsing and encoding (RFC 9114 Section 7).

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, H3Error, H3Result, H3_SETTINGS_ERROR};
use crate::protocol::stream::H3Stream;
use crate::protocol::varint;
use crate::qpack::SharedHeaderCodec;

// Frame type constants (RFC 9114 Section 7.2). Only DATA, HEADERS, and
// SETTINGS are interpreted; everything else is skipped as an unknown or
// extension frame.
pub const FRAME_DATA: u64 = 0x00;
pub const FRAME_HEADERS: u64 = 0x01;
pub const FRAME_CANCEL_PUSH: u64 = 0x03;
pub const FRAME_SETTINGS: u64 = 0x04;
pub const FRAME_PUSH_PROMISE: u64 = 0x05;
pub const FRAME_GOAWAY: u64 = 0x07;
pub const FRAME_MAX_PUSH_ID: u64 = 0x0d;

// SETTINGS identifiers (RFC 9114 Section 7.2.4.1, RFC 9220).
pub const SETTINGS_QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
pub const SETTINGS_QPACK_BLOCKED_STREAMS: u64 = 0x07;
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;

/// HTTP/3 frame types interpreted by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// DATA frame (0x00) - carries request/response body
    Data,
    /// HEADERS frame (0x01) - carries a compressed field section
    Headers,
    /// SETTINGS frame (0x04) - carries connection settings
    Settings,
    /// Any other frame type, ignored per RFC 9114 Section 9
    Unknown(u64),
}

impl FrameType {
    /// Classify a wire frame-type value.
    pub fn from_id(id: u64) -> Self {
        match id {
            FRAME_DATA => FrameType::Data,
            FRAME_HEADERS => FrameType::Headers,
            FRAME_SETTINGS => FrameType::Settings,
            other => FrameType::Unknown(other),
        }
    }
}

/// An HTTP/3 frame, immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// DATA frame: body bytes, written verbatim.
    Data { payload: Bytes },
    /// HEADERS frame: decoded field section.
    Headers(HeaderBlock),
    /// SETTINGS frame: connection parameters.
    Settings(Settings),
    /// Unknown or unimplemented frame type; payload already discarded.
    Unknown { frame_type: u64 },
}

impl Frame {
    /// The frame's wire type.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Headers(_) => FrameType::Headers,
            Frame::Settings(_) => FrameType::Settings,
            Frame::Unknown { frame_type } => FrameType::Unknown(*frame_type),
        }
    }
}

/// A decoded HEADERS field section: `:`-prefixed pseudo-headers plus the
/// ordered regular header list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBlock {
    pseudo: BTreeMap<String, String>,
    fields: Vec<(String, String)>,
}

impl HeaderBlock {
    /// Field section for a regular request.
    pub fn request(method: &str, scheme: &str, authority: &str, path: &str) -> Self {
        let mut block = HeaderBlock::default();
        block.set_pseudo(":method", method);
        block.set_pseudo(":scheme", scheme);
        block.set_pseudo(":authority", authority);
        block.set_pseudo(":path", path);
        block
    }

    /// Field section for a plain CONNECT request.
    pub fn connect(authority: &str) -> Self {
        let mut block = HeaderBlock::default();
        block.set_pseudo(":method", "CONNECT");
        block.set_pseudo(":authority", authority);
        block
    }

    /// Field section for an extended CONNECT request (RFC 8441 / RFC 9220).
    pub fn extended_connect(protocol: &str, scheme: &str, authority: &str, path: &str) -> Self {
        let mut block = HeaderBlock::connect(authority);
        block.set_pseudo(":protocol", protocol);
        block.set_pseudo(":scheme", scheme);
        block.set_pseudo(":path", path);
        block
    }

    /// Field section for a response.
    pub fn response(status: u16) -> Self {
        let mut block = HeaderBlock::default();
        block.set_pseudo(":status", &status.to_string());
        block
    }

    /// Set a pseudo-header. The name must carry the `:` prefix.
    pub fn set_pseudo(&mut self, name: &str, value: &str) {
        debug_assert!(name.starts_with(':'), "pseudo-header without ':' prefix");
        self.pseudo.insert(name.to_string(), value.to_string());
    }

    /// Look up a pseudo-header value.
    pub fn pseudo(&self, name: &str) -> Option<&str> {
        self.pseudo.get(name).map(String::as_str)
    }

    /// Append a regular header field. Rejects `:`-prefixed names, which
    /// are reserved for pseudo-headers.
    pub fn add_field(&mut self, name: &str, value: &str) -> H3Result<()> {
        if name.starts_with(':') {
            return Err(H3Error::InvalidInput(format!(
                "'{name}' is a pseudo-header, not a field name"
            )));
        }
        self.fields.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// The regular header fields in order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// The response status, failing on an absent or non-numeric
    /// `:status`.
    pub fn status(&self) -> H3Result<u16> {
        let raw = self
            .pseudo(":status")
            .ok_or_else(|| H3Error::Malformed("response without :status".into()))?;
        raw.parse()
            .map_err(|_| H3Error::Malformed(format!("non-numeric :status '{raw}'")))
    }

    /// Flatten into the ordered list handed to the header codec, with
    /// pseudo-headers first as the compression format requires.
    pub fn to_field_list(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .pseudo
            .iter()
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect();
        list.extend(self.fields.iter().cloned());
        list
    }

    /// Rebuild from a decompressed field list. Pseudo-headers must all
    /// precede regular fields.
    pub fn from_field_list(list: Vec<(String, String)>) -> H3Result<Self> {
        let mut block = HeaderBlock::default();
        let mut seen_regular = false;
        for (name, value) in list {
            if let Some(stripped) = name.strip_prefix(':') {
                if seen_regular {
                    return Err(H3Error::Malformed(format!(
                        "pseudo-header :{stripped} after regular fields"
                    )));
                }
                block.pseudo.insert(name, value);
            } else {
                seen_regular = true;
                block.fields.push((name, value));
            }
        }
        Ok(block)
    }

    /// Validate the pseudo-header set of an outgoing request.
    pub fn validate_request(&self) -> H3Result<()> {
        let method = self
            .pseudo(":method")
            .ok_or_else(|| H3Error::InvalidInput("request without :method".into()))?;
        if method == "CONNECT" {
            if self.pseudo(":authority").is_none() {
                return Err(H3Error::InvalidInput("CONNECT without :authority".into()));
            }
            if self.pseudo(":protocol").is_some() {
                for required in [":scheme", ":path"] {
                    if self.pseudo(required).is_none() {
                        return Err(H3Error::InvalidInput(format!(
                            "extended CONNECT without {required}"
                        )));
                    }
                }
            }
            return Ok(());
        }
        for required in [":method", ":scheme", ":path"] {
            if self.pseudo(required).is_none() {
                return Err(H3Error::InvalidInput(format!("request without {required}")));
            }
        }
        Ok(())
    }
}

/// HTTP/3 SETTINGS parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// SETTINGS_QPACK_MAX_TABLE_CAPACITY (0x01).
    pub qpack_max_table_capacity: u64,
    /// SETTINGS_QPACK_BLOCKED_STREAMS (0x07).
    pub qpack_blocked_streams: u64,
    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x08), serialized only when set.
    pub enable_connect_protocol: bool,
    /// Extension parameters, forwarded verbatim.
    pub extra: BTreeMap<u64, u64>,
}

impl Settings {
    /// Local SETTINGS derived from the connection configuration.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            qpack_max_table_capacity: config.qpack_max_table_capacity,
            qpack_blocked_streams: config.qpack_blocked_streams,
            enable_connect_protocol: false,
            extra: config.extra_settings.clone(),
        }
    }

    fn entries(&self) -> BTreeMap<u64, u64> {
        let mut entries = self.extra.clone();
        entries.insert(
            SETTINGS_QPACK_MAX_TABLE_CAPACITY,
            self.qpack_max_table_capacity,
        );
        entries.insert(SETTINGS_QPACK_BLOCKED_STREAMS, self.qpack_blocked_streams);
        if self.enable_connect_protocol {
            entries.insert(SETTINGS_ENABLE_CONNECT_PROTOCOL, 1);
        }
        entries
    }

    /// Encode as (identifier, value) varint pairs sorted by identifier.
    pub fn encode(&self, buf: &mut BytesMut) {
        for (id, value) in self.entries() {
            varint::encode(buf, id);
            varint::encode(buf, value);
        }
    }

    /// Decode from a SETTINGS frame payload.
    pub fn decode(mut payload: &[u8]) -> H3Result<Self> {
        let mut settings = Settings::default();
        while !payload.is_empty() {
            let (id, n) = varint::decode(payload)
                .ok_or_else(|| settings_error("truncated identifier"))?;
            payload = &payload[n..];
            let (value, n) =
                varint::decode(payload).ok_or_else(|| settings_error("truncated value"))?;
            payload = &payload[n..];
            match id {
                SETTINGS_QPACK_MAX_TABLE_CAPACITY => settings.qpack_max_table_capacity = value,
                SETTINGS_QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                SETTINGS_ENABLE_CONNECT_PROTOCOL => match value {
                    0 => settings.enable_connect_protocol = false,
                    1 => settings.enable_connect_protocol = true,
                    v => {
                        return Err(settings_error(format!(
                            "SETTINGS_ENABLE_CONNECT_PROTOCOL must be 0 or 1, got {v}"
                        )))
                    }
                },
                other => {
                    settings.extra.insert(other, value);
                }
            }
        }
        Ok(settings)
    }

    /// Look up a parameter by wire identifier.
    pub fn parameter(&self, id: u64) -> Option<u64> {
        match id {
            SETTINGS_QPACK_MAX_TABLE_CAPACITY => Some(self.qpack_max_table_capacity),
            SETTINGS_QPACK_BLOCKED_STREAMS => Some(self.qpack_blocked_streams),
            SETTINGS_ENABLE_CONNECT_PROTOCOL => Some(u64::from(self.enable_connect_protocol)),
            other => self.extra.get(&other).copied(),
        }
    }
}

fn settings_error<T: std::fmt::Display>(message: T) -> H3Error {
    H3Error::connection(H3_SETTINGS_ERROR, format!("malformed SETTINGS: {message}"))
}

/// Frame-size limits applied while reading. Exceeding one is a local
/// processing limit (HTTP status), not a protocol violation.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_header_section_size: usize,
    pub max_data_frame_size: usize,
}

impl From<&ConnectionConfig> for FrameLimits {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            max_header_section_size: config.max_header_section_size,
            max_data_frame_size: config.max_data_frame_size,
        }
    }
}

fn truncated(context: &str) -> H3Error {
    H3Error::Connection(ConnectionError::frame_error(format!(
        "stream ended inside a frame: {context}"
    )))
}

fn map_read_err(err: std::io::Error, context: &str) -> H3Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        truncated(context)
    } else {
        H3Error::Io(err)
    }
}

/// Read one frame from `stream`.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
/// Unknown frame types are skipped (their payload discarded) and
/// reported as [`Frame::Unknown`].
pub async fn read_frame(
    stream: &mut H3Stream,
    codec: &SharedHeaderCodec,
    limits: &FrameLimits,
) -> H3Result<Option<Frame>> {
    let frame_type = match stream
        .read_varint()
        .await
        .map_err(|e| map_read_err(e, "frame type"))?
    {
        Some(t) => t,
        None => return Ok(None),
    };
    let length = stream
        .read_varint()
        .await
        .map_err(|e| map_read_err(e, "frame length"))?
        .ok_or_else(|| truncated("frame length"))? as usize;

    let frame = match FrameType::from_id(frame_type) {
        FrameType::Data => {
            if length > limits.max_data_frame_size {
                return Err(H3Error::Http { status: 400 });
            }
            let payload = stream
                .read_exact(length)
                .await
                .map_err(|e| map_read_err(e, "DATA payload"))?;
            Frame::Data { payload }
        }
        FrameType::Headers => {
            if length > limits.max_header_section_size {
                return Err(H3Error::Http { status: 414 });
            }
            let block = stream
                .read_exact(length)
                .await
                .map_err(|e| map_read_err(e, "HEADERS payload"))?;
            let fields = codec
                .lock()
                .expect("header codec lock poisoned")
                .decompress(&block)?;
            Frame::Headers(HeaderBlock::from_field_list(fields)?)
        }
        FrameType::Settings => {
            let payload = stream
                .read_exact(length)
                .await
                .map_err(|e| map_read_err(e, "SETTINGS payload"))?;
            Frame::Settings(Settings::decode(&payload)?)
        }
        FrameType::Unknown(frame_type) => {
            stream
                .skip(length)
                .await
                .map_err(|e| map_read_err(e, "unknown frame payload"))?;
            tracing::trace!(frame_type, length, "skipped unknown frame");
            Frame::Unknown { frame_type }
        }
    };
    Ok(Some(frame))
}

/// Serialize one frame onto `stream` (type + length + payload).
pub async fn write_frame(
    stream: &mut H3Stream,
    frame: &Frame,
    codec: &SharedHeaderCodec,
) -> H3Result<()> {
    let (frame_type, payload) = match frame {
        Frame::Data { payload } => (FRAME_DATA, payload.clone()),
        Frame::Headers(block) => {
            let compressed = codec
                .lock()
                .expect("header codec lock poisoned")
                .compress(&block.to_field_list())?;
            (FRAME_HEADERS, compressed)
        }
        Frame::Settings(settings) => {
            let mut buf = BytesMut::new();
            settings.encode(&mut buf);
            (FRAME_SETTINGS, buf.freeze())
        }
        Frame::Unknown { frame_type } => (*frame_type, Bytes::new()),
    };

    let mut header = BytesMut::with_capacity(16);
    varint::encode(&mut header, frame_type);
    varint::encode(&mut header, payload.len() as u64);
    stream.write_all(&header).await?;
    stream.write_all(&payload).await?;
    Ok(())
}
