//! WebTransport capsule parsing and encoding.
//!
//! Capsules are typed, length-delimited units carried on an extended
//! CONNECT tunnel: `type (varint) | length (varint) | payload`. Unknown
//! types decode to the generic form.

use bytes::{Bytes, BytesMut};

use crate::error::{H3Error, H3Result};
use crate::protocol::stream::H3Stream;
use crate::protocol::varint;

/// CLOSE_WEBTRANSPORT_SESSION capsule type (draft-ietf-webtrans-http3).
pub const CAPSULE_CLOSE_WEBTRANSPORT_SESSION: u64 = 0x2843;

/// Maximum UTF-8 byte length of a close reason.
pub const MAX_CLOSE_REASON_LEN: usize = 1024;

/// A WebTransport capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    /// CLOSE_WEBTRANSPORT_SESSION: application error code plus reason.
    CloseSession { error_code: u32, reason: String },
    /// Any other capsule type, payload kept verbatim.
    Unknown { capsule_type: u64, payload: Bytes },
}

impl Capsule {
    /// Build a CLOSE_WEBTRANSPORT_SESSION capsule, validating the reason
    /// length before any I/O.
    pub fn close_session(error_code: u32, reason: &str) -> H3Result<Self> {
        if reason.len() > MAX_CLOSE_REASON_LEN {
            return Err(H3Error::InvalidInput(format!(
                "close reason exceeds {MAX_CLOSE_REASON_LEN} bytes"
            )));
        }
        Ok(Capsule::CloseSession {
            error_code,
            reason: reason.to_string(),
        })
    }

    /// The capsule's wire type.
    pub fn capsule_type(&self) -> u64 {
        match self {
            Capsule::CloseSession { .. } => CAPSULE_CLOSE_WEBTRANSPORT_SESSION,
            Capsule::Unknown { capsule_type, .. } => *capsule_type,
        }
    }

    /// Encode type, length, and payload into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        varint::encode(buf, self.capsule_type());
        match self {
            Capsule::CloseSession { error_code, reason } => {
                varint::encode(buf, (4 + reason.len()) as u64);
                buf.extend_from_slice(&error_code.to_be_bytes());
                buf.extend_from_slice(reason.as_bytes());
            }
            Capsule::Unknown { payload, .. } => {
                varint::encode(buf, payload.len() as u64);
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Read one capsule from `stream`, decoding known types and falling
    /// back to [`Capsule::Unknown`]. Returns `Ok(None)` on a clean end
    /// of stream at a capsule boundary.
    pub async fn read(stream: &mut H3Stream) -> H3Result<Option<Capsule>> {
        let capsule_type = match stream.read_varint().await? {
            Some(t) => t,
            None => return Ok(None),
        };
        let length = stream
            .read_varint()
            .await?
            .ok_or_else(|| H3Error::Malformed("capsule without length".into()))?
            as usize;
        let payload = stream.read_exact(length).await?;

        match capsule_type {
            CAPSULE_CLOSE_WEBTRANSPORT_SESSION => Ok(Some(Self::decode_close(&payload)?)),
            other => Ok(Some(Capsule::Unknown {
                capsule_type: other,
                payload,
            })),
        }
    }

    fn decode_close(payload: &[u8]) -> H3Result<Capsule> {
        if payload.len() < 4 {
            return Err(H3Error::Malformed(
                "CLOSE_WEBTRANSPORT_SESSION payload shorter than error code".into(),
            ));
        }
        let error_code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let reason_bytes = &payload[4..];
        if reason_bytes.len() > MAX_CLOSE_REASON_LEN {
            return Err(H3Error::Malformed("close reason too long".into()));
        }
        let reason = String::from_utf8(reason_bytes.to_vec())
            .map_err(|_| H3Error::Malformed("close reason is not valid UTF-8".into()))?;
        Ok(Capsule::CloseSession { error_code, reason })
    }
}
