//! Header-compression capability consumed by the frame codec.
//!
//! QPACK itself (static/dynamic tables, encoder/decoder streams) lives
//! behind this boundary. The engine only needs to turn an ordered list of
//! name/value pairs into a byte block and back. One encoder/decoder pair
//! is shared by every stream of a connection, so the engine serializes
//! calls through a lock.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::H3Result;

/// Compresses and decompresses header blocks.
///
/// Implementations are not required to be internally synchronized; the
/// engine guarantees calls are serialized per connection.
pub trait HeaderCodec: Send {
    /// Compress an ordered list of name/value pairs into a header block.
    /// Pseudo-headers come first in `fields` and must stay first.
    fn compress(&mut self, fields: &[(String, String)]) -> H3Result<Bytes>;

    /// Decompress a header block into the ordered list it encodes.
    fn decompress(&mut self, block: &[u8]) -> H3Result<Vec<(String, String)>>;
}

/// Connection-shared handle to the header codec.
pub type SharedHeaderCodec = Arc<Mutex<Box<dyn HeaderCodec>>>;

pub(crate) fn shared(codec: Box<dyn HeaderCodec>) -> SharedHeaderCodec {
    Arc::new(Mutex::new(codec))
}
