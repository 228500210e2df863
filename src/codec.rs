//! Frame codec: turns envelopes into WebSocket frames and back, with an
//! optional zlib-stream inflater in front of the decoder.

use crate::config::Encoding;
use crate::error::Error;
use crate::protocol::Envelope;
use flate2::{Decompress, FlushDecompress, Status};
use std::fmt;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// Marker that terminates every flushed zlib-stream message.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Growth step for the inflate output buffer
const INFLATE_CHUNK: usize = 32 * 1024;

/// Maximum bytes buffered while waiting for a suffix (prevents unbounded growth)
const MAX_BUFFERED_BYTES: usize = 16 * 1024 * 1024;

/// Serialization strategy for gateway frames.
///
/// `Json` is always available. `MsgPack` requires the `msgpack` feature;
/// without it [`FrameCodec::for_encoding`] falls back to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// Text frames carrying JSON
    Json,
    /// Binary frames carrying MessagePack
    #[cfg(feature = "msgpack")]
    MsgPack,
}

impl FrameCodec {
    /// Pick the strategy for a configured encoding
    pub fn for_encoding(encoding: Encoding) -> Self {
        match encoding {
            Encoding::Json => FrameCodec::Json,
            #[cfg(feature = "msgpack")]
            Encoding::MsgPack => FrameCodec::MsgPack,
            #[cfg(not(feature = "msgpack"))]
            Encoding::MsgPack => {
                warn!("MessagePack support not compiled in, falling back to JSON frames");
                FrameCodec::Json
            }
        }
    }

    /// Encoding actually produced by this codec
    pub fn encoding(&self) -> Encoding {
        match self {
            FrameCodec::Json => Encoding::Json,
            #[cfg(feature = "msgpack")]
            FrameCodec::MsgPack => Encoding::MsgPack,
        }
    }

    /// Encode an envelope into a WebSocket frame
    pub fn serialize(&self, envelope: &Envelope) -> Result<Message, Error> {
        match self {
            FrameCodec::Json => serde_json::to_string(envelope)
                .map(Message::Text)
                .map_err(|e| Error::Encode(e.to_string())),
            #[cfg(feature = "msgpack")]
            FrameCodec::MsgPack => rmp_serde::to_vec_named(envelope)
                .map(Message::Binary)
                .map_err(|e| Error::Encode(e.to_string())),
        }
    }

    /// Decode an envelope from raw (already inflated) frame bytes
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, Error> {
        match self {
            FrameCodec::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
            }
            #[cfg(feature = "msgpack")]
            FrameCodec::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
            }
        }
    }
}

/// Inflater for a zlib-stream transport.
///
/// The server compresses every message into one shared deflate stream and
/// may split a message across several binary frames. Fragments are buffered
/// until one ends in [`ZLIB_SUFFIX`]; only then is the buffer inflated.
pub struct ZlibStream {
    inflater: Decompress,
    buffer: Vec<u8>,
    max_buffered: usize,
}

impl fmt::Debug for ZlibStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZlibStream")
            .field("buffered", &self.buffer.len())
            .field("total_in", &self.inflater.total_in())
            .field("total_out", &self.inflater.total_out())
            .finish()
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStream {
    /// Create an inflater for a fresh connection
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            buffer: Vec::new(),
            max_buffered: MAX_BUFFERED_BYTES,
        }
    }

    /// Bytes waiting for a terminating suffix
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one fragment.
    ///
    /// Returns `Ok(None)` while the message is incomplete and the inflated
    /// bytes once a fragment carries the suffix.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.buffer.extend_from_slice(fragment);

        if self.buffer.len() > self.max_buffered {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(Error::Decode(format!(
                "zlib-stream buffer exceeded {} bytes ({} buffered)",
                self.max_buffered, size
            )));
        }

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut output = Vec::with_capacity((self.buffer.len() * 4).max(INFLATE_CHUNK));
        let mut consumed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(INFLATE_CHUNK);
            }

            let in_before = self.inflater.total_in();
            let out_before = output.len();

            let status = match self.inflater.decompress_vec(
                &self.buffer[consumed..],
                &mut output,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(e) => {
                    self.buffer.clear();
                    return Err(Error::Decode(format!("zlib-stream inflate failed: {}", e)));
                }
            };

            let read = (self.inflater.total_in() - in_before) as usize;
            let written = output.len() - out_before;
            consumed += read;

            if matches!(status, Status::StreamEnd) {
                break;
            }
            // All input consumed and the inflater stopped short of filling the buffer
            if consumed >= self.buffer.len() && output.len() < output.capacity() {
                break;
            }
            if read == 0 && written == 0 {
                break;
            }
        }

        self.buffer.clear();
        Ok(Some(output))
    }
}

/// Per-connection decoder: codec plus optional inflater.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    inflater: Option<ZlibStream>,
}

impl FrameDecoder {
    /// Create a decoder; `compressed` enables the zlib-stream inflater
    pub fn new(codec: FrameCodec, compressed: bool) -> Self {
        Self {
            codec,
            inflater: compressed.then(ZlibStream::new),
        }
    }

    /// Decode one WebSocket frame.
    ///
    /// Returns `Ok(None)` for control frames and for partial compressed messages.
    pub fn decode(&mut self, message: Message) -> Result<Option<Envelope>, Error> {
        match message {
            Message::Text(text) => self.codec.deserialize(text.as_bytes()).map(Some),
            Message::Binary(bytes) => match self.inflater.as_mut() {
                Some(inflater) => match inflater.push(&bytes)? {
                    Some(raw) => self.codec.deserialize(&raw).map(Some),
                    None => Ok(None),
                },
                None => self.codec.deserialize(&bytes).map(Some),
            },
            _ => Ok(None),
        }
    }
}
