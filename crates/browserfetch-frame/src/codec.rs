use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{FrameError, Result};

/// Byte separating the metadata block from the raw body.
pub const SEPARATOR: u8 = 0x00;

/// Default maximum frame size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A decoded wire message: metadata plus an optional raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The JSON metadata block, verbatim.
    pub metadata: Bytes,
    /// The raw body; `None` when the message carried no separator.
    pub body: Option<Bytes>,
}

impl Frame {
    /// Create a new frame from already-encoded metadata.
    pub fn new(metadata: impl Into<Bytes>, body: Option<Bytes>) -> Self {
        Self {
            metadata: metadata.into(),
            body,
        }
    }

    /// Serialize `metadata` as JSON and pair it with `body`.
    pub fn from_json<T: Serialize + ?Sized>(metadata: &T, body: Option<Bytes>) -> Result<Self> {
        let metadata = serde_json::to_vec(metadata)?;
        Ok(Self::new(metadata, body))
    }

    /// Deserialize the metadata block.
    pub fn parse_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.metadata)?)
    }

    /// The body, or an empty buffer when there is none.
    pub fn body_or_empty(&self) -> Bytes {
        self.body.clone().unwrap_or_default()
    }

    /// The total wire size of this frame (metadata + separator + body).
    pub fn wire_size(&self) -> usize {
        self.metadata.len() + self.body.as_ref().map_or(0, |body| 1 + body.len())
    }

    /// Encode into a standalone buffer, enforcing `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Bytes> {
        let size = self.wire_size();
        if size > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size,
                max: max_payload,
            });
        }
        let mut dst = BytesMut::with_capacity(size);
        encode_frame(&self.metadata, self.body.as_deref(), &mut dst)?;
        Ok(dst.freeze())
    }
}

/// Encode metadata and optional body into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬───────────┬──────────────────┐
/// │ Metadata (JSON)  │ 0x00      │ Body (verbatim)   │
/// │                  │ (if body) │ (if body)         │
/// └──────────────────┴───────────┴──────────────────┘
/// ```
pub fn encode_frame(metadata: &[u8], body: Option<&[u8]>, dst: &mut BytesMut) -> Result<()> {
    if metadata.is_empty() {
        return Err(FrameError::EmptyMetadata);
    }
    if let Some(offset) = metadata.iter().position(|&b| b == SEPARATOR) {
        return Err(FrameError::SeparatorInMetadata { offset });
    }
    dst.reserve(metadata.len() + body.map_or(0, |body| 1 + body.len()));
    dst.put_slice(metadata);
    if let Some(body) = body {
        dst.put_u8(SEPARATOR);
        dst.put_slice(body);
    }
    Ok(())
}

/// Decode one complete wire message.
///
/// Splits at the first separator byte. Metadata is not parsed here; see
/// [`Frame::parse_metadata`].
pub fn decode_frame(src: Bytes, max_payload: usize) -> Result<Frame> {
    if src.len() > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: src.len(),
            max: max_payload,
        });
    }
    let frame = match src.iter().position(|&b| b == SEPARATOR) {
        Some(split) => {
            let metadata = src.slice(..split);
            let body = src.slice(split + 1..);
            Frame::new(metadata, Some(body))
        }
        None => Frame::new(src, None),
    };
    if frame.metadata.is_empty() {
        return Err(FrameError::EmptyMetadata);
    }
    trace!(
        metadata_len = frame.metadata.len(),
        body_len = frame.body.as_ref().map(Bytes::len),
        "decoded frame"
    );
    Ok(frame)
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl FrameConfig {
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        frame.encode(self.max_payload_size)
    }

    pub fn decode(&self, src: Bytes) -> Result<Frame> {
        decode_frame(src, self.max_payload_size)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
