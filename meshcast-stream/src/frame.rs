//! Relay frame codec
//!
//! Two encodings share one channel. The binary frame is the default:
//!
//! ```text
//! +-------+---------+-----------+--------------+
//! | magic | version | seq (u64) | ts (i64, ms) |
//! +-------+---------+-----------+--------------+
//! | id (u16 len) | source (u16 len) | mime (u16 len) | data (u32 len) |
//! +--------------+------------------+----------------+----------------+
//! ```
//!
//! All integers are big-endian. The JSON frame carries the same fields as
//! `{id, timestamp, data, seqNumber, sourceId, mimeType}` with `data` base64
//! encoded, and is kept for debugging. [`decode`] detects the encoding from the
//! first byte.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshcast_core::{FrameFormat, PeerId};
use serde::{Deserialize, Serialize};

use crate::chunk::StreamChunk;

pub const FRAME_MAGIC: u8 = 0xB7;
pub const FRAME_VERSION: u8 = 1;
/// Largest chunk payload accepted from the wire
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const FIXED_HEADER_LEN: usize = 1 + 1 + 8 + 8;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame marker 0x{0:02x}")]
    UnknownFormat(u8),
    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    #[error("field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("field {0} is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json frame payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl From<FrameError> for meshcast_core::Error {
    fn from(err: FrameError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// JSON rendition of a chunk
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonFrame {
    id: String,
    timestamp: i64,
    data: String,
    seq_number: u64,
    source_id: String,
    mime_type: String,
}

/// Encode a chunk with the given format
pub fn encode(chunk: &StreamChunk, format: FrameFormat) -> Result<Bytes, FrameError> {
    match format {
        FrameFormat::Binary => encode_binary(chunk),
        FrameFormat::Json => encode_json(chunk),
    }
}

/// Decode a frame of either format
pub fn decode(frame: &[u8]) -> Result<StreamChunk, FrameError> {
    match frame.first() {
        None => Err(FrameError::Empty),
        Some(&FRAME_MAGIC) => decode_binary(frame),
        Some(b'{') => decode_json(frame),
        Some(&other) => Err(FrameError::UnknownFormat(other)),
    }
}

pub fn encode_binary(chunk: &StreamChunk) -> Result<Bytes, FrameError> {
    check_len("id", chunk.id.len(), u16::MAX as usize)?;
    check_len("source_id", chunk.source_id.as_str().len(), u16::MAX as usize)?;
    check_len("mime_type", chunk.mime_type.len(), u16::MAX as usize)?;
    check_len("data", chunk.data.len(), MAX_PAYLOAD_LEN)?;

    let capacity = FIXED_HEADER_LEN
        + 2
        + chunk.id.len()
        + 2
        + chunk.source_id.as_str().len()
        + 2
        + chunk.mime_type.len()
        + 4
        + chunk.data.len();
    let mut buf = BytesMut::with_capacity(capacity);

    buf.put_u8(FRAME_MAGIC);
    buf.put_u8(FRAME_VERSION);
    buf.put_u64(chunk.seq_number);
    buf.put_i64(chunk.timestamp);
    put_short_str(&mut buf, &chunk.id);
    put_short_str(&mut buf, chunk.source_id.as_str());
    put_short_str(&mut buf, &chunk.mime_type);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(chunk.data.len() as u32);
    buf.put_slice(&chunk.data);

    Ok(buf.freeze())
}

pub fn decode_binary(frame: &[u8]) -> Result<StreamChunk, FrameError> {
    let mut buf = frame;
    if buf.remaining() < FIXED_HEADER_LEN {
        return Err(FrameError::Truncated("header"));
    }

    let magic = buf.get_u8();
    if magic != FRAME_MAGIC {
        return Err(FrameError::UnknownFormat(magic));
    }
    let version = buf.get_u8();
    if version != FRAME_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let seq_number = buf.get_u64();
    let timestamp = buf.get_i64();
    let id = get_short_str(&mut buf, "id")?;
    let source_id = get_short_str(&mut buf, "source_id")?;
    let mime_type = get_short_str(&mut buf, "mime_type")?;

    if buf.remaining() < 4 {
        return Err(FrameError::Truncated("data length"));
    }
    let data_len = buf.get_u32() as usize;
    check_len("data", data_len, MAX_PAYLOAD_LEN)?;
    if buf.remaining() < data_len {
        return Err(FrameError::Truncated("data"));
    }
    let data = Bytes::copy_from_slice(&buf[..data_len]);

    Ok(StreamChunk {
        id,
        timestamp,
        data,
        seq_number,
        source_id: PeerId::new(source_id),
        mime_type,
    })
}

pub fn encode_json(chunk: &StreamChunk) -> Result<Bytes, FrameError> {
    let frame = JsonFrame {
        id: chunk.id.clone(),
        timestamp: chunk.timestamp,
        data: STANDARD.encode(&chunk.data),
        seq_number: chunk.seq_number,
        source_id: chunk.source_id.to_string(),
        mime_type: chunk.mime_type.clone(),
    };
    Ok(Bytes::from(serde_json::to_vec(&frame)?))
}

pub fn decode_json(frame: &[u8]) -> Result<StreamChunk, FrameError> {
    let frame: JsonFrame = serde_json::from_slice(frame)?;
    let data = STANDARD.decode(frame.data.as_bytes())?;
    check_len("data", data.len(), MAX_PAYLOAD_LEN)?;

    Ok(StreamChunk {
        id: frame.id,
        timestamp: frame.timestamp,
        data: Bytes::from(data),
        seq_number: frame.seq_number,
        source_id: PeerId::new(frame.source_id),
        mime_type: frame.mime_type,
    })
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), FrameError> {
    if len > max {
        return Err(FrameError::FieldTooLong { field, len, max });
    }
    Ok(())
}

fn put_short_str(buf: &mut BytesMut, value: &str) {
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_short_str(buf: &mut &[u8], field: &'static str) -> Result<String, FrameError> {
    if buf.remaining() < 2 {
        return Err(FrameError::Truncated(field));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated(field));
    }
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::InvalidUtf8(field))?
        .to_string();
    buf.advance(len);
    Ok(value)
}
