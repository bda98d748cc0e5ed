//! Media chunk envelope
//!
//! Every encoded chunk travels in a fixed big-endian envelope:
//!
//! Video (13-byte header):
//! - Byte 0: Keyframe flag (0x01 = key, 0x00 = delta)
//! - Bytes 1-8: Timestamp in microseconds (u64 BE)
//! - Bytes 9-12: Payload length (u32 BE)
//! - Remaining bytes: Payload
//!
//! Audio (12-byte header): same layout without the keyframe flag.
//!
//! On the fast path each chunk gets its own unidirectional stream, prefixed
//! with one kind tag byte (0x01 = video, 0x00 = audio).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

/// Stream kind tags
pub const TAG_AUDIO: u8 = 0x00;
pub const TAG_VIDEO: u8 = 0x01;

/// Header sizes
pub const VIDEO_HEADER_LEN: usize = 13;
pub const AUDIO_HEADER_LEN: usize = 12;

const FLAG_DELTA: u8 = 0x00;
const FLAG_KEY: u8 = 0x01;

/// Media kind carried by a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Kind tag written before the envelope on a fast-path stream
    pub fn tag(self) -> u8 {
        match self {
            MediaKind::Video => TAG_VIDEO,
            MediaKind::Audio => TAG_AUDIO,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_VIDEO => Some(MediaKind::Video),
            TAG_AUDIO => Some(MediaKind::Audio),
            _ => None,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            MediaKind::Video => VIDEO_HEADER_LEN,
            MediaKind::Audio => AUDIO_HEADER_LEN,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Key or delta chunk (audio chunks are always key)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Key,
    Delta,
}

/// One encoded media chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub chunk_type: ChunkType,
    pub timestamp_micros: u64,
    pub payload: Bytes,
}

impl EncodedChunk {
    pub fn key(timestamp_micros: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            chunk_type: ChunkType::Key,
            timestamp_micros,
            payload: payload.into(),
        }
    }

    pub fn delta(timestamp_micros: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            chunk_type: ChunkType::Delta,
            timestamp_micros,
            payload: payload.into(),
        }
    }

    pub fn is_key(&self) -> bool {
        self.chunk_type == ChunkType::Key
    }
}

/// Encode a chunk envelope
pub fn encode_envelope(chunk: &EncodedChunk, kind: MediaKind) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(kind.header_len() + chunk.payload.len());
    encode_envelope_into(chunk, kind, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a chunk envelope into an existing buffer (appends)
pub fn encode_envelope_into(chunk: &EncodedChunk, kind: MediaKind, buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(chunk.payload.len()).map_err(|_| {
        AppError::MalformedEnvelope(format!("payload too large: {} bytes", chunk.payload.len()))
    })?;

    buf.reserve(kind.header_len() + chunk.payload.len());
    if kind == MediaKind::Video {
        buf.put_u8(if chunk.is_key() { FLAG_KEY } else { FLAG_DELTA });
    }
    buf.put_u64(chunk.timestamp_micros);
    buf.put_u32(len);
    buf.extend_from_slice(&chunk.payload);
    Ok(())
}

/// Decode a chunk envelope
///
/// The buffer must hold exactly one envelope; truncation, an unknown
/// keyframe flag or trailing bytes are all rejected.
pub fn decode_envelope(data: &[u8], kind: MediaKind) -> Result<EncodedChunk> {
    let header_len = kind.header_len();
    if data.len() < header_len {
        return Err(AppError::MalformedEnvelope(format!(
            "{} header truncated: {} of {} bytes",
            kind,
            data.len(),
            header_len
        )));
    }

    let mut buf = data;
    let chunk_type = match kind {
        MediaKind::Video => match buf.get_u8() {
            FLAG_KEY => ChunkType::Key,
            FLAG_DELTA => ChunkType::Delta,
            other => {
                return Err(AppError::MalformedEnvelope(format!(
                    "invalid keyframe flag 0x{:02X}",
                    other
                )))
            }
        },
        MediaKind::Audio => ChunkType::Key,
    };
    let timestamp_micros = buf.get_u64();
    let declared = buf.get_u32() as usize;

    if buf.remaining() != declared {
        return Err(AppError::MalformedEnvelope(format!(
            "{} payload length mismatch: declared {}, got {}",
            kind,
            declared,
            buf.remaining()
        )));
    }

    Ok(EncodedChunk {
        chunk_type,
        timestamp_micros,
        payload: Bytes::copy_from_slice(buf),
    })
}

/// Encode the full contents of a fast-path stream (tag + envelope)
pub fn encode_stream_payload(chunk: &EncodedChunk, kind: MediaKind) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(1 + kind.header_len() + chunk.payload.len());
    buf.put_u8(kind.tag());
    encode_envelope_into(chunk, kind, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode the full contents of a fast-path stream
pub fn decode_stream_payload(data: &[u8]) -> Result<(MediaKind, EncodedChunk)> {
    let Some((&tag, rest)) = data.split_first() else {
        return Err(AppError::MalformedEnvelope("empty stream".to_string()));
    };
    let kind = MediaKind::from_tag(tag)
        .ok_or_else(|| AppError::MalformedEnvelope(format!("unknown kind tag 0x{:02X}", tag)))?;
    let chunk = decode_envelope(rest, kind)?;
    Ok((kind, chunk))
}
