//! Binary wire formats shared by both transports
//!
//! - [`frame`]: the envelope around one encoded media chunk
//! - [`control`]: the fixed two-byte control datagram

pub mod control;
pub mod frame;

pub use control::{ControlKind, ControlSignal};
pub use frame::{
    decode_envelope, decode_stream_payload, encode_envelope, encode_envelope_into,
    encode_stream_payload, ChunkType, EncodedChunk, MediaKind,
};
