//! roomlink - real-time audio/video room client
//!
//! Joins a room through a WebSocket signaling relay and keeps one media
//! session per remote participant, over QUIC when the platform allows it
//! and over a WebRTC peer connection otherwise.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AppError, Result};
pub use manager::{ConnectionManager, Transports};
