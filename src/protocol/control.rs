//! Control datagram parsing
//!
//! Binary message format (exactly 2 bytes):
//! - Byte 0: Control type
//!   - 0x01: Mute
//!   - 0x02: Video off
//!   - 0x03: Connected
//! - Byte 1: Value (0x00 = false, anything else = true)

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Control types
pub const CTRL_MUTE: u8 = 0x01;
pub const CTRL_VIDEO_OFF: u8 = 0x02;
pub const CTRL_CONNECTED: u8 = 0x03;

pub const CONTROL_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlKind {
    Mute,
    VideoOff,
    Connected,
}

impl ControlKind {
    pub fn type_id(self) -> u8 {
        match self {
            ControlKind::Mute => CTRL_MUTE,
            ControlKind::VideoOff => CTRL_VIDEO_OFF,
            ControlKind::Connected => CTRL_CONNECTED,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            CTRL_MUTE => Some(ControlKind::Mute),
            CTRL_VIDEO_OFF => Some(ControlKind::VideoOff),
            CTRL_CONNECTED => Some(ControlKind::Connected),
            _ => None,
        }
    }
}

/// A single control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub kind: ControlKind,
    pub value: bool,
}

impl ControlSignal {
    pub fn new(kind: ControlKind, value: bool) -> Self {
        Self { kind, value }
    }

    pub fn to_bytes(self) -> [u8; CONTROL_LEN] {
        [self.kind.type_id(), self.value as u8]
    }

    /// Parse a control datagram
    ///
    /// Unknown type ids yield `UnknownControlType`; callers log and discard.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CONTROL_LEN {
            return Err(AppError::MalformedEnvelope(format!(
                "control datagram too short: {} bytes",
                data.len()
            )));
        }
        let kind = ControlKind::from_type_id(data[0]).ok_or(AppError::UnknownControlType(data[0]))?;
        Ok(Self {
            kind,
            value: data[1] != 0,
        })
    }
}
