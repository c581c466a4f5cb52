//! Binary message header.
//!
//! Every binary frame from the Miniserver is announced by an 8 byte header:
//!
//! ```text
//! [identifier(1)] [event type(1)] [flags(1)] [reserved(1)] [payload length(4, LE)]
//! ```
//!
//! Bit 0 of the flags byte marks the length as an estimate.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a binary header in bytes
pub const HEADER_LEN: usize = 8;

/// Identifier byte the Miniserver puts in front of every header
pub const HEADER_IDENTIFIER: u8 = 0x03;

const ESTIMATED_FLAG: u8 = 0x01;

/// Type of the payload that follows a header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Text,
    File,
    Event,
    EventText,
    Daytimer,
    OutOfService,
    Keepalive,
    Weather,
    /// Any type byte this client does not know about
    Unknown(u8),
}

impl EventType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => EventType::Text,
            1 => EventType::File,
            2 => EventType::Event,
            3 => EventType::EventText,
            4 => EventType::Daytimer,
            5 => EventType::OutOfService,
            6 => EventType::Keepalive,
            7 => EventType::Weather,
            other => EventType::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            EventType::Text => 0,
            EventType::File => 1,
            EventType::Event => 2,
            EventType::EventText => 3,
            EventType::Daytimer => 4,
            EventType::OutOfService => 5,
            EventType::Keepalive => 6,
            EventType::Weather => 7,
            EventType::Unknown(other) => other,
        }
    }

    /// True for the four state-update payloads decoded into [`crate::core::event::Event`]s
    pub fn is_event_table(self) -> bool {
        matches!(
            self,
            EventType::Event | EventType::EventText | EventType::Daytimer | EventType::Weather
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Text => write!(f, "TEXT"),
            EventType::File => write!(f, "FILE"),
            EventType::Event => write!(f, "EVENT"),
            EventType::EventText => write!(f, "EVENTTEXT"),
            EventType::Daytimer => write!(f, "DAYTIMER"),
            EventType::OutOfService => write!(f, "OUTOFSERVICE"),
            EventType::Keepalive => write!(f, "KEEPALIVE"),
            EventType::Weather => write!(f, "WEATHER"),
            EventType::Unknown(other) => write!(f, "{other}"),
        }
    }
}

/// Decoded 8 byte header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryHeader {
    pub event_type: EventType,
    /// Announced payload length in bytes
    pub length: u32,
    /// The length is only a size hint, an exact header follows later
    pub estimated: bool,
}

impl BinaryHeader {
    pub fn new(event_type: EventType, length: u32, estimated: bool) -> Self {
        Self {
            event_type,
            length,
            estimated,
        }
    }

    /// Decode a header, failing with `MalformedHeader` unless exactly 8 bytes are given
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(ProtocolError::MalformedHeader(bytes.len()));
        }

        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        Ok(Self {
            event_type: EventType::from_byte(bytes[1]),
            length,
            estimated: bytes[2] & ESTIMATED_FLAG == ESTIMATED_FLAG,
        })
    }

    /// Encode the header the way the Miniserver sends it
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = HEADER_IDENTIFIER;
        out[1] = self.event_type.as_byte();
        if self.estimated {
            out[2] = ESTIMATED_FLAG;
        }
        out[4..].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    /// Headers without a payload that the framing layer handles on its own
    pub fn is_control(&self) -> bool {
        matches!(
            self.event_type,
            EventType::Keepalive | EventType::OutOfService
        )
    }
}
