//! Frame pairing
//!
//! The Miniserver announces every answer with an 8 byte binary header and sends the
//! payload in the next websocket frame. [`FrameAssembler`] keeps the announced header
//! and tells the connection what a received frame means.
//!
//! Estimated headers only carry a size hint; the exact header follows later. Their
//! payload is accepted directly only if its size matches the hint exactly.

use crate::core::header::{BinaryHeader, EventType, HEADER_LEN};
use crate::error::ProtocolError;
use bytes::Bytes;
use tracing::{debug, warn};

/// A websocket frame as delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a frame means for the connection
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// A header announced a payload; arm the socket timeout for it
    HeaderReceived(BinaryHeader),
    /// The keepalive was answered
    KeepaliveConfirmed,
    /// The Miniserver is going down
    OutOfService,
    /// A header announced an empty payload; the request completes without content
    EmptyPayload(EventType),
    /// Text payload, tagged with the type of its header
    Text { text: String, event_type: EventType },
    /// Binary payload, tagged with the type of its header
    Binary { payload: Bytes, event_type: EventType },
    /// The frame failed the awaited request
    Failed(ProtocolError),
    /// Nothing to do
    Ignored,
}

impl FrameOutcome {
    /// True if the frame answered what the socket timeout was waiting for
    pub fn completes_transfer(&self) -> bool {
        matches!(
            self,
            FrameOutcome::KeepaliveConfirmed
                | FrameOutcome::EmptyPayload(_)
                | FrameOutcome::Text { .. }
                | FrameOutcome::Binary { .. }
                | FrameOutcome::Failed(ProtocolError::WrongPayloadLength { .. })
        )
    }
}

/// Pairs headers with their payload frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Option<BinaryHeader>,
    verbose: bool,
}

impl FrameAssembler {
    pub fn new(verbose: bool) -> Self {
        Self {
            pending: None,
            verbose,
        }
    }

    /// Header of the payload currently awaited
    pub fn pending(&self) -> Option<&BinaryHeader> {
        self.pending.as_ref()
    }

    pub fn expects_payload(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }

    pub fn push(&mut self, frame: Frame) -> FrameOutcome {
        if let Some(header) = self.pending {
            let size_matches =
                matches!(&frame, Frame::Binary(bytes) if bytes.len() == header.length as usize);
            if header.estimated && size_matches {
                warn!("Accepting payload after estimated header, exact header missing");
            }
            if !header.estimated || size_matches {
                return self.payload(header, frame);
            }
        }

        match frame {
            Frame::Text(text) => {
                warn!(text = %text, "Received text without binary header, dropping it");
                FrameOutcome::Ignored
            }
            Frame::Binary(bytes) if bytes.len() == HEADER_LEN => self.header(&bytes),
            Frame::Binary(bytes) => {
                warn!(len = bytes.len(), "Received binary without binary header");
                FrameOutcome::Failed(ProtocolError::MissingHeader)
            }
        }
    }

    fn payload(&mut self, header: BinaryHeader, frame: Frame) -> FrameOutcome {
        match frame {
            Frame::Text(text) if text.is_empty() => {
                warn!("Received empty text frame");
                FrameOutcome::Ignored
            }
            Frame::Binary(bytes) if bytes.is_empty() => {
                warn!("Received empty binary frame");
                FrameOutcome::Ignored
            }
            Frame::Text(text) => {
                self.pending = None;
                if self.verbose {
                    debug!(chars = text.len(), "Received text message");
                }
                FrameOutcome::Text {
                    text,
                    event_type: header.event_type,
                }
            }
            Frame::Binary(payload) => {
                self.pending = None;
                if payload.len() == header.length as usize {
                    if self.verbose {
                        debug!(bytes = payload.len(), "Received binary message");
                    }
                    FrameOutcome::Binary {
                        payload,
                        event_type: header.event_type,
                    }
                } else {
                    warn!(
                        expected = header.length,
                        actual = payload.len(),
                        "Received binary with wrong length"
                    );
                    FrameOutcome::Failed(ProtocolError::WrongPayloadLength {
                        expected: header.length,
                        actual: payload.len(),
                    })
                }
            }
        }
    }

    fn header(&mut self, bytes: &[u8]) -> FrameOutcome {
        let header = match BinaryHeader::decode(bytes) {
            Ok(header) => header,
            Err(err) => return FrameOutcome::Failed(err),
        };

        if self.verbose {
            debug!(
                event_type = %header.event_type,
                length = header.length,
                estimated = header.estimated,
                "Received header"
            );
        }

        if header.estimated {
            self.pending = Some(header);
            return FrameOutcome::HeaderReceived(header);
        }

        self.pending = None;
        match header.event_type {
            EventType::OutOfService => {
                warn!("Miniserver out of service");
                FrameOutcome::OutOfService
            }
            EventType::Keepalive => FrameOutcome::KeepaliveConfirmed,
            event_type if header.length == 0 => FrameOutcome::EmptyPayload(event_type),
            _ => {
                self.pending = Some(header);
                FrameOutcome::HeaderReceived(header)
            }
        }
    }
}
