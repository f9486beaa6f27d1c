//! Error types for the lora-image system.
//!
//! Only transport failures are fatal. Decode failures drop a single frame,
//! protocol failures drop a single packet or transfer, and both are surfaced
//! as session events rather than returned to the caller.

use crate::packet::TransferId;
use thiserror::Error;

/// Top-level error type for all fallible operations in the system.
///
/// Each variant corresponds to a specific failure domain:
/// - Decode: a received frame could not be parsed
/// - Encode: a packet could not be built within the wire constraints
/// - Split: fragmentation parameters are unusable
/// - Protocol: a well-formed packet violates transfer state
/// - Transport: the radio link collaborator failed
/// - Config: a configuration value is out of range
#[derive(Debug, Error)]
pub enum Error {
    /// Frame decode failed
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Packet encode failed
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Fragmentation parameters rejected
    #[error("split error: {0}")]
    Split(#[from] SplitError),

    /// Protocol-level violation for a transfer
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Link collaborator failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Raw frame decode errors.
///
/// The offending frame is always dropped whole; nothing is partially parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Zero-length frame
    #[error("empty frame")]
    Empty,

    /// Leading tag byte is not a known packet kind
    #[error("invalid packet tag {0:#04x}")]
    InvalidTag(u8),

    /// Frame is shorter than the fixed header for its tag
    #[error("frame too short for tag {tag:?}: need at least {required} bytes, got {actual}")]
    TooShort {
        tag: char,
        required: usize,
        actual: usize,
    },

    /// Declared payload length runs past the end of the frame
    #[error("payload length mismatch: header + payload needs {declared} bytes, frame has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Text payload is not valid UTF-8
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Packet encode errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Label cannot be carried as an 8-byte printable transfer id
    #[error("invalid transfer id {label:?}: must be 1-8 printable ASCII bytes")]
    InvalidTransferId { label: String },

    /// Fragment payload does not fit the u16 length field
    #[error("payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Encoded frame would exceed the link MTU
    #[error("frame size {size} exceeds MTU {mtu}")]
    ExceedsMtu { size: usize, mtu: usize },
}

/// Fragmentation parameter errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitError {
    /// max_payload must be in 1..=u16::MAX
    #[error("invalid max payload {0}: must be between 1 and 65535")]
    InvalidMaxPayload(usize),

    /// Input would need more fragments than the u32 index space holds
    #[error("input of {len} bytes needs more than u32::MAX fragments")]
    TooManyFragments { len: usize },

    /// Input is larger than the u32 total_size field
    #[error("input of {len} bytes exceeds u32 total_size")]
    TooLarge { len: usize },
}

/// Protocol violations detected by the receive side.
///
/// None of these stop the session; each is reported as an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fragment for a transfer whose Start was never seen (or already finished)
    #[error("orphan fragment {index} for unknown transfer {id}")]
    OrphanFragment { id: TransferId, index: u32 },

    /// Fragment index or total disagrees with the transfer's Start
    #[error("malformed fragment {index}/{total_fragments} for transfer {id} (expected {expected_fragments} fragments)")]
    MalformedFragment {
        id: TransferId,
        index: u32,
        total_fragments: u32,
        expected_fragments: u32,
    },

    /// All fragments arrived but the concatenation has the wrong length
    #[error("transfer {id} reassembled to {actual} bytes, Start declared {expected}")]
    SizeMismatchOnCompletion {
        id: TransferId,
        expected: u32,
        actual: usize,
    },

    /// Start declares a shape no sender could produce
    #[error("malformed start for transfer {id}: {reason}")]
    MalformedStart { id: TransferId, reason: String },
}

/// Link collaborator errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Device went away; fatal to the current session
    #[error("link disconnected")]
    Disconnected,

    /// Radio module refused the write because it is still transmitting
    #[error("radio module busy")]
    Busy,

    /// Radio module answered with an unexpected response
    #[error("radio module rejected frame: {0}")]
    Rejected(String),

    /// Underlying stream I/O failure
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error ends the session rather than a single write.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Io(_))
    }
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
