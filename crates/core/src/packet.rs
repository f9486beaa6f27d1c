//! Wire packet format.
//!
//! Every radio frame carries exactly one packet, classified by its leading
//! tag byte. All integers are little-endian and fixed width; timestamps are
//! f64 seconds on the sender's local clock.
//!
//! # Packet Formats
//!
//! ```text
//! Start ('S'), 25 byte header:
//! +------+----------------+-----------------+----------------------+----------------+
//! | 'S'  | transfer_id(8) | total_size u32  | total_fragments u32  | timestamp f64  |
//! +------+----------------+-----------------+----------------------+----------------+
//!
//! Fragment ('F'), 19 byte header + payload:
//! +------+----------------+-----------------+----------------------+-----------------+-----------+
//! | 'F'  | transfer_id(8) | fragment_index  | total_fragments u32  | payload_len u16 | payload   |
//! |      |                | u32             |                      |                 | (var)     |
//! +------+----------------+-----------------+----------------------+-----------------+-----------+
//!
//! End ('E'), 17 byte header:
//! +------+----------------+----------------+
//! | 'E'  | transfer_id(8) | timestamp f64  |
//! +------+----------------+----------------+
//!
//! Text ('T'):
//! +------+---------------------+
//! | 'T'  | UTF-8 payload (var) |
//! +------+---------------------+
//! ```
//!
//! The transfer id is printable text, NUL padded to 8 bytes.
//!
//! # MTU Constraint
//!
//! Encoded frame size <= link MTU. A received frame may be longer than the
//! packet it carries (radio padding); trailing bytes are ignored. It may
//! never be shorter: a Fragment whose declared payload runs past the end of
//! the frame is rejected whole.

use crate::error::{DecodeError, EncodeError, Error, Result};
use rand::Rng;
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Tag byte for Start packets
pub const TAG_START: u8 = b'S';

/// Tag byte for Fragment packets
pub const TAG_FRAGMENT: u8 = b'F';

/// Tag byte for End packets
pub const TAG_END: u8 = b'E';

/// Tag byte for Text packets
pub const TAG_TEXT: u8 = b'T';

/// Size of the transfer id field in bytes
pub const TRANSFER_ID_LEN: usize = 8;

/// Fixed size of a Start packet
pub const START_HEADER_SIZE: usize = 25;

/// Size of a Fragment header, before the payload
pub const FRAGMENT_HEADER_SIZE: usize = 19;

/// Fixed size of an End packet
pub const END_HEADER_SIZE: usize = 17;

/// Size of a Text header (the tag alone)
pub const TEXT_HEADER_SIZE: usize = 1;

/// Largest payload the u16 length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Default LoRa PHY payload limit
pub const DEFAULT_MTU: usize = 255;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// 8-byte identifier naming one transfer.
///
/// Stored exactly as it travels on the wire: printable text followed by NUL
/// padding. Decoded ids are taken verbatim, so a corrupted id simply names a
/// transfer nobody started.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId([u8; TRANSFER_ID_LEN]);

impl TransferId {
    /// Build an id from a text label.
    ///
    /// # Errors
    /// `EncodeError::InvalidTransferId` unless the label is 1-8 bytes of
    /// printable ASCII.
    pub fn new(label: &str) -> std::result::Result<Self, EncodeError> {
        let bytes = label.as_bytes();
        let printable = bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
        if bytes.is_empty() || bytes.len() > TRANSFER_ID_LEN || !printable {
            return Err(EncodeError::InvalidTransferId {
                label: label.to_string(),
            });
        }

        let mut raw = [0u8; TRANSFER_ID_LEN];
        raw[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Wrap raw wire bytes.
    pub fn from_bytes(raw: [u8; TRANSFER_ID_LEN]) -> Self {
        Self(raw)
    }

    /// Generate a fresh id of 8 lowercase alphanumerics.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut raw = [0u8; TRANSFER_ID_LEN];
        for byte in raw.iter_mut() {
            *byte = ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())];
        }
        Self(raw)
    }

    /// The id exactly as it appears on the wire.
    pub fn as_bytes(&self) -> &[u8; TRANSFER_ID_LEN] {
        &self.0
    }

    /// The id as text with NUL padding stripped.
    pub fn as_str(&self) -> Cow<'_, str> {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |last| last + 1);
        String::from_utf8_lossy(&self.0[..end])
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({:?})", self.as_str())
    }
}

impl Serialize for TransferId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Announces a transfer and its expected shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StartPacket {
    pub id: TransferId,
    pub total_size: u32,
    pub total_fragments: u32,
    /// Sender-local origination time, seconds
    pub timestamp: f64,
}

/// One chunk of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPacket {
    pub id: TransferId,
    /// Zero-based position of this chunk
    pub index: u32,
    pub total_fragments: u32,
    pub payload: Vec<u8>,
}

/// Marks the sender finishing a transfer. Informational only.
#[derive(Debug, Clone, PartialEq)]
pub struct EndPacket {
    pub id: TransferId,
    /// Sender-local time the last fragment was written, seconds
    pub timestamp: f64,
}

/// A decoded radio frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Start(StartPacket),
    Fragment(FragmentPacket),
    End(EndPacket),
    /// Free-form text message
    Text(String),
}

impl Packet {
    /// Serialize this packet into wire bytes.
    ///
    /// No size limits are applied here. Callers go through [`PacketCodec`],
    /// which rejects payloads the u16 length field cannot describe.
    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Start(start) => {
                let mut bytes = Vec::with_capacity(START_HEADER_SIZE);
                bytes.push(TAG_START);
                bytes.extend_from_slice(start.id.as_bytes());
                bytes.extend_from_slice(&start.total_size.to_le_bytes());
                bytes.extend_from_slice(&start.total_fragments.to_le_bytes());
                bytes.extend_from_slice(&start.timestamp.to_le_bytes());
                bytes
            }
            Packet::Fragment(fragment) => {
                let payload_len = fragment.payload.len() as u16;
                let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_SIZE + fragment.payload.len());
                bytes.push(TAG_FRAGMENT);
                bytes.extend_from_slice(fragment.id.as_bytes());
                bytes.extend_from_slice(&fragment.index.to_le_bytes());
                bytes.extend_from_slice(&fragment.total_fragments.to_le_bytes());
                bytes.extend_from_slice(&payload_len.to_le_bytes());
                bytes.extend_from_slice(&fragment.payload);
                bytes
            }
            Packet::End(end) => {
                let mut bytes = Vec::with_capacity(END_HEADER_SIZE);
                bytes.push(TAG_END);
                bytes.extend_from_slice(end.id.as_bytes());
                bytes.extend_from_slice(&end.timestamp.to_le_bytes());
                bytes
            }
            Packet::Text(text) => {
                let mut bytes = Vec::with_capacity(TEXT_HEADER_SIZE + text.len());
                bytes.push(TAG_TEXT);
                bytes.extend_from_slice(text.as_bytes());
                bytes
            }
        }
    }

    /// Parse one raw frame.
    ///
    /// # Errors
    /// - `DecodeError::Empty` for a zero-length frame
    /// - `DecodeError::InvalidTag` if the leading byte is not a known tag
    /// - `DecodeError::TooShort` if the frame is below the tag's header size
    /// - `DecodeError::LengthMismatch` if a Fragment's payload is truncated
    /// - `DecodeError::InvalidUtf8` if a Text payload is not UTF-8
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, DecodeError> {
        let tag = *raw.first().ok_or(DecodeError::Empty)?;

        let required = match tag {
            TAG_START => START_HEADER_SIZE,
            TAG_FRAGMENT => FRAGMENT_HEADER_SIZE,
            TAG_END => END_HEADER_SIZE,
            TAG_TEXT => TEXT_HEADER_SIZE,
            other => return Err(DecodeError::InvalidTag(other)),
        };

        if raw.len() < required {
            return Err(DecodeError::TooShort {
                tag: tag as char,
                required,
                actual: raw.len(),
            });
        }

        match tag {
            TAG_START => Ok(Packet::Start(StartPacket {
                id: read_id(raw),
                total_size: read_u32(raw, 9),
                total_fragments: read_u32(raw, 13),
                timestamp: read_f64(raw, 17),
            })),
            TAG_FRAGMENT => {
                let payload_len = read_u16(raw, 17) as usize;
                let declared = FRAGMENT_HEADER_SIZE + payload_len;
                if declared > raw.len() {
                    return Err(DecodeError::LengthMismatch {
                        declared,
                        actual: raw.len(),
                    });
                }

                Ok(Packet::Fragment(FragmentPacket {
                    id: read_id(raw),
                    index: read_u32(raw, 9),
                    total_fragments: read_u32(raw, 13),
                    payload: raw[FRAGMENT_HEADER_SIZE..declared].to_vec(),
                }))
            }
            TAG_END => Ok(Packet::End(EndPacket {
                id: read_id(raw),
                timestamp: read_f64(raw, 9),
            })),
            _ => {
                let text = std::str::from_utf8(&raw[TEXT_HEADER_SIZE..])
                    .map_err(|_| DecodeError::InvalidUtf8)?;
                Ok(Packet::Text(text.to_string()))
            }
        }
    }

    /// The transfer this packet belongs to, if any.
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Packet::Start(start) => Some(start.id),
            Packet::Fragment(fragment) => Some(fragment.id),
            Packet::End(end) => Some(end.id),
            Packet::Text(_) => None,
        }
    }
}

fn read_id(raw: &[u8]) -> TransferId {
    let mut id = [0u8; TRANSFER_ID_LEN];
    id.copy_from_slice(&raw[1..1 + TRANSFER_ID_LEN]);
    TransferId::from_bytes(id)
}

fn read_u16(raw: &[u8], at: usize) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&raw[at..at + 2]);
    u16::from_le_bytes(buf)
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&raw[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn read_f64(raw: &[u8], at: usize) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[at..at + 8]);
    f64::from_le_bytes(buf)
}

/// Encoder/decoder bound to a link MTU.
///
/// Holds no state beyond the MTU, so one instance can be shared freely
/// between the transmit and receive sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    mtu: usize,
}

impl PacketCodec {
    /// Create a codec for a link with the given MTU.
    ///
    /// # Errors
    /// Returns `Error::Config` if the MTU cannot carry a Start packet or a
    /// Fragment with at least one payload byte.
    pub fn new(mtu: usize) -> Result<Self> {
        let minimum = START_HEADER_SIZE.max(FRAGMENT_HEADER_SIZE + 1);
        if mtu < minimum {
            return Err(Error::Config(format!(
                "MTU {mtu} too small: need at least {minimum} bytes"
            )));
        }
        Ok(Self { mtu })
    }

    /// The link MTU this codec enforces.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Largest fragment payload that fits both the MTU and the u16 length.
    pub fn max_fragment_payload(&self) -> usize {
        (self.mtu - FRAGMENT_HEADER_SIZE).min(MAX_PAYLOAD_LEN)
    }

    /// Encode a Start packet.
    pub fn encode_start(
        &self,
        id: &TransferId,
        total_size: u32,
        total_fragments: u32,
        timestamp: f64,
    ) -> Vec<u8> {
        Packet::Start(StartPacket {
            id: *id,
            total_size,
            total_fragments,
            timestamp,
        })
        .encode()
    }

    /// Encode a Fragment packet.
    ///
    /// # Errors
    /// - `EncodeError::PayloadTooLarge` if the payload exceeds 65535 bytes
    /// - `EncodeError::ExceedsMtu` if the frame would exceed the link MTU
    pub fn encode_fragment(
        &self,
        id: &TransferId,
        index: u32,
        total_fragments: u32,
        payload: &[u8],
    ) -> std::result::Result<Vec<u8>, EncodeError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        self.check_mtu(FRAGMENT_HEADER_SIZE + payload.len())?;

        Ok(Packet::Fragment(FragmentPacket {
            id: *id,
            index,
            total_fragments,
            payload: payload.to_vec(),
        })
        .encode())
    }

    /// Encode an End packet.
    pub fn encode_end(&self, id: &TransferId, timestamp: f64) -> Vec<u8> {
        Packet::End(EndPacket { id: *id, timestamp }).encode()
    }

    /// Encode a Text message.
    ///
    /// # Errors
    /// `EncodeError::ExceedsMtu` if the text does not fit one frame.
    pub fn encode_text(&self, text: &str) -> std::result::Result<Vec<u8>, EncodeError> {
        self.check_mtu(TEXT_HEADER_SIZE + text.len())?;
        Ok(Packet::Text(text.to_string()).encode())
    }

    /// Decode a raw frame. Identical to [`Packet::decode`].
    pub fn decode(&self, raw: &[u8]) -> std::result::Result<Packet, DecodeError> {
        Packet::decode(raw)
    }

    fn check_mtu(&self, size: usize) -> std::result::Result<(), EncodeError> {
        if size > self.mtu {
            return Err(EncodeError::ExceedsMtu {
                size,
                mtu: self.mtu,
            });
        }
        Ok(())
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}
