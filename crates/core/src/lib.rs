//! lora-image-core: Image transfer over a lossy, low-bandwidth LoRa link
//!
//! This library provides the core components for moving one image at a time
//! across a half-duplex radio link with a small MTU:
//! - Encodes Start/Fragment/End/Text packets in a compact binary format
//! - Splits images into MTU-sized fragments and paces them onto the link
//! - Reassembles fragments arriving out of order, duplicated, or not at all
//! - Records per-fragment signal quality for each transfer
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries:
//! - `packet`: Wire format and the `PacketCodec`
//! - `fragment`: Image splitting
//! - `transmit`: Sender-side transfer session
//! - `reassembly`: Per-transfer fragment buffer
//! - `session`: Receiver-side transfer tracking and timeouts
//! - `link`: Frame sink/source traits and the AT command adapter
//! - `receiver`: Receive loop tying link, session and metrics together
//! - `network`: Link simulator with seeded randomness
//! - `metrics`: Signal samples and per-transfer summaries
//!
//! # Design Principles
//!
//! - **No panics**: Malformed input becomes an event, never a crash
//! - **Bounded memory**: Live transfers and transfer sizes are capped
//! - **Deterministic**: Time is passed in, randomness is seeded
//! - **Observable**: Every lifecycle step is an event the caller can log

pub mod error;
pub mod fragment;
pub mod link;
pub mod metrics;
pub mod network;
pub mod packet;
pub mod reassembly;
pub mod receiver;
pub mod session;
pub mod transmit;

// Re-export commonly used types
pub use error::{Error, Result};
pub use packet::{Packet, PacketCodec, TransferId};
pub use receiver::Receiver;
pub use session::{ReceiveConfig, ReceiveSession, SessionEvent};
pub use transmit::{TransmitConfig, TransmitSession};
