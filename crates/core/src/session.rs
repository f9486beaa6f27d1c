//! Receive-side transfer lifecycle.
//!
//! A [`ReceiveSession`] owns every live [`ReassemblyBuffer`], keyed by
//! transfer id. Raw frames go in, [`SessionEvent`]s come out. Nothing in
//! here fails: decode and protocol problems drop the offending frame and are
//! reported as events, and stalled transfers are surfaced by [`tick`].
//!
//! # Lifecycle
//!
//! ```text
//! Start ──► buffer created ──► Fragment* ──► all indices ──► TransferComplete
//!   │                              │                      └► TransferCorrupt
//!   │                              └─ idle > timeout ─────► TransferAbandoned
//!   └─ Start with same id while live ─────────────────────► TransferAbandoned
//! ```
//!
//! [`tick`]: ReceiveSession::tick

use crate::error::{DecodeError, ProtocolError};
use crate::packet::{EndPacket, FragmentPacket, Packet, StartPacket, TransferId, MAX_PAYLOAD_LEN};
use crate::reassembly::{InsertOutcome, ReassemblyBuffer};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Receive-side configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Idle time after which an incomplete transfer is abandoned
    pub idle_timeout_ms: u64,

    /// Maximum transfers reassembled at once; the stalest is evicted
    pub max_live_transfers: usize,

    /// Largest total_size a Start may declare
    pub max_transfer_size: u32,
}

impl ReceiveConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Check values are usable.
    pub fn validate(&self) -> crate::Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(crate::Error::Config("idle timeout must be positive".to_string()));
        }
        if self.max_live_transfers == 0 {
            return Err(crate::Error::Config(
                "max live transfers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            max_live_transfers: 16,
            max_transfer_size: 16 * 1024 * 1024,
        }
    }
}

/// Why a transfer was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbandonReason {
    /// No fragment arrived within the idle timeout
    Timeout,
    /// A new Start reused the transfer id
    Replaced,
    /// Pushed out to make room for a newer transfer
    Evicted,
}

/// Lifecycle notifications emitted by a [`ReceiveSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TransferStarted {
        id: TransferId,
        total_size: u32,
        total_fragments: u32,
        /// Sender-local origination time
        origin_timestamp: f64,
    },
    FragmentReceived {
        id: TransferId,
        index: u32,
        /// Distinct fragments stored so far
        received: u32,
        expected: u32,
        duplicate: bool,
    },
    TransferComplete {
        id: TransferId,
        bytes: Vec<u8>,
        /// Receive-side time from Start to last fragment
        elapsed: Duration,
    },
    TransferAbandoned {
        id: TransferId,
        missing: Vec<u32>,
        received: u32,
        expected: u32,
        reason: AbandonReason,
    },
    MalformedFragment {
        id: TransferId,
        index: u32,
        total_fragments: u32,
        expected_fragments: u32,
    },
    OrphanFragment {
        id: TransferId,
        index: u32,
    },
    TransferCorrupt {
        id: TransferId,
        expected_size: u32,
        actual_size: usize,
    },
    MalformedStart {
        id: TransferId,
        reason: String,
    },
    FrameRejected {
        error: DecodeError,
    },
    TextReceived {
        text: String,
    },
    TransferEnded {
        id: TransferId,
        /// Sender-local time the last fragment was written
        end_timestamp: f64,
        /// Whether the transfer was still being reassembled
        live: bool,
    },
}

impl SessionEvent {
    /// Stable kebab-case name, used for logs and counters.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TransferStarted { .. } => "transfer-started",
            SessionEvent::FragmentReceived { .. } => "fragment-received",
            SessionEvent::TransferComplete { .. } => "transfer-complete",
            SessionEvent::TransferAbandoned { .. } => "transfer-abandoned",
            SessionEvent::MalformedFragment { .. } => "malformed-fragment",
            SessionEvent::OrphanFragment { .. } => "orphan-fragment",
            SessionEvent::TransferCorrupt { .. } => "transfer-corrupt",
            SessionEvent::MalformedStart { .. } => "malformed-start",
            SessionEvent::FrameRejected { .. } => "frame-rejected",
            SessionEvent::TextReceived { .. } => "text-received",
            SessionEvent::TransferEnded { .. } => "transfer-ended",
        }
    }

    /// The transfer this event concerns, if any.
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            SessionEvent::TransferStarted { id, .. }
            | SessionEvent::FragmentReceived { id, .. }
            | SessionEvent::TransferComplete { id, .. }
            | SessionEvent::TransferAbandoned { id, .. }
            | SessionEvent::MalformedFragment { id, .. }
            | SessionEvent::OrphanFragment { id, .. }
            | SessionEvent::TransferCorrupt { id, .. }
            | SessionEvent::MalformedStart { id, .. }
            | SessionEvent::TransferEnded { id, .. } => Some(*id),
            SessionEvent::FrameRejected { .. } | SessionEvent::TextReceived { .. } => None,
        }
    }
}

impl From<ProtocolError> for SessionEvent {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::OrphanFragment { id, index } => SessionEvent::OrphanFragment { id, index },
            ProtocolError::MalformedFragment {
                id,
                index,
                total_fragments,
                expected_fragments,
            } => SessionEvent::MalformedFragment {
                id,
                index,
                total_fragments,
                expected_fragments,
            },
            ProtocolError::SizeMismatchOnCompletion {
                id,
                expected,
                actual,
            } => SessionEvent::TransferCorrupt {
                id,
                expected_size: expected,
                actual_size: actual,
            },
            ProtocolError::MalformedStart { id, reason } => SessionEvent::MalformedStart { id, reason },
        }
    }
}

/// Snapshot of session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Transfers currently being reassembled
    pub live_transfers: usize,

    pub completed: u64,
    pub abandoned: u64,
    pub corrupt: u64,
}

/// Reassembles inbound transfers from raw frames.
///
/// # Thread Safety
/// Owned by one receive loop. A caller ticking from a second thread wraps
/// the whole session in a single `Mutex`.
#[derive(Debug)]
pub struct ReceiveSession {
    config: ReceiveConfig,

    /// Live transfers indexed by transfer id
    buffers: HashMap<TransferId, ReassemblyBuffer>,

    completed: u64,
    abandoned: u64,
    corrupt: u64,
}

impl ReceiveSession {
    /// Create a session with no live transfers.
    pub fn new(config: ReceiveConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
            completed: 0,
            abandoned: 0,
            corrupt: 0,
        }
    }

    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    /// Decode one raw frame and apply it.
    pub fn handle_frame(&mut self, raw: &[u8], now: Instant) -> Vec<SessionEvent> {
        match Packet::decode(raw) {
            Ok(packet) => self.handle_packet(packet, now),
            Err(error) => {
                warn!("Dropping {}-byte frame: {}", raw.len(), error);
                vec![SessionEvent::FrameRejected { error }]
            }
        }
    }

    /// Apply one decoded packet.
    pub fn handle_packet(&mut self, packet: Packet, now: Instant) -> Vec<SessionEvent> {
        match packet {
            Packet::Start(start) => self.on_start(start, now),
            Packet::Fragment(fragment) => self.on_fragment(fragment, now),
            Packet::End(end) => self.on_end(end),
            Packet::Text(text) => {
                info!("Text message: {:?}", text);
                vec![SessionEvent::TextReceived { text }]
            }
        }
    }

    /// Begin (or restart) a transfer.
    ///
    /// An existing buffer with the same id is discarded and reported as
    /// abandoned. A Start whose declared shape is impossible is dropped and
    /// leaves any existing buffer untouched.
    pub fn on_start(&mut self, start: StartPacket, now: Instant) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if let Err(error) = self.check_start(&start) {
            warn!("{}", error);
            events.push(error.into());
            return events;
        }

        if let Some(previous) = self.buffers.remove(&start.id) {
            warn!("Transfer {} restarted by a new Start packet", start.id);
            events.push(self.abandon(previous, AbandonReason::Replaced));
        } else if self.buffers.len() >= self.config.max_live_transfers {
            if let Some(stalest) = self.stalest() {
                if let Some(evicted) = self.buffers.remove(&stalest) {
                    warn!("Evicting transfer {} to make room for {}", stalest, start.id);
                    events.push(self.abandon(evicted, AbandonReason::Evicted));
                }
            }
        }

        info!(
            "Started transfer {}: {} bytes in {} fragments",
            start.id, start.total_size, start.total_fragments
        );
        events.push(SessionEvent::TransferStarted {
            id: start.id,
            total_size: start.total_size,
            total_fragments: start.total_fragments,
            origin_timestamp: start.timestamp,
        });

        let buffer = ReassemblyBuffer::new(&start, now);
        if buffer.is_complete() {
            // Zero-fragment transfer: nothing will ever arrive for it.
            events.push(self.finish(buffer, now));
        } else {
            self.buffers.insert(start.id, buffer);
        }

        events
    }

    /// Store one fragment, completing the transfer if it was the last.
    pub fn on_fragment(&mut self, fragment: FragmentPacket, now: Instant) -> Vec<SessionEvent> {
        let FragmentPacket {
            id,
            index,
            total_fragments,
            payload,
        } = fragment;

        let Some(buffer) = self.buffers.get_mut(&id) else {
            let error = ProtocolError::OrphanFragment { id, index };
            warn!("{}", error);
            return vec![error.into()];
        };

        let outcome = match buffer.insert(index, total_fragments, payload, now) {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("{}", error);
                return vec![error.into()];
            }
        };

        let received = buffer.received_count() as u32;
        let expected = buffer.total_fragments();
        debug!("Transfer {} fragment {} ({}/{})", id, index, received, expected);

        let mut events = vec![SessionEvent::FragmentReceived {
            id,
            index,
            received,
            expected,
            duplicate: outcome == InsertOutcome::Duplicate,
        }];

        if outcome == InsertOutcome::Complete {
            if let Some(buffer) = self.buffers.remove(&id) {
                events.push(self.finish(buffer, now));
            }
        }

        events
    }

    /// Note the sender's End marker. Never completes or abandons anything.
    pub fn on_end(&mut self, end: EndPacket) -> Vec<SessionEvent> {
        let live = self.buffers.contains_key(&end.id);
        if let Some(buffer) = self.buffers.get(&end.id) {
            info!(
                "Sender finished transfer {} with {}/{} fragments received",
                end.id,
                buffer.received_count(),
                buffer.total_fragments()
            );
        }
        vec![SessionEvent::TransferEnded {
            id: end.id,
            end_timestamp: end.timestamp,
            live,
        }]
    }

    /// Abandon every transfer idle longer than the configured timeout.
    ///
    /// Call periodically, independent of packet arrival.
    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        let timeout = self.config.idle_timeout();

        let mut timed_out: Vec<TransferId> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.is_timed_out(now, timeout))
            .map(|(id, _)| *id)
            .collect();
        timed_out.sort();

        let mut events = Vec::with_capacity(timed_out.len());
        for id in timed_out {
            if let Some(buffer) = self.buffers.remove(&id) {
                events.push(self.abandon(buffer, AbandonReason::Timeout));
            }
        }
        events
    }

    /// The live buffer for a transfer, if any.
    pub fn buffer(&self, id: &TransferId) -> Option<&ReassemblyBuffer> {
        self.buffers.get(id)
    }

    /// Check if no transfer is being reassembled.
    pub fn is_idle(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            live_transfers: self.buffers.len(),
            completed: self.completed,
            abandoned: self.abandoned,
            corrupt: self.corrupt,
        }
    }

    fn check_start(&self, start: &StartPacket) -> Result<(), ProtocolError> {
        let size = u64::from(start.total_size);
        let fragments = u64::from(start.total_fragments);

        let reason = if start.total_size > self.config.max_transfer_size {
            format!(
                "declared size {} exceeds limit {}",
                start.total_size, self.config.max_transfer_size
            )
        } else if fragments > size {
            format!("{} fragments cannot carry {} bytes", fragments, size)
        } else if size > fragments * MAX_PAYLOAD_LEN as u64 {
            format!("{} bytes do not fit in {} fragments", size, fragments)
        } else {
            return Ok(());
        };

        Err(ProtocolError::MalformedStart {
            id: start.id,
            reason,
        })
    }

    fn stalest(&self) -> Option<TransferId> {
        self.buffers
            .values()
            .min_by_key(|buffer| (buffer.last_update(), buffer.id()))
            .map(ReassemblyBuffer::id)
    }

    fn finish(&mut self, buffer: ReassemblyBuffer, now: Instant) -> SessionEvent {
        let id = buffer.id();
        let elapsed = now.saturating_duration_since(buffer.created_at());

        match buffer.into_bytes() {
            Ok(bytes) => {
                self.completed += 1;
                info!("Transfer {} complete: {} bytes in {:?}", id, bytes.len(), elapsed);
                SessionEvent::TransferComplete { id, bytes, elapsed }
            }
            Err(error) => {
                self.corrupt += 1;
                warn!("{}", error);
                error.into()
            }
        }
    }

    fn abandon(&mut self, buffer: ReassemblyBuffer, reason: AbandonReason) -> SessionEvent {
        self.abandoned += 1;
        let missing = buffer.missing_indices();
        warn!(
            "Abandoning transfer {} ({:?}): missing {} of {} fragments",
            buffer.id(),
            reason,
            missing.len(),
            buffer.total_fragments()
        );

        SessionEvent::TransferAbandoned {
            id: buffer.id(),
            missing,
            received: buffer.received_count() as u32,
            expected: buffer.total_fragments(),
            reason,
        }
    }
}

impl Default for ReceiveSession {
    fn default() -> Self {
        Self::new(ReceiveConfig::default())
    }
}
