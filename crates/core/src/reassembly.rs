//! Per-transfer fragment accumulation.
//!
//! A [`ReassemblyBuffer`] collects the fragments of one transfer until the
//! number of distinct indices reaches the count announced by the Start
//! packet.
//!
//! # Design
//!
//! - **Keyed storage**: fragments are held in a `BTreeMap` by index, so
//!   arrival order does not matter and concatenation is already ascending
//! - **Idempotent duplicates**: a repeated index overwrites the previous
//!   payload (last write wins) and does not count twice
//! - **Count-based completion**: completion is declared purely on the count;
//!   the length check against `total_size` happens when the bytes are taken
//! - **Caller-driven time**: every mutation takes `now`, so idle detection
//!   is deterministic under test
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. It is owned by a single
//! [`ReceiveSession`](crate::session::ReceiveSession).

use crate::error::ProtocolError;
use crate::packet::{StartPacket, TransferId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// What happened to an inserted fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New index stored, transfer still incomplete
    Stored,
    /// Index already present; payload replaced
    Duplicate,
    /// Last missing index stored; transfer ready to take
    Complete,
}

/// Fragments received so far for one transfer.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    id: TransferId,

    /// Expected size of the reassembled bytes
    total_size: u32,

    /// Expected number of distinct fragments
    total_fragments: u32,

    /// Sender-local origination time from the Start packet
    origin_timestamp: f64,

    /// Payloads indexed by fragment_index
    fragments: BTreeMap<u32, Vec<u8>>,

    /// Duplicate deliveries seen
    duplicates: u32,

    created_at: Instant,
    last_update: Instant,
}

impl ReassemblyBuffer {
    /// Create an empty buffer from a Start packet.
    pub fn new(start: &StartPacket, now: Instant) -> Self {
        Self {
            id: start.id,
            total_size: start.total_size,
            total_fragments: start.total_fragments,
            origin_timestamp: start.timestamp,
            fragments: BTreeMap::new(),
            duplicates: 0,
            created_at: now,
            last_update: now,
        }
    }

    /// Store one fragment.
    ///
    /// # Errors
    /// `ProtocolError::MalformedFragment` if `index` is out of range or
    /// `total_fragments` disagrees with the Start packet. Nothing is stored.
    pub fn insert(
        &mut self,
        index: u32,
        total_fragments: u32,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<InsertOutcome, ProtocolError> {
        if total_fragments != self.total_fragments || index >= self.total_fragments {
            return Err(ProtocolError::MalformedFragment {
                id: self.id,
                index,
                total_fragments,
                expected_fragments: self.total_fragments,
            });
        }

        let replaced = self.fragments.insert(index, payload).is_some();
        self.last_update = now;

        if replaced {
            self.duplicates += 1;
            return Ok(InsertOutcome::Duplicate);
        }

        if self.is_complete() {
            Ok(InsertOutcome::Complete)
        } else {
            Ok(InsertOutcome::Stored)
        }
    }

    /// Concatenate all fragments in ascending index order (consumes the buffer).
    ///
    /// # Errors
    /// `ProtocolError::SizeMismatchOnCompletion` if the result is not
    /// `total_size` bytes long.
    pub fn into_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        let actual: usize = self.fragments.values().map(Vec::len).sum();
        if actual != self.total_size as usize {
            return Err(ProtocolError::SizeMismatchOnCompletion {
                id: self.id,
                expected: self.total_size,
                actual,
            });
        }

        let mut bytes = Vec::with_capacity(actual);
        for payload in self.fragments.into_values() {
            bytes.extend_from_slice(&payload);
        }
        Ok(bytes)
    }

    /// True when every index in `0..total_fragments` has been stored.
    pub fn is_complete(&self) -> bool {
        self.fragments.len() == self.total_fragments as usize
    }

    /// Indices not yet received, ascending.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_fragments)
            .filter(|index| !self.fragments.contains_key(index))
            .collect()
    }

    /// Time since the last stored fragment (or creation).
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }

    /// Check if this buffer has been idle longer than `timeout`.
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_time(now) > timeout
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn total_fragments(&self) -> u32 {
        self.total_fragments
    }

    pub fn origin_timestamp(&self) -> f64 {
        self.origin_timestamp
    }

    /// Number of distinct fragments received so far.
    pub fn received_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicates
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(total_size: u32, total_fragments: u32) -> StartPacket {
        StartPacket {
            id: TransferId::new("t1").unwrap(),
            total_size,
            total_fragments,
            timestamp: 0.0,
        }
    }

    #[test]
    fn test_new_buffer_carries_start_fields() {
        let now = Instant::now();
        let packet = StartPacket {
            timestamp: 1_700_000_000.25,
            ..start(10, 2)
        };
        let buffer = ReassemblyBuffer::new(&packet, now);

        assert_eq!(buffer.id(), TransferId::new("t1").unwrap());
        assert_eq!(buffer.total_size(), 10);
        assert_eq!(buffer.total_fragments(), 2);
        assert_eq!(buffer.origin_timestamp(), 1_700_000_000.25);
        assert_eq!(buffer.received_count(), 0);
        assert_eq!(buffer.missing_indices(), vec![0, 1]);
    }

    #[test]
    fn test_in_order_completion() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(6, 3), now);

        assert_eq!(buffer.insert(0, 3, vec![1, 2], now), Ok(InsertOutcome::Stored));
        assert_eq!(buffer.insert(1, 3, vec![3, 4], now), Ok(InsertOutcome::Stored));
        assert_eq!(buffer.insert(2, 3, vec![5, 6], now), Ok(InsertOutcome::Complete));

        assert_eq!(buffer.into_bytes().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_out_of_order_packets() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(3, 3), now);

        buffer.insert(2, 3, vec![c(2)], now).unwrap();
        buffer.insert(0, 3, vec![c(0)], now).unwrap();
        assert_eq!(buffer.missing_indices(), vec![1]);
        assert_eq!(buffer.insert(1, 3, vec![c(1)], now), Ok(InsertOutcome::Complete));

        assert_eq!(buffer.into_bytes().unwrap(), vec![c(0), c(1), c(2)]);
    }

    fn c(index: u8) -> u8 {
        b'a' + index
    }

    #[test]
    fn test_duplicate_last_write_wins() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(2, 2), now);

        buffer.insert(0, 2, vec![0xAA], now).unwrap();
        assert_eq!(buffer.insert(0, 2, vec![0xBB], now), Ok(InsertOutcome::Duplicate));
        assert_eq!(buffer.received_count(), 1);
        assert_eq!(buffer.duplicate_count(), 1);

        buffer.insert(1, 2, vec![0xCC], now).unwrap();
        assert_eq!(buffer.into_bytes().unwrap(), vec![0xBB, 0xCC]);
    }

    #[test]
    fn test_index_out_of_range() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(10, 3), now);

        let result = buffer.insert(3, 3, vec![0], now);
        assert!(matches!(result, Err(ProtocolError::MalformedFragment { index: 3, .. })));
        assert_eq!(buffer.received_count(), 0);
    }

    #[test]
    fn test_total_fragment_mismatch() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(10, 3), now);

        let result = buffer.insert(1, 5, vec![0], now);
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedFragment { total_fragments: 5, expected_fragments: 3, .. })
        ));
    }

    #[test]
    fn test_size_mismatch_on_completion() {
        let now = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(100, 1), now);

        assert_eq!(buffer.insert(0, 1, vec![0; 10], now), Ok(InsertOutcome::Complete));
        assert!(matches!(
            buffer.into_bytes(),
            Err(ProtocolError::SizeMismatchOnCompletion { expected: 100, actual: 10, .. })
        ));
    }

    #[test]
    fn test_idle_time_refreshed_by_insert() {
        let created = Instant::now();
        let mut buffer = ReassemblyBuffer::new(&start(3, 3), created);
        let timeout = Duration::from_secs(10);

        let later = created + Duration::from_secs(8);
        buffer.insert(0, 3, vec![0], later).unwrap();

        let check = created + Duration::from_secs(15);
        assert!(!buffer.is_timed_out(check, timeout));
        assert!(buffer.is_timed_out(check + Duration::from_secs(4), timeout));
        assert_eq!(buffer.created_at(), created);
    }
}
