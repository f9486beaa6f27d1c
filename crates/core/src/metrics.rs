//! Signal-quality metrics for received transfers.
//!
//! This module provides observable insight into link behavior:
//! - Per-fragment RSSI/SNR samples, correlated to transfers
//! - Loss ratio and timing per transfer
//! - Link-wide event counters (rejected frames, orphans, abandons)
//! - Signal grading for quick field diagnosis
//!
//! # Design
//!
//! Samples are append-only: once recorded they are never changed. All
//! statistics are computed on demand from the samples plus what the
//! collector has learned from session events.
//!
//! # Thread Safety
//!
//! The `MetricsCollector` struct is NOT thread-safe. For multi-threaded use,
//! wrap in `Arc<Mutex<MetricsCollector>>`.

use crate::packet::TransferId;
use crate::session::SessionEvent;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

/// One per-frame signal measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSample {
    pub id: TransferId,
    /// `None` for the Start packet
    pub fragment_index: Option<u32>,
    /// RSSI, dBm
    pub signal_strength: f64,
    /// SNR, dB
    pub noise: f64,
    pub timestamp: Instant,
}

/// Coarse quality band for a signal measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalGrade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalGrade {
    /// Grade an RSSI value: >= -70 excellent, >= -85 good, >= -100 fair.
    pub fn from_rssi(rssi_dbm: f64) -> Self {
        if rssi_dbm >= -70.0 {
            SignalGrade::Excellent
        } else if rssi_dbm >= -85.0 {
            SignalGrade::Good
        } else if rssi_dbm >= -100.0 {
            SignalGrade::Fair
        } else {
            SignalGrade::Poor
        }
    }

    /// Grade an SNR value: >= 10 excellent, >= 5 good, >= 0 fair.
    pub fn from_snr(snr_db: f64) -> Self {
        if snr_db >= 10.0 {
            SignalGrade::Excellent
        } else if snr_db >= 5.0 {
            SignalGrade::Good
        } else if snr_db >= 0.0 {
            SignalGrade::Fair
        } else {
            SignalGrade::Poor
        }
    }
}

/// How much RSSI wandered over a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stability {
    VeryStable,
    Stable,
    Moderate,
    Unstable,
}

impl Stability {
    /// Classify a max-min RSSI spread in dB.
    pub fn from_spread(spread_db: f64) -> Self {
        if spread_db <= 5.0 {
            Stability::VeryStable
        } else if spread_db <= 10.0 {
            Stability::Stable
        } else if spread_db <= 20.0 {
            Stability::Moderate
        } else {
            Stability::Unstable
        }
    }
}

/// Final state of a transfer as seen by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferOutcome {
    InProgress,
    Complete,
    Abandoned,
    Corrupt,
}

/// Min/avg/max over a set of measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl SignalStats {
    fn from_values(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }
        (count > 0).then(|| SignalStats {
            min,
            avg: sum / count as f64,
            max,
        })
    }

    pub fn spread(&self) -> f64 {
        self.max - self.min
    }
}

/// On-demand statistics for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub id: TransferId,

    /// Distinct fragment indices sampled
    pub received_count: u32,

    /// Fragment count declared by the Start packet (0 if never seen)
    pub expected_count: u32,

    /// 1 - received/expected, 0 when nothing was expected
    pub loss_ratio: f64,

    /// Time between the first and last sample, seconds
    pub elapsed_secs: f64,

    /// Sender-side Start to End time, seconds, when both were seen
    pub transmission_secs: Option<f64>,

    /// RSSI statistics, dBm
    pub signal_strength: Option<SignalStats>,

    /// SNR statistics, dB
    pub noise: Option<SignalStats>,

    pub signal_grade: Option<SignalGrade>,
    pub noise_grade: Option<SignalGrade>,
    pub stability: Option<Stability>,
    pub outcome: TransferOutcome,
}

/// Link-wide counters maintained from session events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub frames_received: u64,
    pub frames_rejected: u64,
    pub text_messages: u64,
    pub fragments_received: u64,
    pub duplicate_fragments: u64,
    pub orphan_fragments: u64,
    pub malformed_fragments: u64,
    pub malformed_starts: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_abandoned: u64,
    pub transfers_corrupt: u64,
}

/// Count of samples per RSSI grade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GradeDistribution {
    pub excellent: u64,
    pub good: u64,
    pub fair: u64,
    pub poor: u64,
}

/// Aggregate view across every transfer seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceptionReport {
    pub transfers: Vec<TransferSummary>,
    pub completion_rate: f64,
    pub signal_strength: Option<SignalStats>,
    pub noise: Option<SignalStats>,
    pub grade_distribution: GradeDistribution,
    pub counters: EventCounters,
}

#[derive(Debug)]
struct TransferRecord {
    expected: u32,
    origin_timestamp: Option<f64>,
    end_timestamp: Option<f64>,
    outcome: TransferOutcome,
    samples: Vec<MetricsSample>,

    /// Index of the first sample of the latest attempt
    attempt_start: usize,
}

impl TransferRecord {
    fn new() -> Self {
        Self {
            expected: 0,
            origin_timestamp: None,
            end_timestamp: None,
            outcome: TransferOutcome::InProgress,
            samples: Vec::new(),
            attempt_start: 0,
        }
    }

    /// Samples recorded since the latest Start.
    fn attempt(&self) -> &[MetricsSample] {
        &self.samples[self.attempt_start..]
    }
}

/// Append-only store of signal samples plus event-derived transfer state.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    transfers: HashMap<TransferId, TransferRecord>,

    /// Transfer ids in first-seen order
    order: Vec<TransferId>,

    counters: EventCounters,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample.
    pub fn record(
        &mut self,
        id: TransferId,
        fragment_index: Option<u32>,
        signal_strength: f64,
        noise: f64,
        timestamp: Instant,
    ) {
        self.entry(id).samples.push(MetricsSample {
            id,
            fragment_index,
            signal_strength,
            noise,
            timestamp,
        });
    }

    /// Count one raw frame read from the link.
    pub fn count_frame(&mut self) {
        self.counters.frames_received += 1;
    }

    /// Learn expectations and outcomes from a session event.
    pub fn observe(&mut self, event: &SessionEvent) {
        let counters = &mut self.counters;
        match event {
            SessionEvent::TransferStarted { .. } => counters.transfers_started += 1,
            SessionEvent::FragmentReceived { duplicate, .. } => {
                counters.fragments_received += 1;
                if *duplicate {
                    counters.duplicate_fragments += 1;
                }
            }
            SessionEvent::TransferComplete { .. } => counters.transfers_completed += 1,
            SessionEvent::TransferAbandoned { .. } => counters.transfers_abandoned += 1,
            SessionEvent::TransferCorrupt { .. } => counters.transfers_corrupt += 1,
            SessionEvent::MalformedFragment { .. } => counters.malformed_fragments += 1,
            SessionEvent::OrphanFragment { .. } => counters.orphan_fragments += 1,
            SessionEvent::MalformedStart { .. } => counters.malformed_starts += 1,
            SessionEvent::FrameRejected { .. } => counters.frames_rejected += 1,
            SessionEvent::TextReceived { .. } => counters.text_messages += 1,
            SessionEvent::TransferEnded { .. } => {}
        }

        match event {
            SessionEvent::TransferStarted {
                id,
                total_fragments,
                origin_timestamp,
                ..
            } => {
                let record = self.entry(*id);
                record.expected = *total_fragments;
                record.origin_timestamp = Some(*origin_timestamp);
                record.end_timestamp = None;
                record.outcome = TransferOutcome::InProgress;
                record.attempt_start = record.samples.len();
            }
            SessionEvent::TransferComplete { id, .. } => {
                self.entry(*id).outcome = TransferOutcome::Complete;
            }
            SessionEvent::TransferAbandoned { id, .. } => {
                self.entry(*id).outcome = TransferOutcome::Abandoned;
            }
            SessionEvent::TransferCorrupt { id, .. } => {
                self.entry(*id).outcome = TransferOutcome::Corrupt;
            }
            SessionEvent::TransferEnded {
                id, end_timestamp, ..
            } => {
                if let Some(record) = self.transfers.get_mut(id) {
                    record.end_timestamp = Some(*end_timestamp);
                }
            }
            _ => {}
        }
    }

    /// Samples recorded for a transfer, in arrival order.
    pub fn samples(&self, id: &TransferId) -> &[MetricsSample] {
        self.transfers
            .get(id)
            .map_or(&[], |record| record.samples.as_slice())
    }

    /// Compute statistics for one transfer.
    ///
    /// Only samples recorded since the latest Start for `id` count, so a
    /// restarted transfer does not inherit fragments from the replaced one.
    /// Returns `None` if nothing was ever recorded or observed for `id`.
    pub fn summarize(&self, id: &TransferId) -> Option<TransferSummary> {
        let record = self.transfers.get(id)?;

        let samples = record.attempt();

        let received_count = samples
            .iter()
            .filter_map(|sample| sample.fragment_index)
            .collect::<BTreeSet<_>>()
            .len() as u32;

        let loss_ratio = if record.expected == 0 {
            0.0
        } else {
            (1.0 - f64::from(received_count) / f64::from(record.expected)).max(0.0)
        };

        let elapsed_secs = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => last
                .timestamp
                .saturating_duration_since(first.timestamp)
                .as_secs_f64(),
            _ => 0.0,
        };

        let transmission_secs = match (record.origin_timestamp, record.end_timestamp) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        };

        let signal_strength =
            SignalStats::from_values(samples.iter().map(|s| s.signal_strength));
        let noise = SignalStats::from_values(samples.iter().map(|s| s.noise));

        Some(TransferSummary {
            id: *id,
            received_count,
            expected_count: record.expected,
            loss_ratio,
            elapsed_secs,
            transmission_secs,
            signal_grade: signal_strength.map(|s| SignalGrade::from_rssi(s.avg)),
            noise_grade: noise.map(|s| SignalGrade::from_snr(s.avg)),
            stability: signal_strength.map(|s| Stability::from_spread(s.spread())),
            signal_strength,
            noise,
            outcome: record.outcome,
        })
    }

    /// Summaries for every transfer, in first-seen order.
    pub fn summaries(&self) -> Vec<TransferSummary> {
        self.order
            .iter()
            .filter_map(|id| self.summarize(id))
            .collect()
    }

    pub fn counters(&self) -> EventCounters {
        self.counters
    }

    /// Aggregate statistics across all transfers and samples.
    pub fn report(&self) -> ReceptionReport {
        let transfers = self.summaries();
        let finished = transfers
            .iter()
            .filter(|s| s.outcome != TransferOutcome::InProgress)
            .count();
        let completed = transfers
            .iter()
            .filter(|s| s.outcome == TransferOutcome::Complete)
            .count();

        let all_samples = || self.transfers.values().flat_map(|r| r.samples.iter());

        let mut grade_distribution = GradeDistribution::default();
        for sample in all_samples() {
            match SignalGrade::from_rssi(sample.signal_strength) {
                SignalGrade::Excellent => grade_distribution.excellent += 1,
                SignalGrade::Good => grade_distribution.good += 1,
                SignalGrade::Fair => grade_distribution.fair += 1,
                SignalGrade::Poor => grade_distribution.poor += 1,
            }
        }

        ReceptionReport {
            completion_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
            signal_strength: SignalStats::from_values(all_samples().map(|s| s.signal_strength)),
            noise: SignalStats::from_values(all_samples().map(|s| s.noise)),
            grade_distribution,
            counters: self.counters,
            transfers,
        }
    }

    /// Export link-wide metrics as simple key=value lines.
    pub fn export_text(&self) -> String {
        let report = self.report();
        let c = &report.counters;
        let mut text = format!(
            "frames_received={}\n\
             frames_rejected={}\n\
             transfers_started={}\n\
             transfers_completed={}\n\
             transfers_abandoned={}\n\
             transfers_corrupt={}\n\
             orphan_fragments={}\n\
             malformed_fragments={}\n\
             duplicate_fragments={}\n\
             completion_rate={:.4}\n",
            c.frames_received,
            c.frames_rejected,
            c.transfers_started,
            c.transfers_completed,
            c.transfers_abandoned,
            c.transfers_corrupt,
            c.orphan_fragments,
            c.malformed_fragments,
            c.duplicate_fragments,
            report.completion_rate,
        );
        if let Some(signal) = report.signal_strength {
            text.push_str(&format!(
                "rssi_min={:.1}\nrssi_avg={:.1}\nrssi_max={:.1}\n",
                signal.min, signal.avg, signal.max
            ));
        }
        text
    }

    /// Export the full reception report as JSON.
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.report())
    }

    fn entry(&mut self, id: TransferId) -> &mut TransferRecord {
        let order = &mut self.order;
        self.transfers.entry(id).or_insert_with(|| {
            order.push(id);
            TransferRecord::new()
        })
    }
}
