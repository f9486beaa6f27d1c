//! Outbound transfer driver.
//!
//! A [`TransmitSession`] sends one image: a Start packet, every Fragment in
//! ascending index order with a pause between sends, then an End marker.
//! Nothing is acknowledged. A failed write is reported and the sequence
//! carries on, since the sender has no way to learn what the receiver lost;
//! only a fatal link error (device gone) stops the run.

use crate::error::{Result, TransportError};
use crate::fragment::split;
use crate::link::FrameSink;
use crate::packet::{PacketCodec, TransferId, DEFAULT_MTU, FRAGMENT_HEADER_SIZE};
use log::{debug, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Transmit-side configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitConfig {
    /// Payload bytes per Fragment
    pub max_payload: usize,

    /// Pause between consecutive sends (link duty cycle)
    pub pacing_delay_ms: u64,

    /// Pause after the Start packet before the first Fragment
    pub start_delay_ms: u64,

    /// Send an End marker after the last Fragment
    pub send_end: bool,
}

impl TransmitConfig {
    /// Check values against the codec's limits.
    pub fn validate(&self, codec: &PacketCodec) -> Result<()> {
        if self.max_payload == 0 || self.max_payload > codec.max_fragment_payload() {
            return Err(crate::Error::Config(format!(
                "max payload {} must be between 1 and {} for MTU {}",
                self.max_payload,
                codec.max_fragment_payload(),
                codec.mtu()
            )));
        }
        Ok(())
    }
}

impl Default for TransmitConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MTU - FRAGMENT_HEADER_SIZE,
            pacing_delay_ms: 300,
            start_delay_ms: 500,
            send_end: true,
        }
    }
}

/// Waits between sends.
pub trait Pacer {
    fn pause(&mut self, delay: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, delay: Duration) {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

impl<F: FnMut(Duration)> Pacer for F {
    fn pause(&mut self, delay: Duration) {
        self(delay)
    }
}

/// Progress notifications from a run.
#[derive(Debug)]
pub enum TransmitEvent {
    StartSent {
        id: TransferId,
        total_size: u32,
        total_fragments: u32,
    },
    FragmentSent {
        id: TransferId,
        index: u32,
    },
    /// A single write failed; the run continues
    WriteFailed {
        id: TransferId,
        /// `None` for the Start or End packet
        index: Option<u32>,
        error: TransportError,
    },
    EndSent {
        id: TransferId,
    },
    /// Cancellation observed; no further fragments are issued
    Cancelled {
        id: TransferId,
        next_index: u32,
    },
}

/// Outcome of one transfer from the sender's point of view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransmitReport {
    pub id: TransferId,
    pub total_size: u32,
    pub total_fragments: u32,
    pub start_written: bool,
    pub fragments_written: u32,
    pub failed_writes: u32,
    pub end_written: bool,
    pub cancelled: bool,
    /// Sender-local time of the Start packet, seconds
    pub started_at: f64,
    pub duration_secs: f64,
}

impl TransmitReport {
    /// Fraction of fragments the link accepted.
    pub fn success_rate(&self) -> f64 {
        if self.total_fragments == 0 {
            1.0
        } else {
            f64::from(self.fragments_written) / f64::from(self.total_fragments)
        }
    }
}

/// Sender-local wall clock in seconds.
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Drives a single outbound transfer; consumed by [`run`](Self::run).
pub struct TransmitSession<P: Pacer = ThreadPacer> {
    codec: PacketCodec,
    config: TransmitConfig,
    rng: ChaCha8Rng,
    pacer: P,
    cancel: Arc<AtomicBool>,
}

impl TransmitSession<ThreadPacer> {
    /// Create a session with an entropy-seeded id generator and thread sleeps.
    pub fn new(codec: PacketCodec, config: TransmitConfig) -> Self {
        Self {
            codec,
            config,
            rng: ChaCha8Rng::from_entropy(),
            pacer: ThreadPacer,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<P: Pacer> TransmitSession<P> {
    /// Seed the transfer id generator for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Replace the pacer.
    pub fn with_pacer<Q: Pacer>(self, pacer: Q) -> TransmitSession<Q> {
        TransmitSession {
            codec: self.codec,
            config: self.config,
            rng: self.rng,
            pacer,
            cancel: self.cancel,
        }
    }

    /// Flag that stops the run before its next fragment once set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Send `bytes` as one transfer.
    ///
    /// # Errors
    /// - `Error::Config` if the configuration does not fit the codec
    /// - `Error::Split` if the image cannot be fragmented
    /// - `Error::Transport` if the link fails fatally; the partial transfer
    ///   is left for the receiver to time out
    pub fn run<S, F>(mut self, sink: &mut S, bytes: &[u8], mut on_event: F) -> Result<TransmitReport>
    where
        S: FrameSink + ?Sized,
        F: FnMut(TransmitEvent),
    {
        self.config.validate(&self.codec)?;
        let chunks = split(bytes, self.config.max_payload)?;

        let id = TransferId::random(&mut self.rng);
        let total_size = bytes.len() as u32;
        let total_fragments = chunks.len() as u32;
        let started = Instant::now();
        let started_at = wall_clock_secs();

        info!(
            "Sending transfer {}: {} bytes in {} fragments",
            id, total_size, total_fragments
        );

        let mut report = TransmitReport {
            id,
            total_size,
            total_fragments,
            start_written: false,
            fragments_written: 0,
            failed_writes: 0,
            end_written: false,
            cancelled: false,
            started_at,
            duration_secs: 0.0,
        };

        let start = self.codec.encode_start(&id, total_size, total_fragments, started_at);
        match sink.write_frame(&start) {
            Ok(()) => {
                report.start_written = true;
                on_event(TransmitEvent::StartSent {
                    id,
                    total_size,
                    total_fragments,
                });
            }
            Err(error) => self.write_failed(&mut report, None, error, &mut on_event)?,
        }

        self.pacer
            .pause(Duration::from_millis(self.config.start_delay_ms));

        let pacing = Duration::from_millis(self.config.pacing_delay_ms);
        for (position, (index, chunk)) in chunks.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Transfer {} cancelled before fragment {}", id, index);
                report.cancelled = true;
                on_event(TransmitEvent::Cancelled {
                    id,
                    next_index: *index,
                });
                break;
            }

            let frame = self
                .codec
                .encode_fragment(&id, *index, total_fragments, chunk)?;
            match sink.write_frame(&frame) {
                Ok(()) => {
                    report.fragments_written += 1;
                    debug!("Sent fragment {}/{}", index + 1, total_fragments);
                    on_event(TransmitEvent::FragmentSent { id, index: *index });
                }
                Err(error) => {
                    self.write_failed(&mut report, Some(*index), error, &mut on_event)?
                }
            }

            let more = position + 1 < chunks.len() || self.config.send_end;
            if more {
                self.pacer.pause(pacing);
            }
        }

        if self.config.send_end && !report.cancelled {
            let end = self.codec.encode_end(&id, wall_clock_secs());
            match sink.write_frame(&end) {
                Ok(()) => {
                    report.end_written = true;
                    on_event(TransmitEvent::EndSent { id });
                }
                Err(error) => self.write_failed(&mut report, None, error, &mut on_event)?,
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            "Transfer {} sent: {}/{} fragments written in {:.2}s",
            id, report.fragments_written, total_fragments, report.duration_secs
        );
        Ok(report)
    }

    /// Record a failed write; fatal link errors end the run.
    fn write_failed<F: FnMut(TransmitEvent)>(
        &self,
        report: &mut TransmitReport,
        index: Option<u32>,
        error: TransportError,
        on_event: &mut F,
    ) -> Result<()> {
        if error.is_fatal() {
            warn!("Transfer {} aborted: {}", report.id, error);
            return Err(error.into());
        }

        warn!("Transfer {} write failed ({:?}): {}", report.id, index, error);
        report.failed_writes += 1;
        on_event(TransmitEvent::WriteFailed {
            id: report.id,
            index,
            error,
        });
        Ok(())
    }
}
