//! Lossy radio link simulator.
//!
//! Stands in for the modem pair so transfers can be exercised end to end
//! without hardware. All effects are deterministic given the same seed.
//!
//! # Simulated Effects
//!
//! - **Latency**: Base delay for all frames
//! - **Jitter**: Random variation in latency (uniform), which reorders frames
//! - **Loss**: Random frame drops (Bernoulli)
//! - **Duplication**: A delivered frame is occasionally delivered twice
//! - **Truncation**: A frame is occasionally cut short, as a radio does when
//!   reception fades mid-packet
//! - **Signal quality**: Each delivery carries RSSI/SNR drawn around
//!   configured means
//!
//! # Implementation
//!
//! Uses a priority queue (min-heap) keyed by delivery time. Frames are
//! inserted with computed delay and extracted when their time arrives.

use crate::error::TransportError;
use crate::link::{FrameSink, FrameSource, SignalQuality, SignalQualityProvider};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Configuration for link simulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Base latency in milliseconds
    pub base_latency_ms: u64,

    /// Jitter range in milliseconds (uniform ±jitter)
    pub jitter_ms: u64,

    /// Frame loss probability [0.0, 1.0]
    pub loss_rate: f64,

    /// Probability a delivered frame arrives twice [0.0, 1.0]
    pub duplicate_rate: f64,

    /// Probability a delivered frame is truncated [0.0, 1.0]
    pub truncate_rate: f64,

    /// Mean RSSI in dBm
    pub rssi_mean_dbm: f64,

    /// Mean SNR in dB
    pub snr_mean_db: f64,

    /// Uniform spread applied to both RSSI and SNR
    pub signal_spread_db: f64,

    /// Random seed for determinism
    pub seed: u64,
}

impl NetworkConfig {
    /// Create a configuration with no impairments (perfect link).
    pub fn perfect(seed: u64) -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            truncate_rate: 0.0,
            rssi_mean_dbm: -60.0,
            snr_mean_db: 10.0,
            signal_spread_db: 0.0,
            seed,
        }
    }

    /// Create a configuration resembling a marginal outdoor LoRa link.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            base_latency_ms: 40,
            jitter_ms: 20,
            loss_rate: 0.02,
            duplicate_rate: 0.01,
            truncate_rate: 0.01,
            rssi_mean_dbm: -88.0,
            snr_mean_db: 4.0,
            signal_spread_db: 6.0,
            seed,
        }
    }

    /// Check probabilities are in range.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, rate) in [
            ("loss", self.loss_rate),
            ("duplicate", self.duplicate_rate),
            ("truncate", self.truncate_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(crate::Error::Config(format!(
                    "{name} rate {rate} must be between 0.0 and 1.0"
                )));
            }
        }
        if self.signal_spread_db < 0.0 {
            return Err(crate::Error::Config("signal spread must not be negative".to_string()));
        }
        Ok(())
    }
}

/// A frame with scheduled delivery time.
#[derive(Debug, Clone)]
struct ScheduledFrame {
    frame: Vec<u8>,
    quality: SignalQuality,
    delivery_time: Instant,
    /// Send order, breaks ties so equal times deliver FIFO
    sequence: u64,
}

// Implement ordering for the heap (min-heap: earliest delivery first)
impl PartialEq for ScheduledFrame {
    fn eq(&self, other: &Self) -> bool {
        self.delivery_time == other.delivery_time && self.sequence == other.sequence
    }
}

impl Eq for ScheduledFrame {}

impl PartialOrd for ScheduledFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earlier time = higher priority)
        other
            .delivery_time
            .cmp(&self.delivery_time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Simulated radio link implementing loss, duplication, truncation and jitter.
///
/// Acts as both ends: frames written through [`FrameSink`] come back out of
/// [`FrameSource`] once their delivery time arrives.
///
/// # Thread Safety
/// Not thread-safe; use one instance per thread or synchronize externally.
pub struct NetworkSimulator {
    config: NetworkConfig,
    rng: ChaCha8Rng,
    queue: BinaryHeap<ScheduledFrame>,
    next_sequence: u64,
    last_quality: Option<SignalQuality>,

    /// Wait applied by `read_frame` when nothing is ready
    poll_window: Duration,

    // Statistics
    frames_sent: u64,
    frames_dropped: u64,
    frames_duplicated: u64,
    frames_truncated: u64,
    frames_delivered: u64,
}

impl NetworkSimulator {
    /// Create a new link simulator with the given configuration.
    pub fn new(config: NetworkConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Self {
            config,
            rng,
            queue: BinaryHeap::new(),
            next_sequence: 0,
            last_quality: None,
            poll_window: Duration::from_millis(10),
            frames_sent: 0,
            frames_dropped: 0,
            frames_duplicated: 0,
            frames_truncated: 0,
            frames_delivered: 0,
        }
    }

    /// Set how long `read_frame` waits for a frame before returning `None`.
    pub fn with_poll_window(mut self, poll_window: Duration) -> Self {
        self.poll_window = poll_window;
        self
    }

    /// Send a frame through the simulated link.
    ///
    /// The frame may be:
    /// - Dropped (if loss_rate > 0)
    /// - Truncated to a random shorter length
    /// - Duplicated
    /// - Delayed by latency + jitter, reordering it relative to others
    pub fn send(&mut self, frame: &[u8]) {
        self.frames_sent += 1;

        if self.roll(self.config.loss_rate) {
            self.frames_dropped += 1;
            return;
        }

        let mut frame = frame.to_vec();
        if frame.len() > 1 && self.roll(self.config.truncate_rate) {
            let keep = self.rng.gen_range(1..frame.len());
            frame.truncate(keep);
            self.frames_truncated += 1;
        }

        let copies = if self.roll(self.config.duplicate_rate) {
            self.frames_duplicated += 1;
            2
        } else {
            1
        };

        for _ in 0..copies {
            let delay_ms = self.compute_delay();
            let quality = self.sample_quality();
            let sequence = self.next_sequence;
            self.next_sequence += 1;

            self.queue.push(ScheduledFrame {
                frame: frame.clone(),
                quality,
                delivery_time: Instant::now() + Duration::from_millis(delay_ms),
                sequence,
            });
        }
    }

    /// Try to receive a frame if one is ready.
    ///
    /// # Returns
    /// - `Some((frame, quality))` if a frame's delivery time has arrived
    /// - `None` if no frames are ready yet
    pub fn recv(&mut self) -> Option<(Vec<u8>, SignalQuality)> {
        let ready = self
            .queue
            .peek()
            .is_some_and(|scheduled| Instant::now() >= scheduled.delivery_time);
        if !ready {
            return None;
        }

        let scheduled = self.queue.pop()?;
        self.frames_delivered += 1;
        self.last_quality = Some(scheduled.quality);
        Some((scheduled.frame, scheduled.quality))
    }

    /// Receive a frame, waiting up to the specified duration.
    ///
    /// # Note
    /// This busy-waits with short sleeps.
    pub fn recv_wait(&mut self, timeout: Duration) -> Option<(Vec<u8>, SignalQuality)> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(delivery) = self.recv() {
                return Some(delivery);
            }

            if Instant::now() >= deadline || self.queue.is_empty() {
                return None;
            }

            // Small sleep to avoid busy-waiting
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Check if any frames are currently in flight (queued).
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Get count of frames currently in flight.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Drain all remaining frames immediately in delivery order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(scheduled) = self.queue.pop() {
            frames.push(scheduled.frame);
            self.frames_delivered += 1;
        }
        frames
    }

    /// Get statistics about link behavior.
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            frames_duplicated: self.frames_duplicated,
            frames_truncated: self.frames_truncated,
            frames_delivered: self.frames_delivered,
            frames_in_flight: self.queue.len(),
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    /// Compute delay for a frame in milliseconds.
    ///
    /// Delay = base_latency ± jitter
    fn compute_delay(&mut self) -> u64 {
        let base = self.config.base_latency_ms;

        if self.config.jitter_ms == 0 {
            return base;
        }

        // Uniform jitter: base ± jitter_ms
        let jitter_range = self.config.jitter_ms * 2;
        let jitter = self.rng.gen_range(0..=jitter_range);
        let jitter_offset = jitter as i64 - self.config.jitter_ms as i64;

        (base as i64 + jitter_offset).max(0) as u64
    }

    fn sample_quality(&mut self) -> SignalQuality {
        let spread = self.config.signal_spread_db;
        let (rssi_offset, snr_offset) = if spread == 0.0 {
            (0.0, 0.0)
        } else {
            (
                self.rng.gen_range(-spread..=spread),
                self.rng.gen_range(-spread..=spread),
            )
        };

        SignalQuality {
            rssi_dbm: (self.config.rssi_mean_dbm + rssi_offset).round(),
            snr_db: (self.config.snr_mean_db + snr_offset).round(),
        }
    }
}

impl FrameSink for NetworkSimulator {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.send(frame);
        Ok(())
    }
}

impl FrameSource for NetworkSimulator {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let window = self.poll_window;
        Ok(self.recv_wait(window).map(|(frame, _)| frame))
    }
}

impl SignalQualityProvider for NetworkSimulator {
    fn signal_quality(&self) -> Option<SignalQuality> {
        self.last_quality
    }
}

/// Statistics about simulator behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Total frames written into the simulator
    pub frames_sent: u64,

    /// Frames dropped due to loss
    pub frames_dropped: u64,

    /// Frames delivered twice
    pub frames_duplicated: u64,

    /// Frames cut short
    pub frames_truncated: u64,

    /// Frames handed to the receiver (duplicates counted)
    pub frames_delivered: u64,

    /// Frames currently in flight
    pub frames_in_flight: usize,
}

impl NetworkStats {
    /// Compute frame loss rate.
    pub fn loss_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u8) -> Vec<u8> {
        vec![b'F', id, id, id]
    }

    #[test]
    fn test_perfect_link() {
        let mut sim = NetworkSimulator::new(NetworkConfig::perfect(42));

        sim.send(&frame(0));

        // Should be available immediately (no delay)
        let (received, quality) = sim.recv().unwrap();
        assert_eq!(received, frame(0));
        assert_eq!(quality, SignalQuality { rssi_dbm: -60.0, snr_db: 10.0 });
        assert_eq!(sim.signal_quality(), Some(quality));

        let stats = sim.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.frames_delivered, 1);
    }

    #[test]
    fn test_fifo_without_jitter() {
        let mut sim = NetworkSimulator::new(NetworkConfig::perfect(1));
        for i in 0..20 {
            sim.write_frame(&frame(i)).unwrap();
        }

        let received: Vec<Vec<u8>> = std::iter::from_fn(|| sim.read_frame().unwrap()).collect();
        let expected: Vec<Vec<u8>> = (0..20).map(frame).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_latency() {
        let config = NetworkConfig {
            base_latency_ms: 50,
            ..NetworkConfig::perfect(42)
        };
        let mut sim = NetworkSimulator::new(config);

        let start = Instant::now();
        sim.send(&frame(0));

        // Should not be available immediately
        assert!(sim.recv().is_none());
        assert_eq!(sim.pending_count(), 1);

        let (received, _) = sim.recv_wait(Duration::from_millis(200)).unwrap();
        assert_eq!(received, frame(0));
        assert_eq!(sim.pending_count(), 0);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_frame_loss() {
        let config = NetworkConfig {
            loss_rate: 0.5,
            ..NetworkConfig::perfect(42)
        };
        let mut sim = NetworkSimulator::new(config);

        for i in 0..100 {
            sim.send(&frame(i));
        }

        let stats = sim.stats();
        assert_eq!(stats.frames_sent, 100);
        // Allow 30-70% range due to randomness
        assert!(stats.frames_dropped >= 30 && stats.frames_dropped <= 70);
        assert_eq!(stats.frames_in_flight as u64, 100 - stats.frames_dropped);
    }

    #[test]
    fn test_duplication() {
        let config = NetworkConfig {
            duplicate_rate: 1.0,
            ..NetworkConfig::perfect(3)
        };
        let mut sim = NetworkSimulator::new(config);
        sim.send(&frame(7));

        assert_eq!(sim.drain(), vec![frame(7), frame(7)]);
        assert_eq!(sim.stats().frames_duplicated, 1);
    }

    #[test]
    fn test_truncation() {
        let config = NetworkConfig {
            truncate_rate: 1.0,
            ..NetworkConfig::perfect(5)
        };
        let mut sim = NetworkSimulator::new(config);
        sim.send(&[1u8; 64]);

        let frames = sim.drain();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_empty() && frames[0].len() < 64);
        assert_eq!(sim.stats().frames_truncated, 1);
    }

    #[test]
    fn test_determinism() {
        let config = NetworkConfig::default_with_seed(12345);

        let mut sim1 = NetworkSimulator::new(config);
        let mut sim2 = NetworkSimulator::new(config);

        for i in 0..50 {
            sim1.send(&frame(i));
            sim2.send(&frame(i));
        }

        assert_eq!(sim1.stats(), sim2.stats());

        let mut frames1 = sim1.drain();
        let mut frames2 = sim2.drain();
        frames1.sort();
        frames2.sort();
        assert_eq!(frames1, frames2);
    }

    #[test]
    fn test_signal_spread_bounds() {
        let config = NetworkConfig {
            signal_spread_db: 5.0,
            ..NetworkConfig::perfect(8)
        };
        let mut sim = NetworkSimulator::new(config);
        for i in 0..50 {
            sim.send(&frame(i));
        }

        while let Some((_, quality)) = sim.recv() {
            assert!((-65.0..=-55.0).contains(&quality.rssi_dbm));
            assert!((5.0..=15.0).contains(&quality.snr_db));
        }
    }

    #[test]
    fn test_validate() {
        assert!(NetworkConfig::default_with_seed(1).validate().is_ok());
        let bad = NetworkConfig {
            loss_rate: 1.5,
            ..NetworkConfig::perfect(1)
        };
        assert!(bad.validate().is_err());
    }
}
