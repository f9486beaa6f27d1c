//! Receive loop glue: link, session and metrics in one place.
//!
//! A [`Receiver`] pulls frames from a [`FrameSource`], feeds them to a
//! [`ReceiveSession`], and records the link's signal measurements for every
//! Start and Fragment the session accepted. Each poll also runs the timeout
//! sweep, so a caller only has to keep calling [`Receiver::poll`].

use crate::error::Result;
use crate::link::{FrameSource, SignalQualityProvider};
use crate::metrics::MetricsCollector;
use crate::session::{ReceiveConfig, ReceiveSession, SessionEvent};
use log::debug;
use std::time::Instant;

pub struct Receiver<S> {
    source: S,
    session: ReceiveSession,
    metrics: MetricsCollector,
}

impl<S: FrameSource + SignalQualityProvider> Receiver<S> {
    pub fn new(source: S, config: ReceiveConfig) -> Self {
        Self {
            source,
            session: ReceiveSession::new(config),
            metrics: MetricsCollector::new(),
        }
    }

    /// Read at most one frame, then sweep timed-out transfers.
    ///
    /// # Errors
    /// `Error::Transport` if the source failed; session state is kept so the
    /// caller can still [`flush`](Self::flush).
    pub fn poll(&mut self, now: Instant) -> Result<Vec<SessionEvent>> {
        let mut events = match self.source.read_frame()? {
            Some(frame) => {
                self.metrics.count_frame();
                let events = self.session.handle_frame(&frame, now);
                // Observe first so a restarting Start opens the new attempt
                // before its own sample lands.
                for event in &events {
                    self.metrics.observe(event);
                    self.record_quality(event, now);
                }
                events
            }
            None => Vec::new(),
        };

        let expired = self.session.tick(now);
        for event in &expired {
            self.metrics.observe(event);
        }
        events.extend(expired);
        Ok(events)
    }

    /// Sweep timed-out transfers without reading.
    pub fn flush(&mut self, now: Instant) -> Vec<SessionEvent> {
        let events = self.session.tick(now);
        for event in &events {
            self.metrics.observe(event);
        }
        events
    }

    pub fn session(&self) -> &ReceiveSession {
        &self.session
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_parts(self) -> (S, ReceiveSession, MetricsCollector) {
        (self.source, self.session, self.metrics)
    }

    fn record_quality(&mut self, event: &SessionEvent, now: Instant) {
        let (id, index) = match event {
            SessionEvent::TransferStarted { id, .. } => (*id, None),
            SessionEvent::FragmentReceived { id, index, .. } => (*id, Some(*index)),
            _ => return,
        };

        match self.source.signal_quality() {
            Some(quality) => self
                .metrics
                .record(id, index, quality.rssi_dbm, quality.snr_db, now),
            None => debug!("No signal quality for frame of transfer {}", id),
        }
    }
}
