//! Radio link collaborators.
//!
//! The core never touches a serial port directly. It writes whole frames to a
//! [`FrameSink`], reads whole frames from a [`FrameSource`], and asks a
//! [`SignalQualityProvider`] how the last frame was received.
//!
//! [`AtLink`] adapts any byte stream speaking the RAK3172 LoRa P2P AT command
//! set: frames go out as `AT+PSEND=<HEX>` and come back as
//! `+EVT:RXP2P:<rssi>:<snr>:<HEX>` event lines. Opening and configuring the
//! port is left to the caller.

use crate::error::TransportError;
use log::{debug, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};

/// Per-frame reception quality reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalQuality {
    /// Received signal strength, dBm
    pub rssi_dbm: f64,
    /// Signal-to-noise ratio, dB
    pub snr_db: f64,
}

/// Destination for outbound frames.
pub trait FrameSink {
    /// Write one whole frame.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Source of inbound frames.
pub trait FrameSource {
    /// Read one whole frame.
    ///
    /// Returns `Ok(None)` when nothing arrived within the source's own poll
    /// window, so callers can interleave timeout ticks.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Signal measurements for the most recently read frame.
pub trait SignalQualityProvider {
    fn signal_quality(&self) -> Option<SignalQuality>;
}

impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        (**self).write_frame(frame)
    }
}

/// Collects frames in memory.
impl FrameSink for Vec<Vec<u8>> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.push(frame.to_vec());
        Ok(())
    }
}

const RX_EVENT_PREFIX: &str = "+EVT:RXP2P:";
const TX_EVENT: &str = "+EVT:TXP2P";
const BUSY_ERROR: &str = "AT_BUSY_ERROR";

/// One parsed `+EVT:RXP2P` line.
#[derive(Debug, Clone, PartialEq)]
pub struct RxEvent {
    pub quality: SignalQuality,
    pub frame: Vec<u8>,
}

/// Parse a modem receive event line.
///
/// Accepts `+EVT:RXP2P:<rssi>:<snr>:<hex>`; non-hex characters inside the
/// payload field are ignored. Returns `None` for any other line or for a
/// payload that is empty or has an odd number of hex digits.
pub fn parse_rx_event(line: &str) -> Option<RxEvent> {
    let rest = line.trim().strip_prefix(RX_EVENT_PREFIX)?;
    let mut fields = rest.splitn(3, ':');

    let rssi_dbm = fields.next()?.trim().parse().ok()?;
    let snr_db = fields.next()?.trim().parse().ok()?;
    let payload: String = fields
        .next()?
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect();

    if payload.is_empty() {
        return None;
    }
    let frame = hex::decode(&payload).ok()?;

    Some(RxEvent {
        quality: SignalQuality { rssi_dbm, snr_db },
        frame,
    })
}

/// Format the AT command that transmits one frame.
pub fn send_command(frame: &[u8]) -> String {
    format!("AT+PSEND={}\r\n", hex::encode_upper(frame))
}

/// Frame transport over a RAK3172-style AT command stream.
///
/// The stream should have a read timeout configured; a timed-out read is
/// reported as "nothing arrived" rather than an error.
pub struct AtLink<S: Read + Write> {
    stream: BufReader<S>,

    /// Receive events seen while waiting for a command response
    pending: VecDeque<RxEvent>,

    /// Bytes of a line cut short by a read timeout
    partial: Vec<u8>,

    last_quality: Option<SignalQuality>,

    /// Wait for the modem's answer after every PSEND
    await_response: bool,
}

impl<S: Read + Write> AtLink<S> {
    /// Wrap an already opened and configured stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            pending: VecDeque::new(),
            partial: Vec::new(),
            last_quality: None,
            await_response: true,
        }
    }

    /// Do not read a response after each write.
    pub fn fire_and_forget(mut self) -> Self {
        self.await_response = false;
        self
    }

    /// Access the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Read one line; `None` if the read timed out.
    ///
    /// Bytes read before a timeout are kept and completed by the next call.
    fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        match self.stream.read_until(b'\n', &mut self.partial) {
            Ok(0) if self.partial.is_empty() => Err(TransportError::Disconnected),
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                self.partial.clear();
                Ok(Some(line))
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                if !self.partial.is_empty() {
                    debug!("Read timed out mid-line after {} bytes", self.partial.len());
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: Read + Write> FrameSink for AtLink<S> {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let command = send_command(frame);
        let port = self.stream.get_mut();
        port.write_all(command.as_bytes())?;
        port.flush()?;

        if !self.await_response {
            return Ok(());
        }

        loop {
            let Some(line) = self.read_line()? else {
                // Silence usually means the module accepted the command.
                return Ok(());
            };

            if let Some(event) = parse_rx_event(&line) {
                self.pending.push_back(event);
                continue;
            }

            return if line.is_empty() || line.contains(TX_EVENT) || line.contains("OK") {
                Ok(())
            } else if line.contains(BUSY_ERROR) {
                Err(TransportError::Busy)
            } else {
                Err(TransportError::Rejected(line))
            };
        }
    }
}

impl<S: Read + Write> FrameSource for AtLink<S> {
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            self.last_quality = Some(event.quality);
            return Ok(Some(event.frame));
        }

        let Some(line) = self.read_line()? else {
            return Ok(None);
        };

        match parse_rx_event(&line) {
            Some(event) => {
                self.last_quality = Some(event.quality);
                Ok(Some(event.frame))
            }
            None if line.starts_with(RX_EVENT_PREFIX) => {
                warn!("Unparseable receive event: {}", line);
                Ok(None)
            }
            None => {
                if !line.is_empty() {
                    debug!("Module: {}", line);
                }
                Ok(None)
            }
        }
    }
}

impl<S: Read + Write> SignalQualityProvider for AtLink<S> {
    fn signal_quality(&self) -> Option<SignalQuality> {
        self.last_quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};

    /// Scripted modem: reads come from `input`, writes land in `output`.
    struct FakeModem {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeModem {
        fn new(script: &str) -> Self {
            Self {
                input: Cursor::new(script.as_bytes().to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for FakeModem {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeModem {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Modem whose reads follow a script of chunks and timeouts.
    struct StutteringModem {
        steps: VecDeque<Option<&'static [u8]>>,
        output: Vec<u8>,
    }

    impl StutteringModem {
        fn new(steps: &[Option<&'static [u8]>]) -> Self {
            Self {
                steps: steps.iter().copied().collect(),
                output: Vec::new(),
            }
        }
    }

    impl Read for StutteringModem {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(io::Error::new(ErrorKind::TimedOut, "read timed out")),
                None => Ok(0),
            }
        }
    }

    impl Write for StutteringModem {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_rx_event() {
        let event = parse_rx_event("+EVT:RXP2P:-72:8:48656C6C6F\r\n").unwrap();
        assert_eq!(event.quality, SignalQuality { rssi_dbm: -72.0, snr_db: 8.0 });
        assert_eq!(event.frame, b"Hello");
    }

    #[test]
    fn test_parse_rx_event_rejects_other_lines() {
        assert!(parse_rx_event("OK").is_none());
        assert!(parse_rx_event("+EVT:TXP2P DONE").is_none());
        assert!(parse_rx_event("+EVT:RXP2P:-72:8:").is_none());
        assert!(parse_rx_event("+EVT:RXP2P:-72:8:ABC").is_none());
        assert!(parse_rx_event("+EVT:RXP2P:weak:8:AB").is_none());
    }

    #[test]
    fn test_send_command_format() {
        assert_eq!(send_command(&[0x53, 0x0a, 0xff]), "AT+PSEND=530AFF\r\n");
    }

    #[test]
    fn test_write_frame_ok() {
        let mut link = AtLink::new(FakeModem::new("OK\r\n"));
        link.write_frame(b"S").unwrap();
        assert_eq!(link.get_mut().output, b"AT+PSEND=53\r\n");
    }

    #[test]
    fn test_write_frame_busy() {
        let mut link = AtLink::new(FakeModem::new("AT_BUSY_ERROR\r\n"));
        let err = link.write_frame(b"F").unwrap_err();
        assert!(matches!(err, TransportError::Busy));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_write_frame_rejected() {
        let mut link = AtLink::new(FakeModem::new("AT_PARAM_ERROR\r\n"));
        assert!(matches!(link.write_frame(b"F"), Err(TransportError::Rejected(_))));
    }

    #[test]
    fn test_read_frames_and_quality() {
        let script = "+EVT:RXP2P:-90:-3:5468690A\r\nAT+PRECV=65534\r\n+EVT:RXP2P:-60:11:54\r\n";
        let mut link = AtLink::new(FakeModem::new(script));

        assert_eq!(link.read_frame().unwrap(), Some(b"Thi\n".to_vec()));
        assert_eq!(
            link.signal_quality(),
            Some(SignalQuality { rssi_dbm: -90.0, snr_db: -3.0 })
        );

        assert_eq!(link.read_frame().unwrap(), None);
        assert_eq!(link.read_frame().unwrap(), Some(b"T".to_vec()));
        assert_eq!(link.signal_quality().unwrap().rssi_dbm, -60.0);

        assert!(matches!(link.read_frame(), Err(TransportError::Disconnected)));
    }

    #[test]
    fn test_receive_event_during_write_is_queued() {
        let script = "+EVT:RXP2P:-70:5:54\r\nOK\r\n";
        let mut link = AtLink::new(FakeModem::new(script));

        link.write_frame(b"x").unwrap();
        assert_eq!(link.read_frame().unwrap(), Some(b"T".to_vec()));
    }

    #[test]
    fn test_timeout_mid_line_keeps_partial_frame() {
        let modem = StutteringModem::new(&[
            Some(&b"+EVT:RXP2P:-70:5:"[..]),
            None,
            Some(&b"54\r\n"[..]),
        ]);
        let mut link = AtLink::new(modem);

        assert_eq!(link.read_frame().unwrap(), None);
        assert_eq!(link.read_frame().unwrap(), Some(b"T".to_vec()));
        assert_eq!(link.signal_quality().unwrap().snr_db, 5.0);
        assert!(matches!(link.read_frame(), Err(TransportError::Disconnected)));
    }

    #[test]
    fn test_response_split_by_timeout_is_completed() {
        let modem = StutteringModem::new(&[
            Some(&b"AT_BUSY"[..]),
            None,
            Some(&b"_ERROR\r\n"[..]),
        ]);
        let mut link = AtLink::new(modem);

        // Silence after the command counts as accepted
        link.write_frame(b"F").unwrap();
        // The completed line is a stale response, not a frame
        assert_eq!(link.read_frame().unwrap(), None);
        assert!(link.partial.is_empty());
    }

    #[test]
    fn test_fire_and_forget_skips_response() {
        let mut link = AtLink::new(FakeModem::new("+EVT:RXP2P:-80:2:54\r\n")).fire_and_forget();

        link.write_frame(b"S").unwrap();
        assert_eq!(link.get_mut().output, b"AT+PSEND=53\r\n");
        // The receive event was left for the reader
        assert_eq!(link.read_frame().unwrap(), Some(b"T".to_vec()));
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<Vec<u8>> = Vec::new();
        sink.write_frame(&[1, 2]).unwrap();
        (&mut sink).write_frame(&[3]).unwrap();
        assert_eq!(sink, vec![vec![1, 2], vec![3]]);
    }
}
