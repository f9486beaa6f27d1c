mod config;
mod input_gen;

use clap::Parser;
use config::{Cli, Config};
use lora_image_core::error::TransportError;
use lora_image_core::link::FrameSink;
use lora_image_core::metrics::ReceptionReport;
use lora_image_core::network::{NetworkSimulator, NetworkStats};
use lora_image_core::transmit::{TransmitReport, TransmitSession};
use lora_image_core::{Receiver, SessionEvent, TransferId};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver as FrameRx, SyncSender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Frames queued between the sender thread and the simulated link
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Core(#[from] lora_image_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("sender thread panicked")]
    SenderPanicked,
}

/// Hands frames from the sender thread to the link thread.
struct ChannelSink(SyncSender<Vec<u8>>);

impl FrameSink for ChannelSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.0
            .send(frame.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    transmit: &'a TransmitReport,
    link: NetworkStats,
    reception: ReceptionReport,
    output_matches_input: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the image arrived intact.
fn run(cli: &Cli) -> Result<bool, AppError> {
    let config = Config::from_cli(cli)?;
    if config.print_config {
        config.print()?;
    }

    let image = load_image(&config)?;
    info!(
        "Sending {} bytes (seed {}, MTU {})",
        image.len(),
        config.seed,
        config.mtu
    );

    let codec = config.codec()?;
    let network = NetworkSimulator::new(config.network).with_poll_window(Duration::from_millis(5));
    let mut receiver = Receiver::new(network, config.receive);

    let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
    let payload = image.clone();
    let message = config.message.clone();
    let transmit = config.transmit;
    let seed = config.seed;
    let sender = thread::spawn(move || -> lora_image_core::Result<TransmitReport> {
        let mut sink = ChannelSink(tx);
        if let Some(text) = message {
            sink.write_frame(&codec.encode_text(&text)?)?;
        }
        TransmitSession::new(codec, transmit)
            .with_seed(seed)
            .run(&mut sink, &payload, |event| debug!("{:?}", event))
    });

    let mut received = None;
    pump(&mut receiver, &rx, &mut received)?;

    let deadline = Instant::now() + config.receive.idle_timeout() + Duration::from_millis(1);
    for event in receiver.flush(deadline) {
        handle_event(event, &mut received);
    }

    let report = sender.join().map_err(|_| AppError::SenderPanicked)??;

    let matches = match &received {
        Some((id, bytes)) => {
            std::fs::write(&config.output_file, bytes).map_err(|source| AppError::Write {
                path: config.output_file.clone(),
                source,
            })?;
            info!(
                "Wrote transfer {} to {}",
                id,
                config.output_file.display()
            );
            bytes == &image
        }
        None => {
            warn!("No transfer completed; nothing written");
            false
        }
    };

    let link = receiver.source_mut().stats();
    let (_, _, metrics) = receiver.into_parts();

    if config.json_report {
        let run_report = RunReport {
            transmit: &report,
            link,
            reception: metrics.report(),
            output_matches_input: matches,
        };
        println!("{}", serde_json::to_string_pretty(&run_report)?);
    } else {
        print_report(&report, &link, &metrics.report(), matches);
    }

    Ok(matches)
}

fn load_image(config: &Config) -> Result<Vec<u8>, AppError> {
    match &config.input_file {
        Some(path) => std::fs::read(path).map_err(|source| AppError::Read {
            path: path.clone(),
            source,
        }),
        None => {
            let sample = input_gen::generate_sample_image(config.seed, config.sample_size);
            info!("Generated {}-byte sample image", sample.len());
            Ok(sample)
        }
    }
}

/// Move frames from the sender into the link and poll the receiver until
/// the sender is done and the link is empty.
fn pump(
    receiver: &mut Receiver<NetworkSimulator>,
    rx: &FrameRx<Vec<u8>>,
    received: &mut Option<(TransferId, Vec<u8>)>,
) -> Result<(), AppError> {
    let mut sender_done = false;

    loop {
        loop {
            match rx.try_recv() {
                Ok(frame) => receiver.source_mut().send(&frame),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    sender_done = true;
                    break;
                }
            }
        }

        let events = receiver.poll(Instant::now())?;
        let quiet = events.is_empty();
        for event in events {
            handle_event(event, received);
        }

        let in_flight = receiver.source_mut().has_pending();
        if sender_done && !in_flight {
            return Ok(());
        }
        if quiet && !in_flight {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn handle_event(event: SessionEvent, received: &mut Option<(TransferId, Vec<u8>)>) {
    match event {
        SessionEvent::TransferComplete { id, bytes, elapsed } => {
            info!(
                "Transfer {} complete: {} bytes in {:.2}s",
                id,
                bytes.len(),
                elapsed.as_secs_f64()
            );
            *received = Some((id, bytes));
        }
        SessionEvent::TransferAbandoned {
            id,
            missing,
            received: got,
            expected,
            reason,
        } => {
            warn!(
                "Transfer {} abandoned ({:?}): {}/{} fragments, {} missing",
                id,
                reason,
                got,
                expected,
                missing.len()
            );
        }
        SessionEvent::TextReceived { text } => info!("Message: {}", text),
        other => debug!("{}: {:?}", other.name(), other.transfer_id()),
    }
}

fn print_report(
    transmit: &TransmitReport,
    link: &NetworkStats,
    reception: &ReceptionReport,
    matches: bool,
) {
    println!("=== Transmit ===");
    println!("Transfer id: {}", transmit.id);
    println!("Image size: {} bytes", transmit.total_size);
    println!(
        "Fragments written: {}/{} ({:.1}%)",
        transmit.fragments_written,
        transmit.total_fragments,
        transmit.success_rate() * 100.0
    );
    println!("Failed writes: {}", transmit.failed_writes);
    println!("Duration: {:.2}s", transmit.duration_secs);
    println!();
    println!("=== Link ===");
    println!("Frames sent: {}", link.frames_sent);
    println!(
        "Dropped: {} ({:.2}%)",
        link.frames_dropped,
        link.loss_rate() * 100.0
    );
    println!("Duplicated: {}", link.frames_duplicated);
    println!("Truncated: {}", link.frames_truncated);
    println!();
    println!("=== Reception ===");
    for summary in &reception.transfers {
        println!(
            "{}: {:?}, {}/{} fragments, loss {:.1}%",
            summary.id,
            summary.outcome,
            summary.received_count,
            summary.expected_count,
            summary.loss_ratio * 100.0
        );
        if let (Some(signal), Some(noise)) = (summary.signal_strength, summary.noise) {
            println!(
                "  RSSI {:.1}/{:.1}/{:.1} dBm ({:?}), SNR avg {:.1} dB ({:?}), {:?}",
                signal.min,
                signal.avg,
                signal.max,
                summary.signal_grade,
                noise.avg,
                summary.noise_grade,
                summary.stability
            );
        }
        if let Some(secs) = summary.transmission_secs {
            println!("  Sender time: {:.2}s", secs);
        }
    }
    println!(
        "Completion rate: {:.1}%",
        reception.completion_rate * 100.0
    );
    println!();
    println!(
        "Output matches input: {}",
        if matches { "yes" } else { "NO" }
    );
}
