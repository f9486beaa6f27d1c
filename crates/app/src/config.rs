//! Configuration for the lora-image application.
//!
//! Handles parsing command-line arguments and generating sensible defaults
//! (including randomized link conditions that are reproducible with a seed).
//!
//! # Philosophy
//!
//! The tool should work with ZERO arguments, using intelligent defaults.
//! The resolved configuration can be printed so runs are reproducible.

use clap::Parser;
use lora_image_core::network::NetworkConfig;
use lora_image_core::packet::{PacketCodec, DEFAULT_MTU};
use lora_image_core::session::ReceiveConfig;
use lora_image_core::transmit::TransmitConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "lora-image")]
#[command(about = "Send an image across a simulated LoRa link and reassemble it", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Input image (default: generate a JPEG-like sample)
    #[arg(long = "in")]
    pub input: Option<PathBuf>,

    /// Where to write the reassembled image
    #[arg(long = "out", default_value = "./received.jpg")]
    pub output: PathBuf,

    /// Random seed for determinism (default: time-based)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Size of the generated sample in bytes
    #[arg(long, default_value_t = 20_000)]
    pub sample_size: usize,

    /// Radio MTU in bytes
    #[arg(long, default_value_t = DEFAULT_MTU)]
    pub mtu: usize,

    /// Payload bytes per fragment (default: the most the MTU allows)
    #[arg(long)]
    pub max_payload: Option<usize>,

    /// Pause between fragments in milliseconds
    #[arg(long, default_value_t = 5)]
    pub pacing_ms: u64,

    /// Pause after the Start packet in milliseconds
    #[arg(long, default_value_t = 20)]
    pub start_delay_ms: u64,

    /// Do not send the End marker
    #[arg(long, default_value_t = false)]
    pub no_end: bool,

    /// Text message to send before the image
    #[arg(long)]
    pub message: Option<String>,

    /// Base link latency in ms (default: random 10-80)
    #[arg(long)]
    pub latency: Option<u64>,

    /// Latency jitter in ms (default: random 0-40)
    #[arg(long)]
    pub jitter: Option<u64>,

    /// Frame loss rate 0.0-1.0 (default: random 0-0.05)
    #[arg(long)]
    pub loss: Option<f64>,

    /// Frame duplication rate 0.0-1.0 (default: random 0-0.02)
    #[arg(long)]
    pub duplicate: Option<f64>,

    /// Frame truncation rate 0.0-1.0 (default: random 0-0.01)
    #[arg(long)]
    pub truncate: Option<f64>,

    /// Perfect link: no loss, duplication or truncation
    #[arg(long, default_value_t = false)]
    pub no_loss: bool,

    /// Mean RSSI in dBm (default: random -110 to -60)
    #[arg(long, allow_negative_numbers = true)]
    pub rssi: Option<f64>,

    /// Mean SNR in dB (default: random -5 to 12)
    #[arg(long, allow_negative_numbers = true)]
    pub snr: Option<f64>,

    /// Reassembly idle timeout in ms
    #[arg(long, default_value_t = 2_000)]
    pub timeout: u64,

    /// Print resolved configuration as JSON
    #[arg(long, default_value_t = false)]
    pub print_config: bool,

    /// Print the reception report as JSON instead of text
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Complete configuration for a transfer run.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // === Files ===
    /// Input file path (None = generate sample)
    pub input_file: Option<PathBuf>,

    /// Output file path
    pub output_file: PathBuf,

    /// Generated sample size in bytes
    pub sample_size: usize,

    /// Seed for the sample, transfer id and link
    pub seed: u64,

    // === Radio ===
    pub mtu: usize,

    /// Optional Text packet sent ahead of the image
    pub message: Option<String>,

    pub transmit: TransmitConfig,
    pub network: NetworkConfig,
    pub receive: ReceiveConfig,

    // === Behavior ===
    pub print_config: bool,
    pub json_report: bool,
}

impl Config {
    /// Resolve command-line arguments into a validated configuration.
    ///
    /// If --seed is omitted a time-based seed is used; every randomized
    /// default is drawn from that seed.
    pub fn from_cli(cli: &Cli) -> lora_image_core::Result<Self> {
        let seed = cli.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default()
        });

        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let codec = PacketCodec::new(cli.mtu)?;

        let (loss, duplicate, truncate) = if cli.no_loss {
            (0.0, 0.0, 0.0)
        } else {
            (
                cli.loss.unwrap_or_else(|| {
                    // Bias toward small loss rates
                    let r: f64 = rng.gen();
                    r * r * 0.05
                }),
                cli.duplicate.unwrap_or_else(|| rng.gen_range(0.0..0.02)),
                cli.truncate.unwrap_or_else(|| rng.gen_range(0.0..0.01)),
            )
        };

        let config = Config {
            input_file: cli.input.clone(),
            output_file: cli.output.clone(),
            sample_size: cli.sample_size,
            seed,
            mtu: cli.mtu,
            message: cli.message.clone(),
            transmit: TransmitConfig {
                max_payload: cli.max_payload.unwrap_or(codec.max_fragment_payload()),
                pacing_delay_ms: cli.pacing_ms,
                start_delay_ms: cli.start_delay_ms,
                send_end: !cli.no_end,
            },
            network: NetworkConfig {
                base_latency_ms: cli.latency.unwrap_or_else(|| rng.gen_range(10..=80)),
                jitter_ms: cli.jitter.unwrap_or_else(|| rng.gen_range(0..=40)),
                loss_rate: loss,
                duplicate_rate: duplicate,
                truncate_rate: truncate,
                rssi_mean_dbm: cli.rssi.unwrap_or_else(|| rng.gen_range(-110..=-60) as f64),
                snr_mean_db: cli.snr.unwrap_or_else(|| rng.gen_range(-5..=12) as f64),
                signal_spread_db: 4.0,
                seed,
            },
            receive: ReceiveConfig {
                idle_timeout_ms: cli.timeout,
                ..ReceiveConfig::default()
            },
            print_config: cli.print_config,
            json_report: cli.json,
        };

        config.transmit.validate(&codec)?;
        config.network.validate()?;
        config.receive.validate()?;

        Ok(config)
    }

    pub fn codec(&self) -> lora_image_core::Result<PacketCodec> {
        PacketCodec::new(self.mtu)
    }

    /// Print the configuration as pretty JSON.
    pub fn print(&self) -> serde_json::Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("lora-image").chain(args.iter().copied()))
    }

    #[test]
    fn test_zero_argument_defaults() {
        let config = Config::from_cli(&parse(&[])).unwrap();
        assert!(config.input_file.is_none());
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.transmit.max_payload, 236);
        assert!(config.transmit.send_end);
        assert!(config.network.loss_rate <= 0.05);
    }

    #[test]
    fn test_seed_makes_defaults_reproducible() {
        let a = Config::from_cli(&parse(&["--seed", "42"])).unwrap();
        let b = Config::from_cli(&parse(&["--seed", "42"])).unwrap();
        assert_eq!(a.network, b.network);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn test_explicit_link_settings() {
        let cli = parse(&[
            "--seed", "1", "--no-loss", "--latency", "10", "--jitter", "0", "--rssi", "-95",
        ]);
        let config = Config::from_cli(&cli).unwrap();
        assert_eq!(config.network.loss_rate, 0.0);
        assert_eq!(config.network.duplicate_rate, 0.0);
        assert_eq!(config.network.base_latency_ms, 10);
        assert_eq!(config.network.jitter_ms, 0);
        assert_eq!(config.network.rssi_mean_dbm, -95.0);
    }

    #[test]
    fn test_payload_must_fit_mtu() {
        let cli = parse(&["--mtu", "100", "--max-payload", "90"]);
        assert!(Config::from_cli(&cli).is_err());

        let cli = parse(&["--mtu", "100", "--max-payload", "81"]);
        assert_eq!(Config::from_cli(&cli).unwrap().transmit.max_payload, 81);
    }

    #[test]
    fn test_invalid_loss_rejected() {
        assert!(Config::from_cli(&parse(&["--loss", "1.5"])).is_err());
    }

    #[test]
    fn test_config_serializes() {
        let config = Config::from_cli(&parse(&["--seed", "3"])).unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["seed"], 3);
        assert_eq!(json["receive"]["idle_timeout_ms"], 2000);
    }
}
