//! Integration tests for the full image transfer pipeline.
//!
//! These tests verify end-to-end behavior: image -> fragments -> packets ->
//! link -> reassembly -> image, with verification that output matches input
//! whenever a transfer completes.

use lora_image_core::{
    link::AtLink,
    network::{NetworkConfig, NetworkSimulator},
    packet::{Packet, PacketCodec},
    receiver::Receiver,
    session::{AbandonReason, ReceiveConfig, ReceiveSession, SessionEvent},
    transmit::{TransmitConfig, TransmitSession},
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::Cursor;
use std::time::{Duration, Instant};

fn sample_image(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    if len >= 4 {
        bytes[..2].copy_from_slice(&[0xFF, 0xD8]);
        bytes[len - 2..].copy_from_slice(&[0xFF, 0xD9]);
    }
    bytes
}

fn unpaced(max_payload: usize) -> TransmitConfig {
    TransmitConfig {
        max_payload,
        pacing_delay_ms: 0,
        start_delay_ms: 0,
        send_end: true,
    }
}

/// Run a transfer into memory and return the frames in send order.
fn send_to_memory(image: &[u8], max_payload: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut frames: Vec<Vec<u8>> = Vec::new();
    TransmitSession::new(PacketCodec::default(), unpaced(max_payload))
        .with_seed(seed)
        .with_pacer(|_: Duration| {})
        .run(&mut frames, image, |_| {})
        .expect("transmit failed");
    frames
}

fn completions(events: &[SessionEvent]) -> Vec<&Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::TransferComplete { bytes, .. } => Some(bytes),
            _ => None,
        })
        .collect()
}

/// 150,000 bytes at 200 bytes per fragment, shuffled and partly duplicated.
#[test]
fn test_large_image_shuffled_with_duplicates() {
    let image = sample_image(150_000, 1);
    let frames = send_to_memory(&image, 200, 7);

    // Start + 750 fragments + End
    assert_eq!(frames.len(), 752);
    match Packet::decode(&frames[0]).unwrap() {
        Packet::Start(start) => {
            assert_eq!(start.total_size, 150_000);
            assert_eq!(start.total_fragments, 750);
        }
        other => panic!("expected Start, got {:?}", other),
    }

    let mut fragments: Vec<Vec<u8>> = frames[1..751].to_vec();
    fragments.extend(frames[1..101].iter().cloned());
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    fragments.shuffle(&mut rng);

    let mut session = ReceiveSession::default();
    let now = Instant::now();
    let mut events = session.handle_frame(&frames[0], now);
    for fragment in &fragments {
        events.extend(session.handle_frame(fragment, now));
    }

    let done = completions(&events);
    assert_eq!(done.len(), 1, "expected exactly one completion");
    assert_eq!(done[0], &image, "output doesn't match input");
    assert!(session.is_idle());
}

/// One fragment never arrives: the transfer is abandoned on timeout.
#[test]
fn test_missing_fragment_abandons_on_timeout() {
    let image = sample_image(10_000, 2);
    let frames = send_to_memory(&image, 100, 8);
    let lost_index = 37u32;

    let config = ReceiveConfig {
        idle_timeout_ms: 5_000,
        ..ReceiveConfig::default()
    };
    let mut session = ReceiveSession::new(config);
    let t0 = Instant::now();

    let mut events = Vec::new();
    for frame in &frames {
        if let Ok(Packet::Fragment(fragment)) = Packet::decode(frame) {
            if fragment.index == lost_index {
                continue;
            }
        }
        events.extend(session.handle_frame(frame, t0));
    }
    assert!(completions(&events).is_empty());

    assert!(session.tick(t0 + Duration::from_secs(5)).is_empty());
    let abandoned = session.tick(t0 + Duration::from_millis(5_001));
    assert_eq!(abandoned.len(), 1);
    match &abandoned[0] {
        SessionEvent::TransferAbandoned {
            missing,
            received,
            expected,
            reason,
            ..
        } => {
            assert_eq!(missing, &vec![lost_index]);
            assert_eq!(*received, 99);
            assert_eq!(*expected, 100);
            assert_eq!(*reason, AbandonReason::Timeout);
        }
        other => panic!("expected abandon, got {:?}", other),
    }
    assert!(session.tick(t0 + Duration::from_secs(60)).is_empty());
}

/// Sender -> simulated link -> receive loop over a clean link.
#[test]
fn test_transmit_through_simulator() {
    let image = sample_image(4_000, 3);
    let network = NetworkSimulator::new(NetworkConfig::perfect(42))
        .with_poll_window(Duration::from_millis(1));
    let mut receiver = Receiver::new(network, ReceiveConfig::default());

    let report = TransmitSession::new(PacketCodec::default(), unpaced(236))
        .with_seed(5)
        .with_pacer(|_: Duration| {})
        .run(receiver.source_mut(), &image, |_| {})
        .expect("transmit failed");
    assert_eq!(report.total_fragments, 17);
    assert_eq!(report.success_rate(), 1.0);

    let mut events = Vec::new();
    while receiver.source_mut().has_pending() {
        events.extend(receiver.poll(Instant::now()).unwrap());
    }

    let done = completions(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0], &image);

    let summary = receiver.metrics().summarize(&report.id).unwrap();
    assert_eq!(summary.received_count, 17);
    assert_eq!(summary.loss_ratio, 0.0);
    assert!(summary.transmission_secs.is_some());
}

/// Over a lossy link a transfer either completes intact or is abandoned
/// with the gaps listed. It never completes with wrong bytes.
#[test]
fn test_lossy_link_never_corrupts() {
    let image = sample_image(5_000, 4);

    for seed in 0..8u64 {
        let config = NetworkConfig {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.05,
            duplicate_rate: 0.05,
            truncate_rate: 0.02,
            ..NetworkConfig::perfect(seed)
        };
        let network = NetworkSimulator::new(config).with_poll_window(Duration::from_millis(1));
        let receive_config = ReceiveConfig {
            idle_timeout_ms: 1_000,
            ..ReceiveConfig::default()
        };
        let mut receiver = Receiver::new(network, receive_config);

        TransmitSession::new(PacketCodec::default(), unpaced(100))
            .with_seed(seed)
            .with_pacer(|_: Duration| {})
            .run(receiver.source_mut(), &image, |_| {})
            .expect("transmit failed");

        let mut events = Vec::new();
        while receiver.source_mut().has_pending() {
            events.extend(receiver.poll(Instant::now()).unwrap());
        }
        events.extend(receiver.flush(Instant::now() + Duration::from_millis(1_001)));

        for bytes in completions(&events) {
            assert_eq!(bytes, &image, "seed {}: completed with wrong bytes", seed);
        }

        let started = events
            .iter()
            .any(|event| matches!(event, SessionEvent::TransferStarted { .. }));
        let timed_out: Vec<&Vec<u32>> = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::TransferAbandoned {
                    missing,
                    reason: AbandonReason::Timeout,
                    ..
                } => Some(missing),
                _ => None,
            })
            .collect();

        if started {
            assert_eq!(
                completions(&events).len() + timed_out.len(),
                1,
                "seed {}: transfer neither completed nor timed out",
                seed
            );
        }
        for missing in timed_out {
            assert!(!missing.is_empty());
        }
        assert!(receiver.session().is_idle());
    }
}

/// Frames arriving as modem receive events are reassembled with signal data.
#[test]
fn test_receive_over_at_link() {
    let image = sample_image(1_000, 5);
    let frames = send_to_memory(&image, 236, 9);

    let script: String = frames
        .iter()
        .enumerate()
        .map(|(i, frame)| {
            format!(
                "+EVT:RXP2P:-{}:{}:{}\r\nOK\r\n",
                70 + i,
                9 - i as i64,
                hex::encode_upper(frame)
            )
        })
        .collect();

    let link = AtLink::new(Cursor::new(script.into_bytes()));
    let mut receiver = Receiver::new(link, ReceiveConfig::default());

    let mut events = Vec::new();
    let now = Instant::now();
    while let Ok(batch) = receiver.poll(now) {
        events.extend(batch);
    }

    let done = completions(&events);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0], &image);

    let id = events[0].transfer_id().unwrap();
    let summary = receiver.metrics().summarize(&id).unwrap();
    assert_eq!(summary.expected_count, 5);
    assert_eq!(summary.received_count, 5);
    let signal = summary.signal_strength.unwrap();
    assert_eq!(signal.max, -70.0);
    assert_eq!(signal.min, -75.0);
}
