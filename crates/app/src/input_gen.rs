//! Sample image generation for testing.
//!
//! When no input file is specified, we generate bytes shaped like a baseline
//! JPEG: SOI marker, a JFIF APP0 segment, an entropy-coded body and the EOI
//! marker. Nothing decodes the body; it only has to be a realistic payload
//! whose first and last bytes make corruption easy to spot.
//!
//! # Design
//!
//! The body mixes:
//! - Flat regions (runs of the same byte)
//! - Textured regions (short repeating patterns)
//! - Noisy regions (random bytes, with 0xFF stuffed as 0xFF 0x00)

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// End-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

const JFIF_APP0: [u8; 18] = [
    0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00, 0x48, 0x00,
    0x48, 0x00, 0x00,
];

/// Generate a JPEG-like sample of exactly `size_bytes` bytes.
///
/// Sizes too small to hold the markers and APP0 segment are filled with
/// random bytes only.
pub fn generate_sample_image(seed: u64, size_bytes: usize) -> Vec<u8> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let framing = SOI.len() + JFIF_APP0.len() + EOI.len();

    if size_bytes < framing {
        return (0..size_bytes).map(|_| rng.gen()).collect();
    }

    let mut data = Vec::with_capacity(size_bytes);
    data.extend_from_slice(&SOI);
    data.extend_from_slice(&JFIF_APP0);

    let body_len = size_bytes - framing;
    let body_end = data.len() + body_len;
    while data.len() < body_end {
        let region = (body_end - data.len()).min(rng.gen_range(64..=1024));

        match rng.gen_range(0..10) {
            // 30% flat
            0..=2 => {
                let byte_value: u8 = rng.gen_range(0x00..0xFF);
                data.extend(std::iter::repeat(byte_value).take(region));
            }

            // 30% textured
            3..=5 => {
                let pattern = generate_pattern(&mut rng);
                data.extend(pattern.iter().cycle().take(region));
            }

            // 40% noisy
            _ => {
                let mut written = 0;
                while written < region {
                    let byte: u8 = rng.gen();
                    if byte == 0xFF && written + 2 <= region {
                        data.extend_from_slice(&[0xFF, 0x00]);
                        written += 2;
                    } else {
                        data.push(if byte == 0xFF { 0xFE } else { byte });
                        written += 1;
                    }
                }
            }
        }
    }

    data.extend_from_slice(&EOI);
    data
}

/// Generate a small repeating pattern free of marker bytes.
fn generate_pattern(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let pattern_len = rng.gen_range(4..=32);
    (0..pattern_len).map(|_| rng.gen_range(0x00..0xFF)).collect()
}

/// Check for SOI at the start and EOI at the end.
pub fn looks_like_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&SOI) && data.ends_with(&EOI)
}
