//! Splitting image bytes into bounded fragments.
//!
//! Chunks borrow from the input, so splitting never copies. Every chunk but
//! the last is exactly `max_payload` bytes; the last holds the remainder.

use crate::error::SplitError;
use crate::packet::MAX_PAYLOAD_LEN;

/// One chunk of the input together with its fragment index.
pub type Chunk<'a> = (u32, &'a [u8]);

/// Number of fragments needed for `len` bytes.
pub fn fragment_count(len: usize, max_payload: usize) -> usize {
    if max_payload == 0 {
        return 0;
    }
    len.div_ceil(max_payload)
}

/// Split `bytes` into ordered chunks of at most `max_payload` bytes.
///
/// # Returns
/// `ceil(len / max_payload)` chunks in ascending index order. Empty input
/// yields no chunks.
///
/// # Errors
/// - `SplitError::InvalidMaxPayload` if `max_payload` is 0 or above 65535
/// - `SplitError::TooLarge` if the input does not fit the u32 size field
/// - `SplitError::TooManyFragments` if the count does not fit in u32
pub fn split(bytes: &[u8], max_payload: usize) -> Result<Vec<Chunk<'_>>, SplitError> {
    if max_payload == 0 || max_payload > MAX_PAYLOAD_LEN {
        return Err(SplitError::InvalidMaxPayload(max_payload));
    }
    if u32::try_from(bytes.len()).is_err() {
        return Err(SplitError::TooLarge { len: bytes.len() });
    }
    if u32::try_from(fragment_count(bytes.len(), max_payload)).is_err() {
        return Err(SplitError::TooManyFragments { len: bytes.len() });
    }

    Ok(bytes
        .chunks(max_payload)
        .enumerate()
        .map(|(index, chunk)| (index as u32, chunk))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_split_exact_boundary() {
        let data = vec![0xCC; 400];
        let chunks = split(&data, 200).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, &data[..200]));
        assert_eq!(chunks[1], (1, &data[200..]));
    }

    #[test]
    fn test_split_remainder() {
        let data: Vec<u8> = (0..250).map(|i| i as u8).collect();
        let chunks = split(&data, 100).unwrap();

        let lens: Vec<usize> = chunks.iter().map(|(_, c)| c.len()).collect();
        assert_eq!(lens, vec![100, 100, 50]);
    }

    #[test]
    fn test_split_empty() {
        assert!(split(&[], 100).unwrap().is_empty());
    }

    #[test]
    fn test_split_invalid_max_payload() {
        assert_eq!(split(&[1], 0), Err(SplitError::InvalidMaxPayload(0)));
        assert_eq!(
            split(&[1], MAX_PAYLOAD_LEN + 1),
            Err(SplitError::InvalidMaxPayload(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_image_sized_split() {
        let data = vec![0u8; 150_000];
        assert_eq!(split(&data, 200).unwrap().len(), 750);
    }

    proptest! {
        #[test]
        fn proptest_split_reassembles(
            data in prop::collection::vec(any::<u8>(), 0..4096),
            max_payload in 1usize..512,
        ) {
            let chunks = split(&data, max_payload).unwrap();

            prop_assert_eq!(chunks.len(), data.len().div_ceil(max_payload));
            for (position, (index, chunk)) in chunks.iter().enumerate() {
                prop_assert_eq!(*index as usize, position);
                if position + 1 < chunks.len() {
                    prop_assert_eq!(chunk.len(), max_payload);
                }
            }

            let joined: Vec<u8> = chunks.iter().flat_map(|(_, c)| c.iter().copied()).collect();
            prop_assert_eq!(joined, data);
        }
    }
}
