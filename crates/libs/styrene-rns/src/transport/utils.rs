//! Small helpers shared by the announce engine and path-request engine:
//! random blob/tag generation and emission-timebase encoding.

use rand_core::{CryptoRngCore, RngCore};

/// Builds a fresh 10-byte announce random blob with the current emission
/// timebase encoded at offset `[5..10)` (§3, §GLOSSARY "Random blob"). Bytes
/// `[0..5)` are left to the codec (key/name-hash derived) and are zeroed here;
/// callers that already hold codec-produced bytes should only use
/// [`stamp_emission_timebase`].
pub fn new_random_blob<R: CryptoRngCore>(mut rng: R, now: u64) -> [u8; 10] {
    let mut blob = [0u8; 10];
    rng.fill_bytes(&mut blob[..5]);
    stamp_emission_timebase(&mut blob, now);
    blob
}

/// Overwrites the 40-bit emission timebase field of an existing random blob,
/// leaving the codec-owned prefix bytes untouched.
pub fn stamp_emission_timebase(blob: &mut [u8; 10], now: u64) {
    let be = now.to_be_bytes();
    blob[5..10].copy_from_slice(&be[3..8]);
}

/// 16 random bytes used as a path-request discovery tag when the caller
/// doesn't already have one (§4.6).
pub fn new_path_request_tag<R: CryptoRngCore>(mut rng: R) -> [u8; 16] {
    let mut tag = [0u8; 16];
    rng.fill_bytes(&mut tag);
    tag
}

/// Draws a uniform jitter in `[0, max)` seconds for announce retransmit
/// scheduling (`PATHFINDER_RW`, §4.5 step 5).
pub fn uniform_jitter<R: CryptoRngCore>(mut rng: R, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    let fraction = (rng.next_u32() as f64) / (u32::MAX as f64);
    fraction * max
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn random_blob_encodes_emission_timebase() {
        let blob = new_random_blob(OsRng, 1_700_000_000);
        assert_eq!(super::super::tables::emission_timebase(&blob), 1_700_000_000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..32 {
            let value = uniform_jitter(OsRng, 0.5);
            assert!((0.0..0.5).contains(&value));
        }
    }
}
