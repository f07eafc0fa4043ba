//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes from the operating
//! system's entropy source, plus the truncated-geometric sampling used to
//! pace chaff transmissions.

use rand::{CryptoRng, Rng, RngCore};
use rand_core::OsRng;

/// Cryptographically secure random number generator.
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }

    /// Get an RNG instance that implements CryptoRng.
    pub fn rng() -> impl RngCore + CryptoRng {
        OsRng
    }
}

/// Sample a random integer in `[0, hi)`, approximately geometrically
/// distributed with expected value `expectation`.
///
/// Samples an exponential by inverse CDF and truncates at `hi`; the tail
/// mass collapses onto `hi - 1`, which is fine for timer pacing.
pub fn range_geom(hi: u64, expectation: u64) -> u64 {
    debug_assert!(hi > 0);
    let xv = expectation.max(1) as f64;
    let u: f64 = OsRng.gen_range(0.0..1.0);
    let sample = (-xv * (1.0 - u).ln()).floor();
    (sample as u64).min(hi - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_random_fill() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];

        SecureRandom::fill(&mut buf1);
        SecureRandom::fill(&mut buf2);

        assert!(!buf1.iter().all(|&b| b == 0));
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_range_geom_bounds() {
        for _ in 0..1000 {
            let v = range_geom(1_200_000, 1024);
            assert!(v < 1_200_000);
        }
    }

    #[test]
    fn test_range_geom_expectation_roughly_holds() {
        let n = 5000;
        let total: u64 = (0..n).map(|_| range_geom(u64::MAX / 2, 1000)).sum();
        let mean = total / n;
        // Loose bounds; the point is only that the knob works.
        assert!(mean > 200, "mean {} too small", mean);
        assert!(mean < 5000, "mean {} too large", mean);
    }

    #[test]
    fn test_range_geom_tiny_range() {
        for _ in 0..100 {
            assert_eq!(range_geom(1, 1000), 0);
        }
    }
}
