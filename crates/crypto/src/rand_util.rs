//! CSPRNG helpers over the process-wide OS entropy source.

use rand::distributions::uniform::{SampleRange, SampleUniform};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Fill `buf` with cryptographically secure random bytes.
pub fn rand_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Random value in `range`, e.g. `rand_in_range(1..=255u8)`.
pub fn rand_in_range<T, R>(range: R) -> T
where
    T: SampleUniform,
    R: SampleRange<T>,
{
    OsRng.gen_range(range)
}

/// Random nonzero u32, for message IDs and tunnel IDs where zero is reserved.
pub fn rand_u32_nonzero() -> u32 {
    rand_in_range(1..=u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rand_in_range_bounds() {
        for _ in 0..100 {
            let v: u8 = rand_in_range(10..20);
            assert!((10..20).contains(&v));
        }
    }

    #[test]
    fn test_rand_u32_nonzero() {
        for _ in 0..100 {
            assert_ne!(rand_u32_nonzero(), 0);
        }
    }
}
