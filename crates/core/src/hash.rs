//! Region digests: a sampled additive checksum and SHA-256

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default number of tail bytes sampled per region by the fast digest
pub const SAMPLE_SIZE: u64 = 4096;

/// Cheap, collision-prone digest over a region's tail sample
pub type QuickDigest = i32;

/// Sum the bytes as signed 8-bit values into a wrapping 32-bit accumulator.
///
/// Collisions are expected; the slow digest catches them.
#[must_use]
pub fn quick_digest(sample: &[u8]) -> QuickDigest {
    sample
        .iter()
        .fold(0i32, |acc, &b| acc.wrapping_add(i32::from(b as i8)))
}

/// Byte window `(start, len)` the fast digest samples for a region:
/// the last `min(size, sample_size)` bytes.
#[must_use]
pub fn sample_window(offset: u64, size: u64, sample_size: u64) -> (u64, u64) {
    let len = size.min(sample_size);
    (offset + size - len, len)
}

/// SHA-256 of a region's full byte range
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlowDigest([u8; 32]);

impl SlowDigest {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Wrap an already computed digest
    #[must_use]
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    /// Digest of `len` zero bytes, as found in a freshly allocated file
    #[must_use]
    pub fn zeroed(len: u64) -> Self {
        const ZEROS: [u8; 64 * 1024] = [0u8; 64 * 1024];

        let mut hasher = Sha256::new();
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(ZEROS.len() as u64) as usize;
            hasher.update(&ZEROS[..n]);
            remaining -= n as u64;
        }
        Self(hasher.finalize().into())
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SlowDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "SlowDigest({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for SlowDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_digest_uses_signed_bytes() {
        assert_eq!(quick_digest(&[]), 0);
        assert_eq!(quick_digest(&[0u8; 4096]), 0);
        assert_eq!(quick_digest(&[1, 2, 3]), 6);
        // 0xFF is -1 as a signed byte
        assert_eq!(quick_digest(&[0xFF, 0xFF, 0x01]), -1);
    }

    #[test]
    fn test_quick_digest_collides_on_permutation() {
        assert_eq!(quick_digest(b"abc"), quick_digest(b"cba"));
        assert_ne!(SlowDigest::from_bytes(b"abc"), SlowDigest::from_bytes(b"cba"));
    }

    #[test]
    fn test_sample_window_takes_tail() {
        let region = 4_194_304;
        assert_eq!(
            sample_window(0, region, SAMPLE_SIZE),
            (region - SAMPLE_SIZE, SAMPLE_SIZE)
        );
        assert_eq!(
            sample_window(region, region, SAMPLE_SIZE),
            (2 * region - SAMPLE_SIZE, SAMPLE_SIZE)
        );
        // Short regions are sampled whole
        assert_eq!(sample_window(8, 100, SAMPLE_SIZE), (8, 100));
    }

    #[test]
    fn test_zeroed_matches_hashing_zero_buffer() {
        for len in [0u64, 1, 65_536, 100_000] {
            let buf = vec![0u8; len as usize];
            assert_eq!(SlowDigest::zeroed(len), SlowDigest::from_bytes(&buf));
        }
    }

    #[test]
    fn test_slow_digest_display_is_truncated() {
        let digest = SlowDigest::from_bytes(b"hello world");
        assert_eq!(digest.to_string().len(), 16);
        assert_eq!(digest.to_hex().len(), 64);
        assert_eq!(SlowDigest::from_raw(*digest.as_bytes()), digest);
    }
}
