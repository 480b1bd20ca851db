use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Rolling CRC-64 over the records of a sub-database file. The checksum is
/// order-insensitive (XOR of per-record digests) so deletions can be folded
/// back out without replaying the whole file.
pub struct Hasher {
    rolling_checksum: u64,
    crc64: Crc<u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hasher")
            .field("rolling_checksum", &self.rolling_checksum)
            .finish()
    }
}

impl Hasher {
    /// Creates a new `Hasher` with an initial rolling checksum.
    pub fn new() -> Self {
        Self {
            rolling_checksum: 0,
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
        }
    }

    /// Folds a key/value record into the rolling checksum. Folding the same
    /// record twice cancels it out.
    pub fn update(&mut self, key: &[u8], value: &[u8]) {
        let key_checksum = self.crc64.checksum(key);
        let value_checksum = self.crc64.checksum(value);
        self.rolling_checksum ^= key_checksum ^ value_checksum;
    }

    /// Returns the current rolling checksum.
    pub fn value(&self) -> u64 {
        self.rolling_checksum
    }

    /// Resets the rolling checksum to its initial state.
    pub fn reset(&mut self) {
        self.rolling_checksum = 0;
    }

    /// One-shot digest of a single buffer, used for payload trailers.
    pub fn digest(buf: &[u8]) -> u64 {
        Crc::<u64>::new(&CRC_64_ECMA).checksum(buf)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_checksum() {
        let mut hasher = Hasher::new();

        hasher.update(b"key1", b"value1");
        let single_step_checksum = hasher.value();

        // Folding the same record again cancels it out
        hasher.update(b"key1", b"value1");
        assert_eq!(hasher.value(), 0);

        // And folding once more restores it
        hasher.update(b"key1", b"value1");
        assert_eq!(hasher.value(), single_step_checksum);
    }

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(Hasher::digest(b"payload"), Hasher::digest(b"payload"));
        assert_ne!(Hasher::digest(b"payload"), Hasher::digest(b"payloae"));
    }
}
