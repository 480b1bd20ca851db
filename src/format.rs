//! Formats raw keys for log messages.

use itertools::Itertools as _;

/// Formats raw bytes as an escaped ASCII string. Freezer keys are opaque, so
/// this is the only rendering log messages get.
pub fn key(bytes: &[u8]) -> String {
    let escaped = bytes
        .iter()
        .copied()
        .flat_map(std::ascii::escape_default)
        .collect_vec();
    format!("\"{}\"", String::from_utf8_lossy(&escaped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_key() {
        assert_eq!(key(b"user:1"), "\"user:1\"");
    }

    #[test]
    fn test_binary_key_is_escaped() {
        assert_eq!(key(&[0x00, 0xff]), "\"\\x00\\xff\"");
    }
}
