use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// In `hashflow`, this serves two purposes:
/// 1. It is the identity of every node in the task graph. Two tasks with the
///    same definition always share a hash, and a hash never changes once
///    computed.
/// 2. It is the key under which a finished task's result is persisted in a
///    [`Storage`](crate::Storage), so that re-running an unchanged graph
///    recomputes nothing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Number of hex characters shown by [`Hash32::short`].
    pub const SHORT: usize = 6;

    /// Hashes a raw byte buffer.
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Hex prefix used in labels, logs and graph exports.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(Self::SHORT);
        hex
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Display for Hash32 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when parsing a [`Hash32`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected 64 hex characters, got {0:?}")]
pub struct ParseHashError(String);

impl FromStr for Hash32 {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 64 {
            return Err(ParseHashError(s.to_string()));
        }

        let nibble = |c: u8| -> Option<u8> {
            match c {
                b'0'..=b'9' => Some(c - b'0'),
                b'a'..=b'f' => Some(c - b'a' + 10),
                b'A'..=b'F' => Some(c - b'A' + 10),
                _ => None,
            }
        };

        let mut out = [0u8; 32];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            match (nibble(pair[0]), nibble(pair[1])) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => return Err(ParseHashError(s.to_string())),
            }
        }

        Ok(Hash32(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"hello");
        let parsed: Hash32 = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_short_prefix() {
        let hash = Hash32::hash(b"hello");
        assert_eq!(hash.short().len(), Hash32::SHORT);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("abc".parse::<Hash32>().is_err());
        assert!("zz".repeat(32).parse::<Hash32>().is_err());
    }
}
