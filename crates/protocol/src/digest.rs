//! Fixed-width tree-hash digest type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 tree hash (leaf, intermediate node or root).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; DIGEST_LEN]);

/// Error returned when a hex digest cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    #[error("expected {expected} hex chars, got {actual}")]
    Length { expected: usize, actual: usize },

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl TreeHash {
    /// Wraps raw digest bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Parses a 64-character hex string (either case).
    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestParseError::Length {
                expected: DIGEST_LEN * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Encodes as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for TreeHash {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for TreeHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TreeHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let hash = TreeHash::from_bytes([0xab; DIGEST_LEN]);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(TreeHash::from_hex(&hex).unwrap(), hash);
        assert_eq!(TreeHash::from_hex(&hex.to_uppercase()).unwrap(), hash);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = TreeHash::from_hex("abcd").unwrap_err();
        assert!(matches!(err, DigestParseError::Length { actual: 4, .. }));
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "zz".repeat(DIGEST_LEN);
        assert!(matches!(
            TreeHash::from_hex(&bad).unwrap_err(),
            DigestParseError::Hex(_)
        ));
    }

    #[test]
    fn serializes_as_hex_string() {
        let hash = TreeHash::from_bytes([1; DIGEST_LEN]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(DIGEST_LEN)));
        let parsed: TreeHash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn debug_is_abbreviated() {
        let hash = TreeHash::from_bytes([0xff; DIGEST_LEN]);
        assert_eq!(format!("{hash:?}"), "TreeHash(ffffffffffffffff)");
    }
}
