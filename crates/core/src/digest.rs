//! Content digests.
//!
//! Registry content is addressed by SHA-256. On the wire a digest is the
//! string `sha256:<64 lowercase hex chars>`; internally it is 32 raw bytes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// The algorithm prefix every wire-format digest carries.
const DIGEST_PREFIX: &str = "sha256:";

/// A SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the digest of a byte slice.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher for streamed content.
    pub fn hasher() -> DigestHasher {
        DigestHasher(Sha256::new())
    }

    /// Parse a wire-format digest (`sha256:<hex>`).
    pub fn parse(s: &str) -> crate::Result<Self> {
        let hex = s
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| crate::Error::InvalidDigest(format!("missing sha256 prefix: {s}")))?;
        if hex.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Whether a string looks like a wire-format digest.
    ///
    /// Used to decide if a manifest reference is a digest or a tag before
    /// attempting a strict parse.
    pub fn looks_like_digest(s: &str) -> bool {
        s.starts_with(DIGEST_PREFIX)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as lowercase hex, without the algorithm prefix.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DIGEST_PREFIX}{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", &self.to_hex()[..16])
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 digest state for streamed uploads.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known test vector: sha256("hello")
    const HELLO_DIGEST: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn compute_matches_known_vector() {
        assert_eq!(Digest::compute(b"hello").to_string(), HELLO_DIGEST);
    }

    #[test]
    fn parse_round_trips() {
        let digest = Digest::parse(HELLO_DIGEST).unwrap();
        assert_eq!(digest.to_string(), HELLO_DIGEST);
        assert_eq!(digest, Digest::compute(b"hello"));
    }

    #[test]
    fn parse_rejects_missing_prefix() {
        let err = Digest::parse(&"a".repeat(64)).unwrap_err();
        assert!(err.to_string().contains("missing sha256 prefix"));
    }

    #[test]
    fn parse_rejects_short_hex() {
        assert!(Digest::parse("sha256:abcd").is_err());
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = format!("sha256:{}", "z".repeat(64));
        assert!(Digest::parse(&bad).is_err());
    }

    #[test]
    fn incremental_hasher_matches_oneshot() {
        let mut hasher = Digest::hasher();
        hasher.update(b"hel");
        hasher.update(b"lo");
        assert_eq!(hasher.finalize(), Digest::compute(b"hello"));
    }

    #[test]
    fn serde_round_trip() {
        let digest = Digest::compute(b"hello");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{HELLO_DIGEST}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
