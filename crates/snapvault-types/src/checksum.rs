use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SnapError};

const PREFIX: &str = "sha256:";

/// A SHA-256 digest rendered as `sha256:<64 hex chars>`.
///
/// This is the on-wire checksum format of every durable document and the
/// session body. Stored as the full prefixed string so serde round-trips
/// are byte-identical with existing remotes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(format!("{PREFIX}{}", hex::encode(Sha256::digest(data))))
    }

    /// Parse and validate a prefixed digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| SnapError::Integrity(format!("checksum missing '{PREFIX}' prefix: '{s}'")))?;
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SnapError::Integrity(format!("malformed sha256 digest: '{s}'")));
        }
        Ok(Checksum(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_input() {
        let sum = Checksum::of_bytes(b"");
        assert_eq!(
            sum.as_str(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn parse_accepts_own_output() {
        let sum = Checksum::of_bytes(b"snapvault");
        assert_eq!(Checksum::parse(sum.as_str()).unwrap(), sum);
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(Checksum::parse("md5:abcd").is_err());
        assert!(Checksum::parse("sha256:xyz").is_err());
        assert!(Checksum::parse("sha256:deadbeef").is_err()); // too short
    }

    #[test]
    fn serde_round_trip_is_transparent() {
        let sum = Checksum::of_bytes(b"abc");
        let json = serde_json::to_string(&sum).unwrap();
        assert_eq!(json, format!("\"{}\"", sum.as_str()));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sum);
    }
}
