use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::blocks::error::BlockStoreError;

/// A content identifier: the SHA-256 digest of an immutable block of data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    /// Compute the CID of the given block bytes.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded CID string.
    pub fn from_hex(s: &str) -> Result<Self, BlockStoreError> {
        if s.len() != 64 {
            return Err(BlockStoreError::InvalidCid(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }

        let bytes =
            hex::decode(s).map_err(|e| BlockStoreError::InvalidCid(format!("invalid hex: {e}")))?;

        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| BlockStoreError::InvalidCid("decoded to wrong length".into()))?;

        Ok(Self(arr))
    }

    /// Return the CID as a 64-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 2 hex characters (shard prefix for filesystem layout).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Remaining 62 hex characters (filename within shard).
    pub fn shard_suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_hex())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Cid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        let data = b"hello world";
        assert_eq!(Cid::compute(data), Cid::compute(data));
    }

    #[test]
    fn compute_differs_for_different_data() {
        assert_ne!(Cid::compute(b"hello"), Cid::compute(b"world"));
    }

    #[test]
    fn hex_round_trip() {
        let original = Cid::compute(b"test data");
        let parsed = Cid::from_hex(&original.to_hex()).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz";
        assert!(Cid::from_hex(bad).is_err());
    }

    #[test]
    fn shard_prefix_and_suffix() {
        let cid = Cid::compute(b"test");
        let hex = cid.to_hex();
        assert_eq!(cid.shard_prefix(), &hex[..2]);
        assert_eq!(cid.shard_suffix(), &hex[2..]);
    }

    #[test]
    fn serde_round_trip() {
        let cid = Cid::compute(b"serde test");
        let json = serde_json::to_string(&cid).unwrap();
        let parsed: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(cid, parsed);
    }
}
