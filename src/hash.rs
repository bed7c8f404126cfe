use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// number of bytes in a content identifier
pub const HASH_LEN: usize = 20;

/// 20-byte identifier used for blobs, trees and commits interchangeably
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// zero hash (useful as sentinel)
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// create from raw bytes
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// create from a byte slice, failing on length mismatch
    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != HASH_LEN {
            return Err(Error::InvalidArgument(format!(
                "hash must be {} bytes, got {}",
                HASH_LEN,
                bytes.len()
            )));
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// parse from hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidArgument(format!("invalid hash hex: {}", s)))?;
        Self::from_slice(&bytes)
    }

    /// get raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// SHA-1 digest of a byte sequence
    pub fn sha1_of(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// incremental SHA-1 hasher for streaming large overlay files
pub struct StreamingSha1 {
    hasher: Sha1,
}

impl StreamingSha1 {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    /// feed content bytes
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// finalize and return digest
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for StreamingSha1 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hex = "8e073e366ed82de6465d1209d3f07da7eebabb93";
        let hash = Hash::from_hex(hex).unwrap();
        assert_eq!(hash.to_hex(), hex);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Hash::from_hex("zzzz").is_err());
        assert!(Hash::from_hex("abcd").is_err());
        assert!(Hash::from_hex("8e073e366ed82de6465d1209d3f07da7eebabb9300").is_err());
    }

    #[test]
    fn test_sha1_of_known_vector() {
        // sha1("hello\n")
        let hash = Hash::sha1_of(b"hello\n");
        assert_eq!(hash.to_hex(), "f572d396fae9206628714fb2ce00f72e94f2258f");
    }

    #[test]
    fn test_sha1_of_empty() {
        let hash = Hash::sha1_of(b"");
        assert_eq!(hash.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut streaming = StreamingSha1::new();
        streaming.update(b"hel");
        streaming.update(b"lo\n");
        assert_eq!(streaming.finalize(), Hash::sha1_of(b"hello\n"));
    }

    #[test]
    fn test_ordering() {
        let a = Hash::from_hex("0000000000000000000000000000000000000001").unwrap();
        let b = Hash::from_hex("0000000000000000000000000000000000000002").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_debug_is_short() {
        let hash = Hash::sha1_of(b"x");
        let dbg = format!("{:?}", hash);
        assert!(dbg.starts_with("Hash("));
        assert_eq!(dbg.len(), "Hash(".len() + 12 + 1);
    }
}
