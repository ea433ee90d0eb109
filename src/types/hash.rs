//! 32-byte SHA-256 hash type with zero-allocation operations.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte hash used throughout the chain.
///
/// This type is `Copy` for performance - hashes are passed frequently during
/// block validation and should live on the stack to avoid heap allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Creates a zero-valued hash (all bytes are 0x00).
    ///
    /// Used as the `prev_hash` of the genesis block.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    /// Returns the hash as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`HASH_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Hash> {
        if slice.len() != HASH_LEN {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(slice);
        Some(Hash(bytes))
    }

    /// Parses a hash from a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Option<Hash> {
        let bytes = hex::decode(s).ok()?;
        Hash::from_slice(&bytes)
    }

    /// Computes the SHA-256 hash of the given bytes.
    pub fn sha256(data: &[u8]) -> Hash {
        let mut h = Hash::builder();
        h.update(data);
        h.finalize()
    }

    /// Creates a new SHA-256 hash builder for incremental hashing.
    pub fn builder() -> HashBuilder {
        HashBuilder::new()
    }

    /// Number of leading zero bits, interpreting the hash big-endian.
    ///
    /// A hash with `n` leading zero bits is strictly below `2^(256 - n)`,
    /// which is the proof-of-work predicate for difficulty `n`.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).ok_or_else(|| D::Error::custom("expected 64 hex characters"))
    }
}

/// Incremental SHA-256 hash builder.
///
/// Allows feeding data in chunks and finalizing to produce a [`Hash`].
pub struct HashBuilder {
    hasher: Sha256,
}

impl HashBuilder {
    /// Creates a new empty hash builder.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Feeds data into the hash computation.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn chain(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Consumes the builder and returns the final hash.
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        // SHA-256 of the empty string
        let empty = Hash::sha256(b"");
        assert_eq!(
            empty.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn builder_matches_one_shot() {
        let one_shot = Hash::sha256(b"hello world");
        let incremental = Hash::builder().chain(b"hello ").chain(b"world").finalize();
        assert_eq!(one_shot, incremental);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_none());
        assert!(Hash::from_slice(&[0u8; 33]).is_none());
        assert!(Hash::from_slice(&[0u8; 32]).is_some());
    }

    #[test]
    fn hex_roundtrip() {
        let hash = Hash::sha256(b"roundtrip");
        let parsed = Hash::from_hex(&hash.to_string()).expect("valid hex");
        assert_eq!(hash, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let hash = Hash::sha256(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn serde_rejects_bad_hex() {
        assert!(serde_json::from_str::<Hash>("\"zz\"").is_err());
        assert!(serde_json::from_str::<Hash>("\"abcd\"").is_err());
    }

    #[test]
    fn leading_zero_bits_zero_hash() {
        assert_eq!(Hash::zero().leading_zero_bits(), 256);
    }

    #[test]
    fn leading_zero_bits_counts_partial_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0b0001_0000;
        assert_eq!(Hash(bytes).leading_zero_bits(), 3);

        let mut bytes = [0u8; 32];
        bytes[1] = 0b1000_0000;
        assert_eq!(Hash(bytes).leading_zero_bits(), 8);
    }
}
