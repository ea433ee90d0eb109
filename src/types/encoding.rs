//! Canonical serialization for hashing, signing, and the wire.
//!
//! Every hash and signature in the protocol is computed over the same
//! deterministic encoding: a JSON object with keys sorted in code-point
//! order, no whitespace, integers as plain decimals, byte fields as
//! lowercase hex strings, and absent references as `null`. Two nodes that
//! hold structurally equal values must produce identical bytes.
//!
//! `serde_json`'s map type is backed by a `BTreeMap`, so re-serializing
//! through `serde_json::Value` yields sorted keys regardless of struct
//! field order; compact output contains no whitespace.

use crate::types::hash::Hash;
use serde::Serialize;

/// Field name stripped when computing content hashes and signing payloads.
const SIGNATURE_FIELD: &str = "signature";

/// Serializes a value to canonical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let value = serde_json::to_value(value).expect("protocol types serialize infallibly");
    serde_json::to_vec(&value).expect("canonical JSON encoding cannot fail")
}

/// Serializes a value to canonical bytes with the `signature` field removed.
///
/// The field is omitted entirely (not set to `null`); values that carry no
/// signature encode identically through both functions.
pub fn canonical_bytes_unsigned<T: Serialize>(value: &T) -> Vec<u8> {
    let mut value = serde_json::to_value(value).expect("protocol types serialize infallibly");
    if let serde_json::Value::Object(map) = &mut value {
        map.remove(SIGNATURE_FIELD);
    }
    serde_json::to_vec(&value).expect("canonical JSON encoding cannot fail")
}

/// SHA-256 over the canonical encoding of a value.
pub fn content_hash<T: Serialize>(value: &T) -> Hash {
    Hash::sha256(&canonical_bytes(value))
}

/// SHA-256 over the canonical encoding with the `signature` field removed.
pub fn content_hash_unsigned<T: Serialize>(value: &T) -> Hash {
    Hash::sha256(&canonical_bytes_unsigned(value))
}
