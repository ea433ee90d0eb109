//! Cryptographic primitives: Ed25519 keys and signatures.

pub mod key_pair;
