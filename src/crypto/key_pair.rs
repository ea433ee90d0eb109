//! Ed25519 key pairs and signatures.
//!
//! Accounts are identified by their raw 32-byte Ed25519 public key. The
//! [`PublicKey`] type stores the raw bytes; point validation happens inside
//! [`PublicKey::verify`], so keys that never sign anything are just opaque
//! identifiers.

use crate::info;
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305,
};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::{OsRng, RngCore};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use zeroize::Zeroizing;

/// Public key length in bytes.
pub const PUBKEY_LEN: usize = 32;
/// Signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Raw 32-byte Ed25519 public key identifying an account.
///
/// This type is `Copy` - keys are passed frequently during validation and
/// stack allocation avoids heap overhead and improves cache locality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; PUBKEY_LEN]);

impl PublicKey {
    /// Returns the key as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a key from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`PUBKEY_LEN`].
    pub fn from_slice(slice: &[u8]) -> Option<PublicKey> {
        if slice.len() != PUBKEY_LEN {
            return None;
        }
        let mut bytes = [0u8; PUBKEY_LEN];
        bytes.copy_from_slice(slice);
        Some(PublicKey(bytes))
    }

    /// Parses a public key from a hex string.
    pub fn from_hex(s: &str) -> Option<PublicKey> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }

    /// Verifies an Ed25519 signature over `data`.
    ///
    /// Returns `false` when the bytes do not form a valid curve point or the
    /// signature does not verify.
    pub fn verify(&self, data: &[u8], signature: &TxSignature) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = Signature::from_bytes(&signature.0);
        key.verify_strict(data, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).ok_or_else(|| D::Error::custom("expected 64 hex characters"))
    }
}

/// Detached 64-byte Ed25519 signature carried inside transactions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TxSignature(pub [u8; SIGNATURE_LEN]);

impl TxSignature {
    pub fn from_slice(slice: &[u8]) -> Option<TxSignature> {
        if slice.len() != SIGNATURE_LEN {
            return None;
        }
        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes.copy_from_slice(slice);
        Some(TxSignature(bytes))
    }
}

impl fmt::Display for TxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxSignature({})", self)
    }
}

impl Serialize for TxSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        TxSignature::from_slice(&bytes).ok_or_else(|| D::Error::custom("expected 128 hex characters"))
    }
}

/// Private key for signing transactions.
///
/// Generated using cryptographically secure randomness from the OS.
/// Never serialized or transmitted over the network in the clear.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::generate(&mut rng),
        }
    }

    /// Creates a private key from raw seed bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    /// Returns the raw bytes of the private key.
    ///
    /// Handle with care: zeroize after use, never log or transmit.
    fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.verifying_key().to_bytes())
    }

    /// Signs arbitrary data, producing an Ed25519 signature.
    pub fn sign(&self, data: &[u8]) -> TxSignature {
        TxSignature(self.key.sign(data).to_bytes())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encrypted Key Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Magic bytes identifying a node key file.
const KEY_FILE_MAGIC: &[u8; 4] = b"AGKY";

/// Current version of the key file format.
const KEY_FILE_VERSION: u8 = 1;

/// Length of the Argon2id salt in bytes.
const SALT_LEN: usize = 32;

/// Length of the XChaCha20-Poly1305 nonce in bytes.
const NONCE_LEN: usize = 24;

/// Derives a 32-byte encryption key from a passphrase and salt using Argon2id.
fn derive_key(passphrase: &[u8], salt: &[u8]) -> io::Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, salt, key.as_mut())
        .map_err(|e| io::Error::other(format!("argon2 key derivation failed: {e}")))?;
    Ok(key)
}

/// Encrypts and saves a node private key to disk.
///
/// File format: `[4B magic][1B version][32B salt][24B nonce][ciphertext+16B tag]`
fn save_encrypted_key(key: &PrivateKey, path: &Path, passphrase: &[u8]) -> io::Result<()> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let derived = derive_key(passphrase, &salt)?;
    let cipher = XChaCha20Poly1305::new(derived.as_ref().into());

    let plaintext = Zeroizing::new(key.to_bytes());
    let ciphertext = cipher
        .encrypt(nonce.as_ref().into(), plaintext.as_ref())
        .map_err(|e| io::Error::other(format!("encryption failed: {e}")))?;

    let mut data = Vec::with_capacity(4 + 1 + SALT_LEN + NONCE_LEN + ciphertext.len());
    data.extend_from_slice(KEY_FILE_MAGIC);
    data.push(KEY_FILE_VERSION);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &data)?;

    info!("Node key saved to {}", path.display());
    Ok(())
}

/// Loads and decrypts a node private key from disk.
///
/// Returns an error if the file is corrupt, the passphrase is wrong, or the
/// format version is unsupported.
fn load_encrypted_key(path: &Path, passphrase: &[u8]) -> io::Result<PrivateKey> {
    let data = fs::read(path)?;

    const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN;
    if data.len() < HEADER_LEN + 16 {
        return Err(io::Error::other("node key file too short"));
    }
    if &data[0..4] != KEY_FILE_MAGIC {
        return Err(io::Error::other("invalid node key file magic"));
    }
    if data[4] != KEY_FILE_VERSION {
        return Err(io::Error::other(format!(
            "unsupported node key file version: {}",
            data[4]
        )));
    }

    let salt = &data[5..5 + SALT_LEN];
    let nonce = &data[5 + SALT_LEN..5 + SALT_LEN + NONCE_LEN];
    let ciphertext = &data[HEADER_LEN..];

    let derived = derive_key(passphrase, salt)?;
    let cipher = XChaCha20Poly1305::new(derived.as_ref().into());

    let plaintext = cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| io::Error::other("decryption failed: wrong passphrase or corrupt file"))?;

    if plaintext.len() != 32 {
        return Err(io::Error::other("decrypted key has invalid length"));
    }

    let mut key_bytes = Zeroizing::new([0u8; 32]);
    key_bytes.copy_from_slice(&plaintext);

    Ok(PrivateKey::from_bytes(&key_bytes))
}

/// Loads an existing node key or generates a new one.
///
/// If the key file exists, it is decrypted with the passphrase and returned.
/// If it does not exist, a new random key is generated, encrypted, and saved.
pub fn load_or_generate_key(path: &Path, passphrase: &[u8]) -> io::Result<PrivateKey> {
    if path.exists() {
        info!("Loading node key from {}", path.display());
        load_encrypted_key(path, passphrase)
    } else {
        info!("Generating new node key");
        let key = PrivateKey::generate();
        save_encrypted_key(&key, path, passphrase)?;
        Ok(key)
    }
}
