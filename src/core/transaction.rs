//! Transaction kinds and content addressing.
//!
//! A transaction is content-addressed by the SHA-256 of its canonical
//! serialization with the signature field omitted; the same bytes are the
//! Ed25519 signing payload. Coinbases carry no signature and hash over all
//! of their fields, with `height` disambiguating otherwise-identical
//! rewards.

use crate::crypto::key_pair::{PrivateKey, PublicKey, TxSignature};
use crate::types::encoding::{canonical_bytes_unsigned, content_hash_unsigned};
use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};

/// A text post on the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Author's public key, also used for signature verification.
    pub author: PublicKey,
    /// Monotonic per-account transaction index.
    pub nonce: u64,
    /// Client-supplied creation time in Unix seconds.
    pub timestamp: u64,
    /// Post body, at most 300 Unicode scalar values.
    pub body: String,
    /// Content hash of the post being replied to, if any.
    pub reply_to: Option<Hash>,
    /// Fee paid to the including miner.
    pub gas_fee: u64,
    pub signature: TxSignature,
}

/// An endorsement of an existing post, optionally with a tip and message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorse {
    pub author: PublicKey,
    pub nonce: u64,
    /// Content hash of the endorsed post.
    pub target: Hash,
    /// Tip forwarded to the post author; may be zero.
    pub amount: u64,
    /// Optional message, at most 150 Unicode scalar values.
    pub message: String,
    pub gas_fee: u64,
    pub signature: TxSignature,
}

/// A token transfer between accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub sender: PublicKey,
    pub recipient: PublicKey,
    pub amount: u64,
    pub nonce: u64,
    pub gas_fee: u64,
    pub signature: TxSignature,
}

/// Block reward transaction. Validity comes from the block, not a signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coinbase {
    pub recipient: PublicKey,
    pub amount: u64,
    /// Height of the enclosing block.
    pub height: u64,
}

/// Discriminant for the four transaction kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxKind {
    Post,
    Endorse,
    Transfer,
    Coinbase,
}

/// A tagged transaction as it appears in blocks and on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tx_type", rename_all = "lowercase")]
pub enum Transaction {
    Post(Post),
    Endorse(Endorse),
    Transfer(Transfer),
    Coinbase(Coinbase),
}

impl Transaction {
    /// Content address: SHA-256 of the canonical form excluding the signature.
    pub fn hash(&self) -> Hash {
        content_hash_unsigned(self)
    }

    /// Bytes covered by the Ed25519 signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_bytes_unsigned(self)
    }

    pub fn kind(&self) -> TxKind {
        match self {
            Transaction::Post(_) => TxKind::Post,
            Transaction::Endorse(_) => TxKind::Endorse,
            Transaction::Transfer(_) => TxKind::Transfer,
            Transaction::Coinbase(_) => TxKind::Coinbase,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    /// The signing account, or `None` for coinbases.
    pub fn author(&self) -> Option<&PublicKey> {
        match self {
            Transaction::Post(tx) => Some(&tx.author),
            Transaction::Endorse(tx) => Some(&tx.author),
            Transaction::Transfer(tx) => Some(&tx.sender),
            Transaction::Coinbase(_) => None,
        }
    }

    /// The account nonce, or `None` for coinbases.
    pub fn nonce(&self) -> Option<u64> {
        match self {
            Transaction::Post(tx) => Some(tx.nonce),
            Transaction::Endorse(tx) => Some(tx.nonce),
            Transaction::Transfer(tx) => Some(tx.nonce),
            Transaction::Coinbase(_) => None,
        }
    }

    /// Fee paid to the including miner; zero for coinbases.
    pub fn gas_fee(&self) -> u64 {
        match self {
            Transaction::Post(tx) => tx.gas_fee,
            Transaction::Endorse(tx) => tx.gas_fee,
            Transaction::Transfer(tx) => tx.gas_fee,
            Transaction::Coinbase(_) => 0,
        }
    }

    /// Verifies the signature against the author's public key.
    ///
    /// Coinbases carry no signature and always fail this check; callers
    /// exclude them before verifying.
    pub fn verify_signature(&self) -> bool {
        let payload = self.signing_bytes();
        match self {
            Transaction::Post(tx) => tx.author.verify(&payload, &tx.signature),
            Transaction::Endorse(tx) => tx.author.verify(&payload, &tx.signature),
            Transaction::Transfer(tx) => tx.sender.verify(&payload, &tx.signature),
            Transaction::Coinbase(_) => false,
        }
    }
}

impl Post {
    /// Creates and signs a post transaction.
    pub fn signed(
        key: &PrivateKey,
        nonce: u64,
        timestamp: u64,
        body: impl Into<String>,
        reply_to: Option<Hash>,
        gas_fee: u64,
    ) -> Transaction {
        let mut tx = Transaction::Post(Post {
            author: key.public_key(),
            nonce,
            timestamp,
            body: body.into(),
            reply_to,
            gas_fee,
            signature: TxSignature([0u8; 64]),
        });
        let signature = key.sign(&tx.signing_bytes());
        if let Transaction::Post(post) = &mut tx {
            post.signature = signature;
        }
        tx
    }
}

impl Endorse {
    /// Creates and signs an endorsement transaction.
    pub fn signed(
        key: &PrivateKey,
        nonce: u64,
        target: Hash,
        amount: u64,
        message: impl Into<String>,
        gas_fee: u64,
    ) -> Transaction {
        let mut tx = Transaction::Endorse(Endorse {
            author: key.public_key(),
            nonce,
            target,
            amount,
            message: message.into(),
            gas_fee,
            signature: TxSignature([0u8; 64]),
        });
        let signature = key.sign(&tx.signing_bytes());
        if let Transaction::Endorse(endorse) = &mut tx {
            endorse.signature = signature;
        }
        tx
    }
}

impl Transfer {
    /// Creates and signs a transfer transaction.
    pub fn signed(
        key: &PrivateKey,
        recipient: PublicKey,
        amount: u64,
        nonce: u64,
        gas_fee: u64,
    ) -> Transaction {
        let mut tx = Transaction::Transfer(Transfer {
            sender: key.public_key(),
            recipient,
            amount,
            nonce,
            gas_fee,
            signature: TxSignature([0u8; 64]),
        });
        let signature = key.sign(&tx.signing_bytes());
        if let Transaction::Transfer(transfer) = &mut tx {
            transfer.signature = signature;
        }
        tx
    }
}
