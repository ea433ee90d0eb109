//! Block and header structures with proof-of-work checks.

use crate::core::transaction::Transaction;
use crate::crypto::key_pair::PublicKey;
use crate::types::encoding::{canonical_bytes, content_hash};
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;
use serde::{Deserialize, Serialize};

/// Block header containing metadata and cryptographic commitments.
///
/// `block_hash` is the SHA-256 of the canonical header serialization with
/// all fields present, including the current proof-of-work nonce.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u8,
    /// Block index in the chain (genesis = 0).
    pub height: u64,
    /// Hash of the parent block; all-zero for genesis.
    pub prev_hash: Hash,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Public key credited by the coinbase and by all gas fees.
    pub miner: PublicKey,
    /// Required leading zero bits of the block hash.
    pub difficulty: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Merkle root over the ordered transaction content hashes.
    pub tx_merkle_root: Hash,
    /// Merkle root of the world state after applying this block.
    pub state_root: Hash,
    /// Number of transactions in the body.
    pub tx_count: u16,
}

impl BlockHeader {
    /// SHA-256 of the canonical header serialization.
    pub fn block_hash(&self) -> Hash {
        content_hash(self)
    }
}

/// A complete block: header plus ordered transaction body.
///
/// The first transaction must be a coinbase paying `header.miner`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }

    /// Computes the Merkle root over the body's transaction hashes.
    pub fn compute_tx_merkle_root(&self) -> Hash {
        let hashes = self.transactions.iter().map(Transaction::hash).collect();
        MerkleTree::root(hashes)
    }

    /// Serialized size of the whole block in canonical bytes.
    pub fn serialized_size(&self) -> usize {
        canonical_bytes(self).len()
    }

    /// Checks whether the block hash satisfies the difficulty target.
    ///
    /// The target is `2^(256 - difficulty)` interpreted big-endian, i.e. the
    /// hash must start with at least `difficulty` zero bits. Difficulties of
    /// 256 or more are unsatisfiable for any non-zero hash.
    pub fn meets_difficulty(&self) -> bool {
        Self::header_meets_difficulty(&self.header)
    }

    /// Difficulty check on a bare header; used while grinding nonces.
    pub fn header_meets_difficulty(header: &BlockHeader) -> bool {
        u64::from(header.block_hash().leading_zero_bits()) >= header.difficulty
    }
}
