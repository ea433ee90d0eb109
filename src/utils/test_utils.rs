//! Shared test helpers: deterministic keys, mock chain views, and block
//! construction with valid roots and proof of work.

use crate::core::block::{Block, BlockHeader};
use crate::core::params::{BLOCK_TIME_TARGET, PROTOCOL_VERSION};
use crate::core::transaction::{Coinbase, Transaction, TxKind};
use crate::core::validator::{expected_difficulty, ChainView};
use crate::crypto::key_pair::{PrivateKey, PublicKey};
use crate::storage::state_store::WorldState;
use crate::types::hash::Hash;
use std::collections::HashMap;

/// Seed of the key used as dev genesis miner throughout the tests.
pub const GENESIS_KEY_SEED: u8 = 42;

/// Deterministic private key from a one-byte seed.
pub fn key(seed: u8) -> PrivateKey {
    PrivateKey::from_bytes(&[seed; 32])
}

/// Grinds the nonce until the header meets its difficulty.
pub fn mine(block: &mut Block) {
    while !block.meets_difficulty() {
        block.header.nonce += 1;
    }
}

/// A wall-clock value safely after the block's timestamp.
pub fn now_after(block: &Block) -> u64 {
    block.header.timestamp + 1
}

/// Hand-rolled chain view for validator tests.
pub struct MockChain {
    headers: HashMap<Hash, BlockHeader>,
    by_height: Vec<Hash>,
    txs: HashMap<Hash, (TxKind, Option<PublicKey>)>,
}

impl MockChain {
    pub fn empty() -> Self {
        Self {
            headers: HashMap::new(),
            by_height: Vec::new(),
            txs: HashMap::new(),
        }
    }

    /// A view containing the given genesis block and its transactions.
    pub fn from_genesis(genesis: &Block) -> Self {
        let mut chain = Self::empty();
        chain.push_block(genesis);
        chain
    }

    /// Registers a confirmed transaction for reference checks.
    pub fn add_tx(&mut self, hash: Hash, kind: TxKind, author: Option<PublicKey>) {
        self.txs.insert(hash, (kind, author));
    }

    /// Indexes a block's header and transactions.
    pub fn push_block(&mut self, block: &Block) {
        let hash = block.block_hash();
        self.headers.insert(hash, block.header.clone());
        self.by_height.push(hash);
        for tx in &block.transactions {
            let author = match tx {
                Transaction::Post(post) => Some(post.author),
                _ => None,
            };
            self.txs.insert(tx.hash(), (tx.kind(), author));
        }
    }

    /// A chain of `count` headers spaced `interval` seconds apart.
    pub fn with_linear_chain(count: u64, difficulty: u64, interval: u64) -> Self {
        Self::build(count, difficulty, |i| 1_000_000 + i * interval)
    }

    /// A chain of `count` headers at a fractional per-block cadence.
    pub fn with_cadence(count: u64, difficulty: u64, secs_per_block: f64) -> Self {
        Self::build(count, difficulty, |i| {
            1_000_000 + (i as f64 * secs_per_block) as u64
        })
    }

    fn build(count: u64, difficulty: u64, timestamp_at: impl Fn(u64) -> u64) -> Self {
        let mut chain = Self::empty();
        let mut prev_hash = Hash::zero();
        for height in 0..count {
            let header = BlockHeader {
                version: PROTOCOL_VERSION,
                height,
                prev_hash,
                timestamp: timestamp_at(height),
                miner: key(GENESIS_KEY_SEED).public_key(),
                difficulty,
                nonce: 0,
                tx_merkle_root: Hash::zero(),
                state_root: Hash::zero(),
                tx_count: 0,
            };
            let hash = header.block_hash();
            prev_hash = hash;
            chain.headers.insert(hash, header);
            chain.by_height.push(hash);
        }
        chain
    }

    pub fn hash_at(&self, height: u64) -> Hash {
        self.by_height[height as usize]
    }
}

impl ChainView for MockChain {
    fn header(&self, hash: &Hash) -> Option<BlockHeader> {
        self.headers.get(hash).cloned()
    }

    fn tx_kind(&self, hash: &Hash) -> Option<TxKind> {
        self.txs.get(hash).map(|(kind, _)| *kind)
    }

    fn post_author(&self, hash: &Hash) -> Option<PublicKey> {
        self.txs.get(hash).and_then(|(_, author)| *author)
    }
}

/// Builds a fully valid child block: coinbase first, correct roots,
/// expected difficulty, a timestamp past the parent, and ground-in proof
/// of work. The provided transactions must already be state-valid.
pub fn build_block(
    parent: &Block,
    parent_state: &WorldState,
    view: &dyn ChainView,
    miner: &PrivateKey,
    txs: Vec<Transaction>,
) -> Block {
    let height = parent.header.height + 1;
    let miner_key = miner.public_key();
    let coinbase = Transaction::Coinbase(Coinbase {
        recipient: miner_key,
        amount: crate::core::params::block_reward(height),
        height,
    });

    let mut body = Vec::with_capacity(txs.len() + 1);
    body.push(coinbase);
    body.extend(txs);

    let mut working = parent_state.clone();
    let mut new_posts: HashMap<Hash, PublicKey> = HashMap::new();
    for tx in &body {
        working
            .apply_transaction(tx, &miner_key, |target| {
                new_posts
                    .get(target)
                    .copied()
                    .or_else(|| view.post_author(target))
            })
            .expect("test transactions must apply cleanly");
        if let Transaction::Post(post) = tx {
            new_posts.insert(tx.hash(), post.author);
        }
    }

    let tx_hashes = body.iter().map(Transaction::hash).collect();
    let mut block = Block {
        header: BlockHeader {
            version: PROTOCOL_VERSION,
            height,
            prev_hash: parent.block_hash(),
            timestamp: parent.header.timestamp + BLOCK_TIME_TARGET,
            miner: miner_key,
            difficulty: expected_difficulty(view, &parent.block_hash())
                .expect("parent is known to the view"),
            nonce: 0,
            tx_merkle_root: crate::types::merkle_tree::MerkleTree::root(tx_hashes),
            state_root: working.state_root(),
            tx_count: body.len() as u16,
        },
        transactions: body,
    };
    mine(&mut block);
    block
}
