//! Block store: the chain tree, cumulative work, and the canonical index.
//!
//! Every received valid block is stored and linked to its parent, forming a
//! tree rooted at genesis. The store tracks each block's cumulative work
//! (the sum of `2^difficulty` from genesis) and an insertion sequence used
//! as the first-seen tie-break. A separate canonical index tracks the
//! active branch: transaction and post lookups reflect only that branch and
//! are kept consistent as the fork-choice engine extends or pops it.

use crate::core::block::{Block, BlockHeader};
use crate::core::transaction::{Transaction, TxKind};
use crate::core::validator::{ChainView, ValidationError};
use crate::crypto::key_pair::PublicKey;
use crate::types::hash::Hash;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct StoredBlock {
    block: Arc<Block>,
    /// Σ 2^difficulty from genesis to this block, saturating.
    work: u128,
    /// Monotone arrival counter; lower wins on equal work.
    seq: u64,
}

/// Location of a confirmed transaction on the active branch.
#[derive(Clone, Copy, Debug)]
pub struct TxLocation {
    pub block_hash: Hash,
    pub height: u64,
    pub index: usize,
    pub kind: TxKind,
}

/// In-memory chain tree plus the canonical (active-branch) index.
pub struct ChainStore {
    blocks: HashMap<Hash, StoredBlock>,
    children: HashMap<Hash, Vec<Hash>>,
    /// Leaves of the tree; candidates for fork choice.
    tips: HashSet<Hash>,
    /// Active branch ordered by height; `canonical[0]` is genesis.
    canonical: Vec<Hash>,
    /// Confirmed transactions on the active branch.
    tx_index: HashMap<Hash, TxLocation>,
    /// Authors of confirmed posts on the active branch.
    post_authors: HashMap<Hash, PublicKey>,
    /// Blocks that failed full validation, with their descendants.
    invalid: HashSet<Hash>,
    genesis: Hash,
    next_seq: u64,
}

fn block_work(difficulty: u64) -> u128 {
    if difficulty >= 127 {
        u128::MAX
    } else {
        1u128 << difficulty
    }
}

impl ChainStore {
    /// Creates a store holding only the genesis block, already canonical.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.block_hash();
        let work = block_work(genesis.header.difficulty);
        let mut store = Self {
            blocks: HashMap::new(),
            children: HashMap::new(),
            tips: HashSet::from([hash]),
            canonical: Vec::new(),
            tx_index: HashMap::new(),
            post_authors: HashMap::new(),
            invalid: HashSet::new(),
            genesis: hash,
            next_seq: 0,
        };
        store.blocks.insert(
            hash,
            StoredBlock {
                block: Arc::new(genesis),
                work,
                seq: store.next_seq,
            },
        );
        store.next_seq += 1;
        store.push_canonical(hash);
        store
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn block(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.blocks.get(hash).map(|stored| stored.block.clone())
    }

    pub fn work(&self, hash: &Hash) -> Option<u128> {
        self.blocks.get(hash).map(|stored| stored.work)
    }

    pub fn is_invalid(&self, hash: &Hash) -> bool {
        self.invalid.contains(hash)
    }

    /// Height of the active tip.
    pub fn height(&self) -> u64 {
        (self.canonical.len() - 1) as u64
    }

    /// Hash of the active tip.
    pub fn tip_hash(&self) -> Hash {
        *self.canonical.last().expect("canonical chain is never empty")
    }

    pub fn tip_header(&self) -> BlockHeader {
        self.header(&self.tip_hash())
            .expect("tip block is always stored")
    }

    /// Canonical block hash at the given height.
    pub fn hash_at_height(&self, height: u64) -> Option<Hash> {
        self.canonical.get(height as usize).copied()
    }

    pub fn block_at_height(&self, height: u64) -> Option<Arc<Block>> {
        self.hash_at_height(height).and_then(|h| self.block(&h))
    }

    /// True when the block is on the active branch.
    pub fn is_canonical(&self, hash: &Hash) -> bool {
        self.blocks
            .get(hash)
            .map(|stored| {
                self.hash_at_height(stored.block.header.height) == Some(*hash)
            })
            .unwrap_or(false)
    }

    /// Inserts a block whose parent is already stored.
    ///
    /// The block becomes a tip candidate but does not join the canonical
    /// index until the fork-choice engine extends onto it.
    pub fn insert(&mut self, block: Block) -> Result<Arc<Block>, ValidationError> {
        let hash = block.block_hash();
        if self.blocks.contains_key(&hash) {
            return Err(ValidationError::ConsensusViolation(
                "block already stored".into(),
            ));
        }
        let parent_hash = block.header.prev_hash;
        let parent_work = self
            .blocks
            .get(&parent_hash)
            .map(|p| p.work)
            .ok_or(ValidationError::UnknownParent(parent_hash))?;

        let block = Arc::new(block);
        let work = parent_work.saturating_add(block_work(block.header.difficulty));
        self.blocks.insert(
            hash,
            StoredBlock {
                block: block.clone(),
                work,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
        self.children.entry(parent_hash).or_default().push(hash);
        self.tips.remove(&parent_hash);
        self.tips.insert(hash);
        Ok(block)
    }

    /// The tip with the greatest cumulative work; exact ties keep the
    /// first-observed block.
    pub fn best_tip(&self) -> Hash {
        let mut best = self.tip_hash();
        let mut best_key = {
            let stored = &self.blocks[&best];
            (stored.work, u64::MAX - stored.seq)
        };
        for hash in &self.tips {
            if self.invalid.contains(hash) {
                continue;
            }
            let stored = &self.blocks[hash];
            let key = (stored.work, u64::MAX - stored.seq);
            if key > best_key {
                best = *hash;
                best_key = key;
            }
        }
        best
    }

    /// Lowest common ancestor of two stored blocks.
    pub fn find_lca(&self, a: &Hash, b: &Hash) -> Option<Hash> {
        let mut a_header = self.header(a)?;
        let mut b_header = self.header(b)?;
        let mut a_hash = *a;
        let mut b_hash = *b;

        while a_header.height > b_header.height {
            a_hash = a_header.prev_hash;
            a_header = self.header(&a_hash)?;
        }
        while b_header.height > a_header.height {
            b_hash = b_header.prev_hash;
            b_header = self.header(&b_hash)?;
        }
        while a_hash != b_hash {
            a_hash = a_header.prev_hash;
            b_hash = b_header.prev_hash;
            a_header = self.header(&a_hash)?;
            b_header = self.header(&b_hash)?;
        }
        Some(a_hash)
    }

    /// Hashes on the path from `ancestor` (exclusive) to `descendant`
    /// (inclusive), in ascending height order.
    pub fn path_between(&self, ancestor: &Hash, descendant: &Hash) -> Option<Vec<Hash>> {
        let mut path = Vec::new();
        let mut cursor = *descendant;
        while cursor != *ancestor {
            let header = self.header(&cursor)?;
            path.push(cursor);
            if header.height == 0 {
                return None;
            }
            cursor = header.prev_hash;
        }
        path.reverse();
        Some(path)
    }

    /// Canonical hashes strictly above the given height, ascending.
    pub fn canonical_above(&self, height: u64) -> Vec<Hash> {
        self.canonical
            .iter()
            .skip(height as usize + 1)
            .copied()
            .collect()
    }

    /// Appends a stored block to the canonical index.
    ///
    /// The block's parent must be the current tip.
    pub fn extend_canonical(&mut self, hash: Hash) {
        let block = self
            .block(&hash)
            .expect("extend_canonical requires a stored block");
        assert_eq!(
            block.header.prev_hash,
            self.tip_hash(),
            "canonical extension must build on the active tip"
        );
        self.push_canonical(hash);
    }

    fn push_canonical(&mut self, hash: Hash) {
        let block = self.block(&hash).expect("push_canonical requires a stored block");
        let height = block.header.height;
        for (index, tx) in block.transactions.iter().enumerate() {
            let tx_hash = tx.hash();
            self.tx_index.insert(
                tx_hash,
                TxLocation {
                    block_hash: hash,
                    height,
                    index,
                    kind: tx.kind(),
                },
            );
            if let Transaction::Post(post) = tx {
                self.post_authors.insert(tx_hash, post.author);
            }
        }
        self.canonical.push(hash);
    }

    /// Removes the active tip from the canonical index and returns its hash.
    ///
    /// Genesis is never popped.
    pub fn pop_canonical(&mut self) -> Option<Hash> {
        if self.canonical.len() <= 1 {
            return None;
        }
        let hash = self.canonical.pop()?;
        if let Some(block) = self.block(&hash) {
            for tx in &block.transactions {
                let tx_hash = tx.hash();
                self.tx_index.remove(&tx_hash);
                self.post_authors.remove(&tx_hash);
            }
        }
        Some(hash)
    }

    /// Marks a block and every stored descendant invalid.
    pub fn mark_invalid(&mut self, hash: Hash) {
        let mut queue = vec![hash];
        while let Some(current) = queue.pop() {
            if !self.invalid.insert(current) {
                continue;
            }
            if let Some(children) = self.children.get(&current) {
                queue.extend(children.iter().copied());
            }
        }
    }

    /// Location of a confirmed transaction on the active branch.
    pub fn tx_location(&self, hash: &Hash) -> Option<TxLocation> {
        self.tx_index.get(hash).copied()
    }

    /// Resolves a confirmed transaction on the active branch.
    pub fn get_transaction(&self, hash: &Hash) -> Option<(Transaction, TxLocation)> {
        let location = self.tx_location(hash)?;
        let block = self.block(&location.block_hash)?;
        let tx = block.transactions.get(location.index)?.clone();
        Some((tx, location))
    }
}

impl ChainView for ChainStore {
    fn header(&self, hash: &Hash) -> Option<BlockHeader> {
        self.blocks.get(hash).map(|stored| stored.block.header.clone())
    }

    fn tx_kind(&self, hash: &Hash) -> Option<TxKind> {
        self.tx_index.get(hash).map(|location| location.kind)
    }

    fn post_author(&self, hash: &Hash) -> Option<PublicKey> {
        self.post_authors.get(hash).copied()
    }
}
