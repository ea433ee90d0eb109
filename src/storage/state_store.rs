//! World state: the account map, its Merkle commitment, and rewind support.
//!
//! The state store keeps the account map at the active tip plus one undo
//! record per recent canonical block. Rewinding restores the exact state
//! that existed immediately after the destination block, so a rewind
//! followed by re-application reproduces byte-identical state roots.

use crate::core::account::Account;
use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::core::validator::ValidationError;
use crate::crypto::key_pair::PublicKey;
use crate::types::encoding::canonical_bytes;
use crate::types::hash::Hash;
use crate::types::merkle_tree::{MerkleTree, ProofStep};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Total mapping from public key to account record.
///
/// Only materialized accounts contribute leaves to the state root; absent
/// keys read as zero accounts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    accounts: BTreeMap<PublicKey, Account>,
}

/// Canonical state leaf preimage: `(pubkey, balance, nonce)`.
#[derive(Serialize)]
struct StateLeaf<'a> {
    pubkey: &'a PublicKey,
    balance: u64,
    nonce: u64,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an account; absent keys behave as `{balance: 0, nonce: 0}`.
    pub fn get(&self, pubkey: &PublicKey) -> Account {
        self.accounts.get(pubkey).copied().unwrap_or_default()
    }

    /// Returns the materialized account, if any.
    pub fn get_existing(&self, pubkey: &PublicKey) -> Option<Account> {
        self.accounts.get(pubkey).copied()
    }

    /// Inserts or replaces an account record.
    pub fn set(&mut self, pubkey: PublicKey, account: Account) {
        self.accounts.insert(pubkey, account);
    }

    /// Number of materialized accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Sum of all balances; used by supply-invariant checks.
    pub fn total_supply(&self) -> u128 {
        self.accounts.values().map(|a| a.balance as u128).sum()
    }

    fn entry(&mut self, pubkey: &PublicKey) -> &mut Account {
        self.accounts.entry(*pubkey).or_default()
    }

    /// Applies a single transaction. Assumes it was already validated;
    /// arithmetic is still checked and surfaces as an error rather than
    /// corrupting state.
    ///
    /// `resolve_author` maps an endorsed post hash to its author for tip
    /// payout; unresolvable targets forfeit the tip (the fee still moves).
    pub fn apply_transaction(
        &mut self,
        tx: &Transaction,
        miner: &PublicKey,
        resolve_author: impl Fn(&Hash) -> Option<PublicKey>,
    ) -> Result<(), ValidationError> {
        match tx {
            Transaction::Coinbase(coinbase) => {
                self.entry(&coinbase.recipient).credit(coinbase.amount)?;
            }
            Transaction::Post(post) => {
                let author = self.entry(&post.author);
                author.debit(post.gas_fee)?;
                author.bump_nonce();
                self.entry(miner).credit(post.gas_fee)?;
            }
            Transaction::Endorse(endorse) => {
                let author = self.entry(&endorse.author);
                author.debit(endorse.gas_fee + endorse.amount)?;
                author.bump_nonce();
                self.entry(miner).credit(endorse.gas_fee)?;
                if endorse.amount > 0 {
                    if let Some(target_author) = resolve_author(&endorse.target) {
                        self.entry(&target_author).credit(endorse.amount)?;
                    }
                }
            }
            Transaction::Transfer(transfer) => {
                let sender = self.entry(&transfer.sender);
                sender.debit(transfer.amount + transfer.gas_fee)?;
                sender.bump_nonce();
                self.entry(&transfer.recipient).credit(transfer.amount)?;
                self.entry(miner).credit(transfer.gas_fee)?;
            }
        }
        Ok(())
    }

    /// Merkle root over `(pubkey, balance, nonce)` leaves sorted by pubkey.
    ///
    /// An empty state commits to `SHA-256("")`.
    pub fn state_root(&self) -> Hash {
        MerkleTree::root(self.leaf_hashes())
    }

    fn leaf_hashes(&self) -> Vec<Hash> {
        self.accounts
            .iter()
            .map(|(pubkey, account)| {
                Hash::sha256(&canonical_bytes(&StateLeaf {
                    pubkey,
                    balance: account.balance,
                    nonce: account.nonce,
                }))
            })
            .collect()
    }

    /// Merkle inclusion proof for the given account leaf.
    ///
    /// Returns the leaf hash and its sibling path; `None` when the account
    /// was never materialized.
    pub fn account_proof(&self, pubkey: &PublicKey) -> Option<(Hash, Vec<ProofStep>)> {
        let index = self.accounts.keys().position(|k| k == pubkey)?;
        let leaves = self.leaf_hashes();
        let proof = MerkleTree::proof(&leaves, index)?;
        Some((leaves[index], proof))
    }
}

/// Keys a transaction may touch, in application order.
fn touched_keys(tx: &Transaction, miner: &PublicKey, resolve: &dyn Fn(&Hash) -> Option<PublicKey>) -> Vec<PublicKey> {
    match tx {
        Transaction::Coinbase(coinbase) => vec![coinbase.recipient],
        Transaction::Post(post) => vec![post.author, *miner],
        Transaction::Endorse(endorse) => {
            let mut keys = vec![endorse.author, *miner];
            if endorse.amount > 0 {
                if let Some(author) = resolve(&endorse.target) {
                    keys.push(author);
                }
            }
            keys
        }
        Transaction::Transfer(transfer) => {
            vec![transfer.sender, transfer.recipient, *miner]
        }
    }
}

/// Pre-image of every account a block touched: `None` marks an account that
/// did not exist before the block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub prev: Vec<(PublicKey, Option<Account>)>,
}

/// World state at the active tip plus undo records for recent blocks.
pub struct StateStore {
    state: WorldState,
    undo: HashMap<Hash, UndoRecord>,
}

impl StateStore {
    pub fn new(state: WorldState) -> Self {
        Self {
            state,
            undo: HashMap::new(),
        }
    }

    /// Rebuilds a store from persisted state and undo records.
    pub fn restore(state: WorldState, undo: HashMap<Hash, UndoRecord>) -> Self {
        Self { state, undo }
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn root(&self) -> Hash {
        self.state.state_root()
    }

    pub fn undo_record(&self, block_hash: &Hash) -> Option<&UndoRecord> {
        self.undo.get(block_hash)
    }

    /// Applies a validated block atomically, recording an undo record.
    ///
    /// Returns the new state root. On any application error the state is
    /// restored from the partial undo record before returning.
    pub fn apply_block(
        &mut self,
        block: &Block,
        resolve_author: impl Fn(&Hash) -> Option<PublicKey>,
    ) -> Result<Hash, ValidationError> {
        let miner = block.header.miner;
        let mut record = UndoRecord::default();
        let mut recorded: BTreeSet<PublicKey> = BTreeSet::new();

        let result = (|| {
            for tx in &block.transactions {
                for key in touched_keys(tx, &miner, &|h| resolve_author(h)) {
                    if recorded.insert(key) {
                        record.prev.push((key, self.state.get_existing(&key)));
                    }
                }
                self.state.apply_transaction(tx, &miner, &resolve_author)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            Self::unwind(&mut self.state, &record);
            return Err(err);
        }

        self.undo.insert(block.block_hash(), record);
        Ok(self.state.state_root())
    }

    /// Rewinds the most recently applied block using its undo record.
    ///
    /// The caller is responsible for rewinding in reverse application
    /// order; undo records only compose in that order.
    pub fn rewind_block(&mut self, block_hash: &Hash) -> Result<(), ValidationError> {
        let record = self.undo.remove(block_hash).ok_or_else(|| {
            ValidationError::ConsensusViolation(format!("no undo record for block {block_hash}"))
        })?;
        Self::unwind(&mut self.state, &record);
        Ok(())
    }

    fn unwind(state: &mut WorldState, record: &UndoRecord) {
        // Each key is recorded once, at first touch
        for (key, prev) in record.prev.iter().rev() {
            match prev {
                Some(account) => state.set(*key, *account),
                // Never materialized before this block; drop the record
                None => {
                    state.accounts.remove(key);
                }
            }
        }
    }

    /// Drops undo records for block hashes not retained by the caller;
    /// returns the dropped hashes.
    pub fn prune_undo(&mut self, retain: impl Fn(&Hash) -> bool) -> Vec<Hash> {
        let dropped: Vec<Hash> = self
            .undo
            .keys()
            .filter(|hash| !retain(hash))
            .copied()
            .collect();
        for hash in &dropped {
            self.undo.remove(hash);
        }
        dropped
    }

    /// Clones the undo map for persistence.
    pub fn undo_records(&self) -> &HashMap<Hash, UndoRecord> {
        &self.undo
    }
}
