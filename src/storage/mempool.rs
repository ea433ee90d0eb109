//! Mempool: bounded set of unconfirmed, individually-valid transactions.
//!
//! Entries are indexed by content hash and by `(author, nonce)`. A new
//! transaction at an occupied `(author, nonce)` slot replaces the holder
//! only with a strictly higher gas fee. At capacity the lowest-fee entry
//! (oldest first among equals) is evicted, and only for a strictly
//! higher-fee newcomer. Miners drain the pool highest-fee first while
//! never reordering an author's nonces.
//!
//! State validity is the caller's concern: the node validates against the
//! active tip before admission and re-validates the whole pool on every
//! tip change.

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use crate::core::validator::ValidationError;
use crate::crypto::key_pair::PublicKey;
use crate::types::hash::Hash;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct PoolEntry {
    tx: Transaction,
    /// Arrival counter; earlier entries win fee ties in mining order and
    /// lose them on eviction.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    txs: HashMap<Hash, PoolEntry>,
    /// Per-author nonce ladder mapping to entry hashes.
    by_author: HashMap<PublicKey, BTreeMap<u64, Hash>>,
    next_seq: u64,
}

/// Bounded fee-prioritized pool of pending transactions.
pub struct Mempool {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Bumped on every mutation; miners watch this to rebuild templates.
    revision: AtomicU64,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            revision: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotone counter observing any pool mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().unwrap().txs.contains_key(hash)
    }

    /// True when the author already has a pending entry at this nonce.
    pub fn has_pending(&self, author: &PublicKey, nonce: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .by_author
            .get(author)
            .map(|ladder| ladder.contains_key(&nonce))
            .unwrap_or(false)
    }

    /// The author's next open nonce: the confirmed nonce advanced past any
    /// contiguous pending entries. Admission accepts a transaction at this
    /// nonce (a continuation) or at an occupied slot (a fee replacement).
    pub fn next_open_nonce(&self, author: &PublicKey, confirmed_nonce: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        let Some(ladder) = inner.by_author.get(author) else {
            return confirmed_nonce;
        };
        let mut nonce = confirmed_nonce;
        while ladder.contains_key(&nonce) {
            nonce += 1;
        }
        nonce
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .txs
            .get(hash)
            .map(|entry| entry.tx.clone())
    }

    /// Admits a state-valid transaction, applying replace-by-fee and
    /// eviction policy. Returns the content hash on success.
    pub fn insert(&self, tx: Transaction) -> Result<Hash, ValidationError> {
        if tx.is_coinbase() {
            return Err(ValidationError::ConsensusViolation(
                "coinbase transactions cannot enter the mempool".into(),
            ));
        }
        let hash = tx.hash();
        let author = *tx.author().expect("non-coinbase has an author");
        let nonce = tx.nonce().expect("non-coinbase has a nonce");
        let fee = tx.gas_fee();

        let mut inner = self.inner.lock().unwrap();

        if inner.txs.contains_key(&hash) {
            return Err(ValidationError::LimitExceeded(
                "transaction already pending".into(),
            ));
        }

        // Replace-by-fee: an occupied (author, nonce) slot yields only to a
        // strictly higher fee.
        let displaced = match inner
            .by_author
            .get(&author)
            .and_then(|ladder| ladder.get(&nonce))
            .copied()
        {
            Some(holder_hash) => {
                let holder_fee = inner.txs[&holder_hash].tx.gas_fee();
                if fee <= holder_fee {
                    return Err(ValidationError::LimitExceeded(format!(
                        "replacement fee {fee} does not exceed pending fee {holder_fee}"
                    )));
                }
                Some(holder_hash)
            }
            None => None,
        };
        if let Some(holder_hash) = displaced {
            Self::remove_entry(&mut inner, &holder_hash);
        }

        if inner.txs.len() >= self.capacity {
            let lowest = inner
                .txs
                .iter()
                .min_by_key(|(_, entry)| (entry.tx.gas_fee(), entry.seq))
                .map(|(h, entry)| (*h, entry.tx.gas_fee()));
            match lowest {
                Some((victim, victim_fee)) if fee > victim_fee => {
                    Self::remove_entry(&mut inner, &victim);
                }
                _ => {
                    return Err(ValidationError::LimitExceeded(
                        "mempool full and fee too low for eviction".into(),
                    ));
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.txs.insert(hash, PoolEntry { tx, seq });
        inner
            .by_author
            .entry(author)
            .or_default()
            .insert(nonce, hash);

        self.revision.fetch_add(1, Ordering::Relaxed);
        Ok(hash)
    }

    fn remove_entry(inner: &mut Inner, hash: &Hash) -> Option<Transaction> {
        let entry = inner.txs.remove(hash)?;
        let author = *entry.tx.author().expect("pool holds no coinbases");
        let nonce = entry.tx.nonce().expect("pool holds no coinbases");
        if let Some(ladder) = inner.by_author.get_mut(&author) {
            ladder.remove(&nonce);
            if ladder.is_empty() {
                inner.by_author.remove(&author);
            }
        }
        Some(entry.tx)
    }

    /// Removes a single transaction by hash.
    pub fn remove(&self, hash: &Hash) -> Option<Transaction> {
        let removed = Self::remove_entry(&mut self.inner.lock().unwrap(), hash);
        if removed.is_some() {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Removes every transaction confirmed by the given block.
    pub fn remove_confirmed(&self, block: &Block) {
        let mut inner = self.inner.lock().unwrap();
        for tx in &block.transactions {
            Self::remove_entry(&mut inner, &tx.hash());
        }
        drop(inner);
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-validates the whole pool after a tip change; returns the removed
    /// hashes.
    ///
    /// Each author's ladder is walked in nonce order starting from the
    /// confirmed nonce. Entries that are stale, gapped, or rejected by the
    /// judge (insufficient balance, vanished references) are dropped, along
    /// with everything behind a newly created gap.
    pub fn revalidate(
        &self,
        confirmed_nonce: impl Fn(&PublicKey) -> u64,
        valid: impl Fn(&Transaction, u64) -> bool,
    ) -> Vec<Hash> {
        let mut inner = self.inner.lock().unwrap();
        let mut doomed = Vec::new();

        for (author, ladder) in &inner.by_author {
            let mut expected = confirmed_nonce(author);
            for (nonce, hash) in ladder {
                let tx = &inner.txs[hash].tx;
                if *nonce == expected && valid(tx, expected) {
                    expected += 1;
                } else {
                    doomed.push(*hash);
                }
            }
        }

        for hash in &doomed {
            Self::remove_entry(&mut inner, hash);
        }
        drop(inner);
        if !doomed.is_empty() {
            self.revision.fetch_add(1, Ordering::Relaxed);
        }
        doomed
    }

    /// Pending hashes ordered by fee, highest first.
    pub fn hashes_by_fee(&self) -> Vec<Hash> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<(u64, u64, Hash)> = inner
            .txs
            .iter()
            .map(|(hash, entry)| (entry.tx.gas_fee(), entry.seq, *hash))
            .collect();
        entries.sort_by_key(|(fee, seq, _)| (Reverse(*fee), *seq));
        entries.into_iter().map(|(_, _, hash)| hash).collect()
    }

    /// Transactions in miner selection order: highest fee first among each
    /// author's lowest pending nonce, so an author's nonces never appear
    /// out of order.
    pub fn select_ordered(&self) -> Vec<Transaction> {
        let inner = self.inner.lock().unwrap();

        #[derive(PartialEq, Eq)]
        struct Head {
            fee: u64,
            seq_rank: u64,
            author: PublicKey,
        }
        impl Ord for Head {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                (self.fee, self.seq_rank).cmp(&(other.fee, other.seq_rank))
            }
        }
        impl PartialOrd for Head {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut ladders: HashMap<PublicKey, Vec<(u64, Hash)>> = inner
            .by_author
            .iter()
            .map(|(author, ladder)| {
                let mut pairs: Vec<(u64, Hash)> =
                    ladder.iter().map(|(n, h)| (*n, *h)).collect();
                pairs.reverse();
                (*author, pairs)
            })
            .collect();

        let mut heap = BinaryHeap::new();
        for (author, ladder) in &ladders {
            if let Some((_, hash)) = ladder.last() {
                let entry = &inner.txs[hash];
                heap.push(Head {
                    fee: entry.tx.gas_fee(),
                    seq_rank: u64::MAX - entry.seq,
                    author: *author,
                });
            }
        }

        let mut ordered = Vec::with_capacity(inner.txs.len());
        while let Some(head) = heap.pop() {
            let ladder = ladders
                .get_mut(&head.author)
                .expect("heap heads track live ladders");
            let (_, hash) = ladder.pop().expect("heap heads track live ladders");
            ordered.push(inner.txs[&hash].tx.clone());

            if let Some((_, next_hash)) = ladder.last() {
                let entry = &inner.txs[next_hash];
                heap.push(Head {
                    fee: entry.tx.gas_fee(),
                    seq_rank: u64::MAX - entry.seq,
                    author: head.author,
                });
            }
        }
        ordered
    }
}
