//! Chain, state, mempool, and persistence stores.

pub mod chain_store;
pub mod disk;
pub mod mempool;
pub mod state_store;

use crate::core::block::Block;
use crate::types::hash::Hash;
use std::collections::HashMap;

/// Bounded buffer for blocks whose parents have not arrived yet.
///
/// Keyed by the missing parent hash; when that parent is accepted the
/// waiters are drained and resubmitted. Overflow drops the oldest entry.
pub struct OrphanPool {
    by_parent: HashMap<Hash, Vec<Block>>,
    arrival: Vec<Hash>,
    capacity: usize,
    len: usize,
}

impl OrphanPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            by_parent: HashMap::new(),
            arrival: Vec::new(),
            capacity: capacity.max(1),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffers a block awaiting `parent`. Duplicate hashes are ignored.
    pub fn insert(&mut self, block: Block) {
        let parent = block.header.prev_hash;
        let hash = block.block_hash();

        let waiters = self.by_parent.entry(parent).or_default();
        if waiters.iter().any(|b| b.block_hash() == hash) {
            return;
        }
        waiters.push(block);
        self.arrival.push(parent);
        self.len += 1;

        while self.len > self.capacity {
            let oldest_parent = self.arrival.remove(0);
            if let Some(waiters) = self.by_parent.get_mut(&oldest_parent) {
                if !waiters.is_empty() {
                    waiters.remove(0);
                    self.len -= 1;
                }
                if waiters.is_empty() {
                    self.by_parent.remove(&oldest_parent);
                }
            }
        }
    }

    /// Removes and returns every block waiting on the given parent.
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };
        self.len -= children.len();
        self.arrival.retain(|p| p != parent);
        children
    }
}
