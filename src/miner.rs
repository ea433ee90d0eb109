//! Block assembly and proof-of-work mining.
//!
//! A single logical worker per node: snapshot the active tip, assemble a
//! candidate body from the mempool against a speculative state, then grind
//! the nonce in batches. Between batches the worker refreshes the
//! timestamp and abandons the candidate if the tip moved, the mempool
//! changed, or shutdown was requested. Solved blocks go through the exact
//! same validation path as blocks received from peers.

use crate::core::block::{Block, BlockHeader};
use crate::core::params::{block_reward, MAX_BLOCK_BYTES, PROTOCOL_VERSION};
use crate::core::transaction::{Coinbase, Transaction};
use crate::core::validator::{
    expected_difficulty, min_timestamp_after, validate_tx, ChainView, PostOverlay,
};
use crate::crypto::key_pair::PublicKey;
use crate::node::{unix_now, Node};
use crate::types::encoding::canonical_bytes;
use crate::types::merkle_tree::MerkleTree;
use crate::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;

/// Nonce attempts per batch before re-checking for cancellation.
pub const HASH_BATCH: u64 = 1 << 20;

/// Bytes reserved for the header and body scaffolding when packing
/// transactions against the block size limit.
const BODY_SIZE_RESERVE: usize = 1024;

/// Assembles a mining candidate on the node's current tip.
///
/// Transactions are drawn in fee order (per-author nonce order preserved)
/// and re-validated against a speculative state that includes the coinbase
/// and every transaction packed so far; any that no longer fit are
/// skipped. The body is capped by the serialized block size limit.
pub fn build_template(node: &Node, miner: PublicKey) -> Block {
    node.snapshot(|chain, state| {
        let parent_hash = chain.tip_hash();
        let parent = chain
            .header(&parent_hash)
            .expect("tip header is always stored");
        let height = parent.height + 1;

        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: miner,
            amount: block_reward(height),
            height,
        });

        let mut working = state.state().clone();
        working
            .apply_transaction(&coinbase, &miner, |_| None)
            .expect("coinbase always applies");

        let mut overlay = PostOverlay::new(chain);
        let mut body = vec![coinbase.clone()];
        let mut size = canonical_bytes(&coinbase).len() + BODY_SIZE_RESERVE;

        for tx in node.mempool().select_ordered() {
            if validate_tx(&tx, &working, &overlay).is_err() {
                continue;
            }
            let tx_size = canonical_bytes(&tx).len() + 1;
            if size + tx_size > MAX_BLOCK_BYTES {
                break;
            }

            working
                .apply_transaction(&tx, &miner, |target| overlay.post_author(target))
                .expect("validated transactions apply");
            if let Transaction::Post(post) = &tx {
                overlay.add_post(tx.hash(), post.author);
            }
            size += tx_size;
            body.push(tx);
        }

        let timestamp = unix_now()
            .max(min_timestamp_after(chain, &parent_hash))
            .max(parent.timestamp + 1);

        let tx_hashes = body.iter().map(Transaction::hash).collect();
        Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                height,
                prev_hash: parent_hash,
                timestamp,
                miner,
                difficulty: expected_difficulty(chain, &parent_hash)
                    .expect("tip parent is known"),
                nonce: 0,
                tx_merkle_root: MerkleTree::root(tx_hashes),
                state_root: working.state_root(),
                tx_count: body.len() as u16,
            },
            transactions: body,
        }
    })
}

/// Grinds up to `max_iterations` nonces; true when the block now meets its
/// difficulty target.
pub fn solve(block: &mut Block, max_iterations: u64) -> bool {
    for _ in 0..max_iterations {
        if block.meets_difficulty() {
            return true;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    block.meets_difficulty()
}

/// The mining worker.
pub struct Miner {
    node: Arc<Node>,
    pubkey: PublicKey,
}

enum Grind {
    Solved(Block),
    Abandoned,
    Shutdown,
}

impl Miner {
    pub fn new(node: Arc<Node>, pubkey: PublicKey) -> Self {
        Self { node, pubkey }
    }

    /// Runs until the shutdown signal flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!("mining started for {}", self.pubkey);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let template = build_template(&self.node, self.pubkey);
            match self.grind(template, &shutdown).await {
                Grind::Solved(block) => {
                    let hash = block.block_hash();
                    let height = block.header.height;
                    match self.node.submit_block(block, None) {
                        Ok(_) => info!("mined block {hash} at height {height}"),
                        Err(err) => warn!("mined block {hash} rejected: {err}"),
                    }
                }
                Grind::Abandoned => continue,
                Grind::Shutdown => break,
            }
        }
        info!("mining stopped");
    }

    /// Hashes in batches on a blocking thread, abandoning the candidate on
    /// tip movement or mempool churn.
    async fn grind(&self, mut block: Block, shutdown: &watch::Receiver<bool>) -> Grind {
        let parent = block.header.prev_hash;
        let mempool_revision = self.node.mempool().revision();

        loop {
            let (solved, returned) = tokio::task::spawn_blocking(move || {
                let solved = solve(&mut block, HASH_BATCH);
                (solved, block)
            })
            .await
            .expect("mining batch task never panics");
            block = returned;

            if solved {
                return Grind::Solved(block);
            }
            if *shutdown.borrow() {
                return Grind::Shutdown;
            }
            if self.node.tip_info().0 != parent
                || self.node.mempool().revision() != mempool_revision
            {
                return Grind::Abandoned;
            }
            // Keep the candidate's clock current between batches
            block.header.timestamp = block.header.timestamp.max(unix_now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{ChainParams, MIN_GAS_FEE};
    use crate::core::transaction::{Post, Transfer};
    use crate::node::BlockOutcome;
    use crate::utils::test_utils::{key, GENESIS_KEY_SEED};

    fn dev_node() -> Arc<Node> {
        Node::open(ChainParams::dev(key(GENESIS_KEY_SEED).public_key()), None).unwrap()
    }

    #[test]
    fn template_mines_and_extends_chain() {
        let node = dev_node();
        let miner = key(GENESIS_KEY_SEED).public_key();

        let mut block = build_template(&node, miner);
        assert!(solve(&mut block, u64::MAX));
        assert_eq!(
            node.submit_block(block, None).unwrap(),
            BlockOutcome::Extended
        );
        assert_eq!(node.tip_info().1, 1);
        assert_eq!(node.get_account(&miner).balance, 100);
    }

    #[test]
    fn template_includes_mempool_transactions_by_fee() {
        let node = dev_node();
        let miner_key = key(GENESIS_KEY_SEED);
        let miner = miner_key.public_key();

        // Mine one block so the miner can fund two posters
        let mut b1 = build_template(&node, miner);
        solve(&mut b1, u64::MAX);
        node.submit_block(b1, None).unwrap();

        let alice = key(5);
        let bob = key(6);
        let t1 = Transfer::signed(&miner_key, alice.public_key(), 10, 0, 1);
        let t2 = Transfer::signed(&miner_key, bob.public_key(), 10, 1, 1);
        node.submit_transaction(t1, None).unwrap();
        node.submit_transaction(t2, None).unwrap();

        let mut b2 = build_template(&node, miner);
        solve(&mut b2, u64::MAX);
        assert_eq!(b2.transactions.len(), 3);
        node.submit_block(b2, None).unwrap();

        // Funded accounts can now post; higher fee first in the body
        let cheap = Post::signed(&alice, 0, 7_000, "cheap", None, MIN_GAS_FEE);
        let rich = Post::signed(&bob, 0, 7_000, "rich", None, 5);
        node.submit_transaction(cheap.clone(), None).unwrap();
        node.submit_transaction(rich.clone(), None).unwrap();

        let b3 = build_template(&node, miner);
        assert_eq!(b3.transactions[1].hash(), rich.hash());
        assert_eq!(b3.transactions[2].hash(), cheap.hash());
    }

    #[test]
    fn template_skips_transactions_invalid_against_speculative_state() {
        let node = dev_node();
        let miner_key = key(GENESIS_KEY_SEED);
        let miner = miner_key.public_key();

        let mut b1 = build_template(&node, miner);
        solve(&mut b1, u64::MAX);
        node.submit_block(b1, None).unwrap();

        // A transfer spending more than the recipient will have
        let alice = key(5);
        let fund = Transfer::signed(&miner_key, alice.public_key(), 5, 0, 1);
        node.submit_transaction(fund, None).unwrap();

        // Alice immediately tries to overspend; valid nonce but the
        // speculative balance (5) cannot cover 50
        let overspend = Transfer::signed(&alice, miner, 50, 0, 1);
        assert!(node.submit_transaction(overspend, None).is_err());

        let template = build_template(&node, miner);
        assert_eq!(template.transactions.len(), 2);
    }

    #[test]
    fn template_respects_parent_timestamp() {
        let node = dev_node();
        let miner = key(GENESIS_KEY_SEED).public_key();

        let mut b1 = build_template(&node, miner);
        solve(&mut b1, u64::MAX);
        let parent_ts = b1.header.timestamp;
        node.submit_block(b1, None).unwrap();

        let b2 = build_template(&node, miner);
        assert!(b2.header.timestamp > parent_ts);
    }

    #[test]
    fn solved_blocks_chain_over_multiple_heights() {
        let node = dev_node();
        let miner = key(GENESIS_KEY_SEED).public_key();

        for expected_height in 1..=5 {
            let mut block = build_template(&node, miner);
            assert!(solve(&mut block, u64::MAX));
            node.submit_block(block, None).unwrap();
            assert_eq!(node.tip_info().1, expected_height);
        }
        assert_eq!(node.get_account(&miner).balance, 6 * 50);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let node = dev_node();
        let miner = Miner::new(node.clone(), key(GENESIS_KEY_SEED).public_key());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(miner.run(rx));
        // Give the worker time to mine at least one block at difficulty 1
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(node.tip_info().1 >= 1);
    }
}
