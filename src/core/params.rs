//! Protocol parameters and deterministic genesis derivation.
//!
//! Every value here is consensus-critical: all nodes of a network must agree
//! on the exact parameter set, and the handshake pins the resulting genesis
//! hash.

use crate::core::block::{Block, BlockHeader};
use crate::core::transaction::{Coinbase, Transaction};
use crate::crypto::key_pair::{PrivateKey, PublicKey};
use crate::storage::state_store::WorldState;
use crate::types::hash::Hash;
use crate::types::merkle_tree::MerkleTree;

/// Protocol version carried in block headers and handshakes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Target seconds between blocks.
pub const BLOCK_TIME_TARGET: u64 = 15;
/// Blocks between difficulty retargets.
pub const RETARGET_WINDOW: u64 = 100;
/// Maximum single-retarget adjustment factor (and its inverse).
pub const MAX_DIFFICULTY_ADJUSTMENT: f64 = 4.0;

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_BYTES: usize = 262_144;

/// Maximum post body length in Unicode scalar values.
pub const POST_BODY_LIMIT: usize = 300;
/// Maximum endorsement message length in Unicode scalar values.
pub const ENDORSE_MESSAGE_LIMIT: usize = 150;
/// Minimum gas fee accepted for any signed transaction.
pub const MIN_GAS_FEE: u64 = 1;

/// Block reward before any halving.
pub const INITIAL_REWARD: u64 = 50;
/// Blocks between reward halvings.
pub const HALVING_INTERVAL: u64 = 210_000;

/// Maximum number of transactions held by the mempool.
pub const MAX_MEMPOOL: usize = 10_000;

/// Maximum seconds a block timestamp may run ahead of wall clock.
pub const MAX_FUTURE_DRIFT: u64 = 120;
/// Number of trailing blocks whose timestamp median gates new blocks.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Difficulty of the genesis block.
pub const GENESIS_DIFFICULTY: u64 = 1;

/// Deepest reorganization the node will perform.
pub const MAX_REORG_DEPTH: u64 = 1_000;

/// Maximum blocks returned in a single sync response.
pub const SYNC_BATCH: u64 = 50;
/// Maximum peer connections.
pub const MAX_PEERS: usize = 50;
/// Maximum framed message size on the wire.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
/// Seconds allowed for a handshake to complete.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
/// Seconds between peer-exchange rounds.
pub const PEER_EXCHANGE_INTERVAL_SECS: u64 = 60;
/// Capacity of the recent-seen gossip caches.
pub const SEEN_CACHE_CAPACITY: usize = 65_536;

/// Default P2P listen port.
pub const DEFAULT_P2P_PORT: u16 = 9333;
/// Default RPC listen port.
pub const DEFAULT_RPC_PORT: u16 = 9332;

/// Computes the block reward at the given height using the halving schedule.
pub fn block_reward(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_REWARD >> halvings
}

/// Per-network genesis parameters.
///
/// Only the genesis recipient and timestamp vary between networks; all other
/// protocol constants are fixed above.
#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Account credited by the genesis coinbase.
    pub genesis_miner: PublicKey,
    /// Fixed genesis timestamp.
    pub genesis_timestamp: u64,
}

impl ChainParams {
    /// Parameters of the public network.
    pub fn mainnet() -> Self {
        // Published seed; part of the protocol definition.
        let signer = PrivateKey::from_bytes(&[
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c,
            0x1d, 0x1e, 0x1f, 0x20,
        ]);
        Self {
            genesis_miner: signer.public_key(),
            genesis_timestamp: 1_735_689_600,
        }
    }

    /// Parameters for local development and tests, crediting the given miner.
    pub fn dev(genesis_miner: PublicKey) -> Self {
        Self {
            genesis_miner,
            genesis_timestamp: 1_000_000,
        }
    }

    /// Builds the deterministic genesis block.
    ///
    /// The nonce is ground from zero, so every node derives bit-identical
    /// genesis bytes from the same parameters.
    pub fn build_genesis(&self) -> Block {
        let coinbase = Transaction::Coinbase(Coinbase {
            recipient: self.genesis_miner,
            amount: block_reward(0),
            height: 0,
        });

        let tx_root = MerkleTree::root(vec![coinbase.hash()]);
        let mut state = WorldState::new();
        state
            .apply_transaction(&coinbase, &self.genesis_miner, |_| None)
            .expect("genesis coinbase applies to an empty state");

        let mut header = BlockHeader {
            version: PROTOCOL_VERSION,
            height: 0,
            prev_hash: Hash::zero(),
            timestamp: self.genesis_timestamp,
            miner: self.genesis_miner,
            difficulty: GENESIS_DIFFICULTY,
            nonce: 0,
            tx_merkle_root: tx_root,
            state_root: state.state_root(),
            tx_count: 1,
        };

        while !Block::header_meets_difficulty(&header) {
            header.nonce += 1;
        }

        Block {
            header,
            transactions: vec![coinbase],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_halves_on_schedule() {
        assert_eq!(block_reward(0), 50);
        assert_eq!(block_reward(HALVING_INTERVAL - 1), 50);
        assert_eq!(block_reward(HALVING_INTERVAL), 25);
        assert_eq!(block_reward(2 * HALVING_INTERVAL), 12);
        assert_eq!(block_reward(3 * HALVING_INTERVAL), 6);
    }

    #[test]
    fn reward_is_zero_after_sixty_four_halvings() {
        assert_eq!(block_reward(64 * HALVING_INTERVAL), 0);
        assert_eq!(block_reward(u64::MAX), 0);
    }

    #[test]
    fn genesis_is_deterministic() {
        let params = ChainParams::mainnet();
        let a = params.build_genesis();
        let b = params.build_genesis();
        assert_eq!(a.block_hash(), b.block_hash());
        assert_eq!(a, b);
    }

    #[test]
    fn genesis_satisfies_its_own_difficulty() {
        let genesis = ChainParams::mainnet().build_genesis();
        assert!(genesis.meets_difficulty());
        assert_eq!(genesis.header.height, 0);
        assert_eq!(genesis.header.prev_hash, Hash::zero());
        assert_eq!(genesis.header.tx_count, 1);
    }

    #[test]
    fn genesis_commits_the_miner_reward() {
        let params = ChainParams::mainnet();
        let genesis = params.build_genesis();

        let mut state = WorldState::new();
        state
            .apply_transaction(&genesis.transactions[0], &params.genesis_miner, |_| None)
            .unwrap();
        assert_eq!(state.get(&params.genesis_miner).balance, 50);
        assert_eq!(genesis.header.state_root, state.state_root());
    }

    #[test]
    fn dev_params_differ_from_mainnet() {
        let miner = PrivateKey::from_bytes(&[9u8; 32]).public_key();
        let dev = ChainParams::dev(miner).build_genesis();
        let main = ChainParams::mainnet().build_genesis();
        assert_ne!(dev.block_hash(), main.block_hash());
    }
}
