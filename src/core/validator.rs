//! Transaction and block validation rules.
//!
//! Both entry points are pure given a read-only view of prior state and
//! chain metadata: [`validate_tx`] gates mempool admission, and
//! [`validate_block`] performs the full consensus check sequence, replaying
//! the body against a working copy of the parent state. Difficulty and
//! timestamp context is computed along the block's own branch, so headers
//! extending side chains validate before any reorganization.

use crate::core::block::{Block, BlockHeader};
use crate::core::params::{
    block_reward, BLOCK_TIME_TARGET, ENDORSE_MESSAGE_LIMIT, MAX_BLOCK_BYTES,
    MAX_DIFFICULTY_ADJUSTMENT, MAX_FUTURE_DRIFT, MEDIAN_TIME_SPAN, MIN_GAS_FEE, POST_BODY_LIMIT,
    PROTOCOL_VERSION, RETARGET_WINDOW,
};
use crate::core::transaction::{Transaction, TxKind};
use crate::crypto::key_pair::PublicKey;
use crate::storage::state_store::WorldState;
use crate::types::hash::Hash;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Which side of the expected nonce a mismatch fell on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonceFault {
    /// Nonce already consumed by a confirmed transaction.
    Stale,
    /// Nonce skips ahead of the account's next expected value.
    FutureGap,
}

/// Categorical validation failures surfaced to RPC callers and peers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("nonce mismatch ({fault:?}): got {got}, expected {expected}")]
    NonceMismatch {
        fault: NonceFault,
        got: u64,
        expected: u64,
    },

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("gas fee {0} below minimum")]
    FeeBelowMinimum(u64),

    #[error("referenced transaction not found: {0}")]
    ReferenceNotFound(Hash),

    #[error("referenced transaction is not a post")]
    ReferenceWrongKind,

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("consensus violation: {0}")]
    ConsensusViolation(String),

    #[error("unknown parent block: {0}")]
    UnknownParent(Hash),

    #[error("reorganization depth {0} exceeds limit")]
    ReorgTooDeep(u64),

    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),
}

impl ValidationError {
    fn consensus(msg: impl Into<String>) -> Self {
        ValidationError::ConsensusViolation(msg.into())
    }
}

/// Read-only chain metadata consulted during validation.
///
/// `header` resolves any stored block; `tx_kind` and `post_author` reflect
/// only the active branch, which the fork-choice engine keeps consistent
/// while re-applying blocks.
pub trait ChainView {
    fn header(&self, hash: &Hash) -> Option<BlockHeader>;
    fn tx_kind(&self, hash: &Hash) -> Option<TxKind>;
    fn post_author(&self, hash: &Hash) -> Option<PublicKey>;
}

/// Chain view extended with posts confirmed earlier in the block being
/// validated or assembled, so intra-block replies and endorsements resolve.
pub struct PostOverlay<'a> {
    base: &'a dyn ChainView,
    new_posts: HashMap<Hash, PublicKey>,
}

impl<'a> PostOverlay<'a> {
    pub fn new(base: &'a dyn ChainView) -> Self {
        Self {
            base,
            new_posts: HashMap::new(),
        }
    }

    pub fn add_post(&mut self, hash: Hash, author: PublicKey) {
        self.new_posts.insert(hash, author);
    }
}

impl ChainView for PostOverlay<'_> {
    fn header(&self, hash: &Hash) -> Option<BlockHeader> {
        self.base.header(hash)
    }

    fn tx_kind(&self, hash: &Hash) -> Option<TxKind> {
        if self.new_posts.contains_key(hash) {
            return Some(TxKind::Post);
        }
        self.base.tx_kind(hash)
    }

    fn post_author(&self, hash: &Hash) -> Option<PublicKey> {
        self.new_posts
            .get(hash)
            .copied()
            .or_else(|| self.base.post_author(hash))
    }
}

/// Validates a single non-coinbase transaction against prior state.
///
/// Checks, in order: structural limits, signature, fee floor, nonce
/// continuity, balance coverage of all debits, and reference resolution for
/// `reply_to` and endorsement targets.
pub fn validate_tx(
    tx: &Transaction,
    state: &WorldState,
    view: &dyn ChainView,
) -> Result<(), ValidationError> {
    let expected_nonce = tx
        .author()
        .map(|author| state.get(author).nonce)
        .unwrap_or(0);
    validate_tx_with_expected(tx, state, view, expected_nonce)
}

/// [`validate_tx`] with an explicit expected nonce.
///
/// Mempool admission and revalidation pass the author's next open slot,
/// so queued transactions may continue past the confirmed nonce; block
/// validation always uses the running state's nonce.
pub fn validate_tx_with_expected(
    tx: &Transaction,
    state: &WorldState,
    view: &dyn ChainView,
    expected_nonce: u64,
) -> Result<(), ValidationError> {
    let account = match tx {
        Transaction::Coinbase(_) => {
            return Err(ValidationError::consensus(
                "coinbase transactions are only valid inside a block",
            ));
        }
        _ => state.get(tx.author().expect("non-coinbase has an author")),
    };

    validate_format(tx)?;

    if !tx.verify_signature() {
        return Err(ValidationError::InvalidSignature);
    }

    let nonce = tx.nonce().expect("non-coinbase has a nonce");
    if nonce != expected_nonce {
        let fault = if nonce < expected_nonce {
            NonceFault::Stale
        } else {
            NonceFault::FutureGap
        };
        return Err(ValidationError::NonceMismatch {
            fault,
            got: nonce,
            expected: expected_nonce,
        });
    }

    let needed = total_debit(tx)?;
    if account.balance < needed {
        return Err(ValidationError::InsufficientBalance {
            needed,
            available: account.balance,
        });
    }

    match tx {
        Transaction::Post(post) => {
            if let Some(reply_to) = post.reply_to {
                match view.tx_kind(&reply_to) {
                    None => return Err(ValidationError::ReferenceNotFound(reply_to)),
                    Some(TxKind::Post) => {}
                    Some(_) => return Err(ValidationError::ReferenceWrongKind),
                }
            }
        }
        Transaction::Endorse(endorse) => match view.tx_kind(&endorse.target) {
            None => return Err(ValidationError::ReferenceNotFound(endorse.target)),
            Some(TxKind::Post) => {}
            Some(_) => return Err(ValidationError::ReferenceWrongKind),
        },
        _ => {}
    }

    Ok(())
}

/// Sum of every debit a transaction imposes on its author.
fn total_debit(tx: &Transaction) -> Result<u64, ValidationError> {
    let overflow = || ValidationError::consensus("debit amount overflows");
    match tx {
        Transaction::Post(post) => Ok(post.gas_fee),
        Transaction::Endorse(endorse) => {
            endorse.gas_fee.checked_add(endorse.amount).ok_or_else(overflow)
        }
        Transaction::Transfer(transfer) => {
            transfer.gas_fee.checked_add(transfer.amount).ok_or_else(overflow)
        }
        Transaction::Coinbase(_) => Ok(0),
    }
}

/// Structural checks independent of state.
fn validate_format(tx: &Transaction) -> Result<(), ValidationError> {
    match tx {
        Transaction::Post(post) => {
            if post.body.is_empty() {
                return Err(ValidationError::MalformedEncoding(
                    "post body must be non-empty".into(),
                ));
            }
            if post.body.chars().count() > POST_BODY_LIMIT {
                return Err(ValidationError::LimitExceeded(format!(
                    "post body exceeds {POST_BODY_LIMIT} characters"
                )));
            }
            if post.gas_fee < MIN_GAS_FEE {
                return Err(ValidationError::FeeBelowMinimum(post.gas_fee));
            }
        }
        Transaction::Endorse(endorse) => {
            if endorse.message.chars().count() > ENDORSE_MESSAGE_LIMIT {
                return Err(ValidationError::LimitExceeded(format!(
                    "endorsement message exceeds {ENDORSE_MESSAGE_LIMIT} characters"
                )));
            }
            if endorse.gas_fee < MIN_GAS_FEE {
                return Err(ValidationError::FeeBelowMinimum(endorse.gas_fee));
            }
        }
        Transaction::Transfer(transfer) => {
            if transfer.sender == transfer.recipient {
                return Err(ValidationError::MalformedEncoding(
                    "sender and recipient must differ".into(),
                ));
            }
            if transfer.amount == 0 {
                return Err(ValidationError::MalformedEncoding(
                    "transfer amount must be positive".into(),
                ));
            }
            if transfer.gas_fee < MIN_GAS_FEE {
                return Err(ValidationError::FeeBelowMinimum(transfer.gas_fee));
            }
        }
        Transaction::Coinbase(_) => {}
    }
    Ok(())
}

/// Validates coinbase structure against the enclosing block.
fn validate_coinbase(
    tx: &Transaction,
    header: &BlockHeader,
) -> Result<(), ValidationError> {
    let Transaction::Coinbase(coinbase) = tx else {
        return Err(ValidationError::consensus(
            "first transaction must be a coinbase",
        ));
    };
    if coinbase.height != header.height {
        return Err(ValidationError::consensus("coinbase height mismatch"));
    }
    let expected = block_reward(header.height);
    if coinbase.amount != expected {
        return Err(ValidationError::consensus(format!(
            "coinbase amount {} != expected reward {expected}",
            coinbase.amount
        )));
    }
    if coinbase.recipient != header.miner {
        return Err(ValidationError::consensus(
            "coinbase recipient must match block miner",
        ));
    }
    Ok(())
}

/// Computes the expected difficulty for a child of `parent_hash`.
///
/// Heights that are not a retarget boundary inherit the parent's
/// difficulty. At a boundary the window `[height-100, height-1]` is walked
/// along the parent chain and the adjustment ratio is clamped to
/// `[1/4, 4]`.
pub fn expected_difficulty(
    view: &dyn ChainView,
    parent_hash: &Hash,
) -> Result<u64, ValidationError> {
    let parent = view
        .header(parent_hash)
        .ok_or(ValidationError::UnknownParent(*parent_hash))?;
    let height = parent.height + 1;

    if height % RETARGET_WINDOW != 0 {
        return Ok(parent.difficulty);
    }

    // Walk back to the window start along this branch.
    let mut cursor = parent.clone();
    for _ in 0..(RETARGET_WINDOW - 1) {
        cursor = view
            .header(&cursor.prev_hash)
            .ok_or(ValidationError::UnknownParent(cursor.prev_hash))?;
    }
    if cursor.height + RETARGET_WINDOW != height {
        return Err(ValidationError::consensus("broken retarget window walk"));
    }

    let actual = parent.timestamp.saturating_sub(cursor.timestamp).max(1);
    let expected = RETARGET_WINDOW * BLOCK_TIME_TARGET;

    let ratio = (expected as f64 / actual as f64)
        .clamp(1.0 / MAX_DIFFICULTY_ADJUSTMENT, MAX_DIFFICULTY_ADJUSTMENT);
    let new_difficulty = (parent.difficulty as f64 * ratio).round() as u64;
    Ok(new_difficulty.max(1))
}

/// Timestamps of up to [`MEDIAN_TIME_SPAN`] ancestors, ending at `from`.
fn recent_timestamps(view: &dyn ChainView, from: &Hash) -> Vec<u64> {
    let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
    let mut cursor = *from;
    while times.len() < MEDIAN_TIME_SPAN {
        let Some(header) = view.header(&cursor) else {
            break;
        };
        times.push(header.timestamp);
        if header.height == 0 {
            break;
        }
        cursor = header.prev_hash;
    }
    times
}

/// True when `timestamp` strictly exceeds the median of `times`.
///
/// Even-length medians average the two middle values; the comparison is
/// done at double scale to stay in integers.
fn exceeds_median(timestamp: u64, times: &mut Vec<u64>) -> bool {
    if times.is_empty() {
        return true;
    }
    times.sort_unstable();
    let n = times.len();
    if n % 2 == 1 {
        timestamp > times[n / 2]
    } else {
        2 * (timestamp as u128) > times[n / 2 - 1] as u128 + times[n / 2] as u128
    }
}

/// Smallest timestamp a child of `parent` may carry under the median rule.
pub fn min_timestamp_after(view: &dyn ChainView, parent: &Hash) -> u64 {
    let mut times = recent_timestamps(view, parent);
    if times.is_empty() {
        return 0;
    }
    times.sort_unstable();
    let n = times.len();
    if n % 2 == 1 {
        times[n / 2] + 1
    } else {
        ((times[n / 2 - 1] as u128 + times[n / 2] as u128) / 2) as u64 + 1
    }
}

/// Contextual header checks: linkage, difficulty, timestamps, proof of work.
///
/// These are exactly the checks that need chain metadata but no account
/// state, so they run for side-branch blocks on arrival.
pub fn validate_header(
    header: &BlockHeader,
    view: &dyn ChainView,
    now: u64,
) -> Result<(), ValidationError> {
    if header.version != PROTOCOL_VERSION {
        return Err(ValidationError::consensus(format!(
            "unsupported version {}",
            header.version
        )));
    }

    let parent = view
        .header(&header.prev_hash)
        .ok_or(ValidationError::UnknownParent(header.prev_hash))?;

    if header.height != parent.height + 1 {
        return Err(ValidationError::consensus(format!(
            "height {} does not follow parent height {}",
            header.height, parent.height
        )));
    }

    let expected = expected_difficulty(view, &header.prev_hash)?;
    if header.difficulty != expected {
        return Err(ValidationError::consensus(format!(
            "difficulty {} != expected {expected}",
            header.difficulty
        )));
    }

    let mut recent = recent_timestamps(view, &header.prev_hash);
    if !exceeds_median(header.timestamp, &mut recent) {
        return Err(ValidationError::consensus(
            "timestamp not above median of recent blocks",
        ));
    }
    if header.timestamp > now + MAX_FUTURE_DRIFT {
        return Err(ValidationError::consensus(
            "timestamp too far in the future",
        ));
    }

    if u64::from(header.block_hash().leading_zero_bits()) < header.difficulty {
        return Err(ValidationError::consensus(
            "block hash does not meet difficulty target",
        ));
    }

    Ok(())
}

/// Full block validation against the parent state.
///
/// Runs the complete check sequence and replays every transaction on a
/// working copy of `parent_state`. Any failing transaction invalidates the
/// whole block. Returns the post-block world state on success so callers
/// can adopt it without replaying.
pub fn validate_block(
    block: &Block,
    parent_state: &WorldState,
    view: &dyn ChainView,
    now: u64,
) -> Result<WorldState, ValidationError> {
    let header = &block.header;

    if usize::from(header.tx_count) != block.transactions.len() {
        return Err(ValidationError::consensus(
            "tx_count does not match transaction list",
        ));
    }
    if block.serialized_size() > MAX_BLOCK_BYTES {
        return Err(ValidationError::LimitExceeded(format!(
            "block exceeds {MAX_BLOCK_BYTES} bytes"
        )));
    }

    validate_header(header, view, now)?;

    if block.transactions.is_empty() {
        return Err(ValidationError::consensus("block has no transactions"));
    }
    validate_coinbase(&block.transactions[0], header)?;
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::consensus("only one coinbase per block"));
    }

    let mut working = parent_state.clone();
    let mut overlay = PostOverlay::new(view);
    let mut seen = HashSet::new();

    for tx in &block.transactions {
        let tx_hash = tx.hash();
        if !seen.insert(tx_hash) || view.tx_kind(&tx_hash).is_some() {
            return Err(ValidationError::consensus(format!(
                "duplicate transaction {tx_hash}"
            )));
        }

        if !tx.is_coinbase() {
            validate_tx(tx, &working, &overlay)?;
        }

        working.apply_transaction(tx, &header.miner, |target| overlay.post_author(target))?;

        if let Transaction::Post(post) = tx {
            overlay.add_post(tx_hash, post.author);
        }
    }

    if block.compute_tx_merkle_root() != header.tx_merkle_root {
        return Err(ValidationError::consensus("tx_merkle_root mismatch"));
    }
    if working.state_root() != header.state_root {
        return Err(ValidationError::consensus("state_root mismatch"));
    }

    Ok(working)
}
