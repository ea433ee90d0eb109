//! RocksDB-backed persistence for chain, state, and undo records.
//!
//! Layout:
//! - `blocks`    — block hash -> canonical JSON block (all branches)
//! - `canonical` — big-endian height -> block hash (active branch)
//! - `undo`      — block hash -> undo record (recent canonical blocks)
//! - `meta`      — `tip` -> active tip hash, `state` -> world state dump
//!
//! Every tip change commits as a single `WriteBatch`, so a crash never
//! leaves the canonical index, state, and undo records out of sync. On
//! startup the node loads everything here without replaying from genesis.
//! A `fs2` lock file prevents two nodes from sharing a data directory.

use crate::core::block::Block;
use crate::storage::state_store::{UndoRecord, WorldState};
use crate::types::encoding::canonical_bytes;
use crate::types::hash::Hash;
use fs2::FileExt;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const CF_BLOCKS: &str = "blocks";
const CF_CANONICAL: &str = "canonical";
const CF_UNDO: &str = "undo";
const CF_META: &str = "meta";

const META_TIP: &[u8] = b"tip";
const META_STATE: &[u8] = b"state";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Db(String),

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("data directory is locked by another node")]
    Locked,
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Db(err.to_string())
    }
}

/// One atomic mutation of the persisted chain.
///
/// `canonical_truncate_above` removes canonical entries for heights
/// strictly greater than the given height before the puts are applied;
/// reorgs use it to drop the abandoned branch suffix.
#[derive(Default)]
pub struct ChainUpdate {
    pub new_blocks: Vec<Arc<Block>>,
    pub canonical_truncate_above: Option<u64>,
    pub canonical_put: Vec<(u64, Hash)>,
    pub undo_put: Vec<(Hash, UndoRecord)>,
    pub undo_delete: Vec<Hash>,
    pub tip: Hash,
    pub state: WorldState,
}

/// Everything needed to resume a node without replaying from genesis.
pub struct LoadedChain {
    /// All stored blocks, parents before children.
    pub blocks: Vec<Block>,
    /// Active branch hashes ordered by height.
    pub canonical: Vec<Hash>,
    pub state: WorldState,
    pub undo: HashMap<Hash, UndoRecord>,
}

pub struct DiskStore {
    db: DB,
    _lock: File,
}

impl DiskStore {
    /// Opens (or creates) the store under the given data directory.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_BLOCKS, CF_CANONICAL, CF_UNDO, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, dir.join("db"), descriptors)?;
        Ok(Self {
            db,
            _lock: lock_file,
        })
    }

    fn cf(&self, name: &str) -> &ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column families are created at open")
    }

    /// Loads the persisted chain, or `None` for a fresh directory.
    pub fn load(&self) -> Result<Option<LoadedChain>, StoreError> {
        let Some(tip_bytes) = self.db.get_cf(self.cf(CF_META), META_TIP)? else {
            return Ok(None);
        };
        let tip = Hash::from_slice(&tip_bytes)
            .ok_or_else(|| StoreError::Corrupt("tip is not a 32-byte hash".into()))?;

        let state_bytes = self
            .db
            .get_cf(self.cf(CF_META), META_STATE)?
            .ok_or_else(|| StoreError::Corrupt("missing state dump".into()))?;
        let state: WorldState = serde_json::from_slice(&state_bytes)
            .map_err(|e| StoreError::Corrupt(format!("state dump: {e}")))?;

        let mut blocks = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_BLOCKS), IteratorMode::Start) {
            let (_, value) = item?;
            let block: Block = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("stored block: {e}")))?;
            blocks.push(block);
        }
        blocks.sort_by_key(|b| b.header.height);

        let mut canonical = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_CANONICAL), IteratorMode::Start)
        {
            let (key, value) = item?;
            if key.len() != 8 {
                return Err(StoreError::Corrupt("canonical key width".into()));
            }
            let hash = Hash::from_slice(&value)
                .ok_or_else(|| StoreError::Corrupt("canonical entry is not a hash".into()))?;
            canonical.push(hash);
        }
        if canonical.last() != Some(&tip) {
            return Err(StoreError::Corrupt(
                "tip does not match canonical index".into(),
            ));
        }

        let mut undo = HashMap::new();
        for item in self.db.iterator_cf(self.cf(CF_UNDO), IteratorMode::Start) {
            let (key, value) = item?;
            let hash = Hash::from_slice(&key)
                .ok_or_else(|| StoreError::Corrupt("undo key is not a hash".into()))?;
            let record: UndoRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("undo record: {e}")))?;
            undo.insert(hash, record);
        }

        Ok(Some(LoadedChain {
            blocks,
            canonical,
            state,
            undo,
        }))
    }

    /// Applies one chain mutation atomically.
    pub fn commit(&self, update: &ChainUpdate) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();

        for block in &update.new_blocks {
            batch.put_cf(
                self.cf(CF_BLOCKS),
                block.block_hash().as_slice(),
                canonical_bytes(block.as_ref()),
            );
        }

        if let Some(above) = update.canonical_truncate_above {
            // The canonical index is dense, so walk keys until one is absent
            let mut height = above + 1;
            loop {
                let key = height.to_be_bytes();
                if self.db.get_cf(self.cf(CF_CANONICAL), key)?.is_none() {
                    break;
                }
                batch.delete_cf(self.cf(CF_CANONICAL), key);
                height += 1;
            }
        }
        for (height, hash) in &update.canonical_put {
            batch.put_cf(
                self.cf(CF_CANONICAL),
                height.to_be_bytes(),
                hash.as_slice(),
            );
        }

        for (hash, record) in &update.undo_put {
            let bytes = serde_json::to_vec(record)
                .map_err(|e| StoreError::Corrupt(format!("undo encode: {e}")))?;
            batch.put_cf(self.cf(CF_UNDO), hash.as_slice(), bytes);
        }
        for hash in &update.undo_delete {
            batch.delete_cf(self.cf(CF_UNDO), hash.as_slice());
        }

        batch.put_cf(self.cf(CF_META), META_TIP, update.tip.as_slice());
        let state_bytes = serde_json::to_vec(&update.state)
            .map_err(|e| StoreError::Corrupt(format!("state encode: {e}")))?;
        batch.put_cf(self.cf(CF_META), META_STATE, state_bytes);

        self.db.write(batch)?;
        Ok(())
    }
}
