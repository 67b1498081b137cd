//! In-memory block store.
//!
//! Maps block hash to block with a per-round index so fork pruning
//! can enumerate every proposal ever seen at a round. Multi-reader,
//! single-writer per entry; the maps themselves are guarded by
//! read-write locks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use tessera_types::{Block, Hash};

/// Block storage indexed by hash and round.
pub struct BlockStore {
    blocks: RwLock<HashMap<Hash, Arc<Block>>>,
    by_round: RwLock<HashMap<u64, HashSet<Hash>>>,
}

impl BlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            by_round: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a block. Idempotent on hash: if the hash is already
    /// present the stored block wins and is returned.
    pub fn add_block(&self, block: Arc<Block>) -> Arc<Block> {
        let mut blocks = self.blocks.write().expect("store lock poisoned");
        if let Some(existing) = blocks.get(&block.hash()) {
            return Arc::clone(existing);
        }
        blocks.insert(block.hash(), Arc::clone(&block));
        drop(blocks);

        self.by_round
            .write()
            .expect("store lock poisoned")
            .entry(block.round())
            .or_default()
            .insert(block.hash());
        block
    }

    /// Look up a block by hash.
    pub fn get(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.blocks
            .read()
            .expect("store lock poisoned")
            .get(hash)
            .cloned()
    }

    /// Whether the hash is stored.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks
            .read()
            .expect("store lock poisoned")
            .contains_key(hash)
    }

    /// Every block ever seen at `round`, regardless of fork.
    pub fn get_round_blocks(&self, round: u64) -> Vec<Arc<Block>> {
        let by_round = self.by_round.read().expect("store lock poisoned");
        let Some(hashes) = by_round.get(&round) else {
            return Vec::new();
        };
        let blocks = self.blocks.read().expect("store lock poisoned");
        hashes
            .iter()
            .filter_map(|h| blocks.get(h).cloned())
            .collect()
    }

    /// Remove blocks and free their parent links so pruned forks do
    /// not keep ancestor chains alive.
    pub fn delete_blocks(&self, dead: &[Arc<Block>]) {
        if dead.is_empty() {
            return;
        }
        // Lock order matches get_round_blocks: by_round, then blocks.
        let mut by_round = self.by_round.write().expect("store lock poisoned");
        let mut blocks = self.blocks.write().expect("store lock poisoned");
        for block in dead {
            blocks.remove(&block.hash());
            if let Some(hashes) = by_round.get_mut(&block.round()) {
                hashes.remove(&block.hash());
                if hashes.is_empty() {
                    by_round.remove(&block.round());
                }
            }
            block.clear_prev_block();
        }
        debug!(count = dead.len(), "deleted dead blocks");
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("store lock poisoned").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
