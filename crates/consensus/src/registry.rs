//! Magic block registry.
//!
//! Append-only index of committee definitions, sorted by
//! `starting_round`. Lookup is a binary search over the sorted list;
//! installs go through a write lock, readers clone an `Arc`.

use std::sync::{Arc, RwLock};

use tracing::info;

use tessera_types::MagicBlock;

use crate::error::ConsensusError;

/// Append-only index of magic blocks. Any round resolves to exactly
/// one entry.
pub struct MagicBlockRegistry {
    // Sorted by starting_round, ascending. Never empty.
    entries: RwLock<Vec<Arc<MagicBlock>>>,
}

impl MagicBlockRegistry {
    /// Create a registry seeded with the genesis committee.
    pub fn new(genesis: MagicBlock) -> Self {
        Self {
            entries: RwLock::new(vec![Arc::new(genesis)]),
        }
    }

    /// The most recent magic block whose `starting_round <= round`.
    ///
    /// The lookup is optimistic: for rounds beyond the latest known
    /// entry it returns that entry even if it was not yet the
    /// governing one at the target round. Callers that require exact
    /// governance validate with `verify_related_mb_presence`.
    pub fn get(&self, round: u64) -> Arc<MagicBlock> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let idx = entries.partition_point(|mb| mb.starting_round <= round);
        if idx == 0 {
            Arc::clone(&entries[0])
        } else {
            Arc::clone(&entries[idx - 1])
        }
    }

    /// The latest installed magic block.
    pub fn latest(&self) -> Arc<MagicBlock> {
        let entries = self.entries.read().expect("registry lock poisoned");
        Arc::clone(entries.last().expect("registry is never empty"))
    }

    /// Install a new committee. Reinstalling the same starting round
    /// replaces the entry; older starting rounds are rejected and do
    /// not modify the registry.
    pub fn install(&self, mb: MagicBlock) -> Result<Arc<MagicBlock>, ConsensusError> {
        let mut entries = self.entries.write().expect("registry lock poisoned");
        let current = entries.last().expect("registry is never empty");
        if mb.starting_round < current.starting_round {
            return Err(ConsensusError::StaleMagicBlock {
                new: mb.starting_round,
                current: current.starting_round,
            });
        }
        info!(
            starting_round = mb.starting_round,
            miners = mb.miners.len(),
            "installing magic block"
        );
        let mb = Arc::new(mb);
        if mb.starting_round == current.starting_round {
            *entries.last_mut().expect("registry is never empty") = Arc::clone(&mb);
        } else {
            entries.push(Arc::clone(&mb));
        }
        Ok(mb)
    }

    /// Number of installed committees.
    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    /// Always false; the registry is seeded at construction.
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{MinerSet, Thresholds};

    fn mb(starting_round: u64) -> MagicBlock {
        MagicBlock::new(starting_round, MinerSet::new(Vec::new()), Thresholds::default())
    }

    #[test]
    fn lookup_resolves_governing_committee() {
        let registry = MagicBlockRegistry::new(mb(0));
        registry.install(mb(100)).unwrap();
        registry.install(mb(200)).unwrap();

        assert_eq!(registry.get(0).starting_round, 0);
        assert_eq!(registry.get(99).starting_round, 0);
        assert_eq!(registry.get(100).starting_round, 100);
        assert_eq!(registry.get(150).starting_round, 100);
        assert_eq!(registry.get(200).starting_round, 200);
    }

    #[test]
    fn lookup_is_optimistic_beyond_latest() {
        let registry = MagicBlockRegistry::new(mb(0));
        registry.install(mb(100)).unwrap();
        assert_eq!(registry.get(1_000_000).starting_round, 100);
    }

    #[test]
    fn stale_install_is_rejected() {
        let registry = MagicBlockRegistry::new(mb(0));
        registry.install(mb(100)).unwrap();
        let err = registry.install(mb(50)).unwrap_err();
        assert_eq!(
            err,
            ConsensusError::StaleMagicBlock {
                new: 50,
                current: 100
            }
        );
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reinstall_same_round_replaces() {
        let registry = MagicBlockRegistry::new(mb(0));
        registry.install(mb(100)).unwrap();
        registry.install(mb(100)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.latest().starting_round, 100);
    }
}
