//! Per-round bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::Hash;

/// A logical slot in which one or more proposals compete. A round
/// belongs to exactly one magic block.
pub struct RoundInfo {
    number: u64,
    lists: RwLock<RoundLists>,
    timeout_count: AtomicU32,
    random_seed: AtomicU64,
    finalized: AtomicBool,
}

#[derive(Default)]
struct RoundLists {
    proposed: Vec<Hash>,
    notarized: Vec<Hash>,
}

impl RoundInfo {
    /// Create an empty round.
    pub fn new(number: u64) -> Self {
        Self {
            number,
            lists: RwLock::new(RoundLists::default()),
            timeout_count: AtomicU32::new(0),
            random_seed: AtomicU64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Record a proposal. Returns false if already recorded.
    pub fn add_proposed_block(&self, hash: Hash) -> bool {
        let mut lists = self.lists.write().expect("round lock poisoned");
        if lists.proposed.contains(&hash) {
            return false;
        }
        lists.proposed.push(hash);
        true
    }

    /// Record a notarized block. Returns false if already recorded.
    pub fn add_notarized_block(&self, hash: Hash) -> bool {
        let mut lists = self.lists.write().expect("round lock poisoned");
        if lists.notarized.contains(&hash) {
            return false;
        }
        lists.notarized.push(hash);
        true
    }

    pub fn proposed_blocks(&self) -> Vec<Hash> {
        self.lists.read().expect("round lock poisoned").proposed.clone()
    }

    pub fn notarized_blocks(&self) -> Vec<Hash> {
        self.lists.read().expect("round lock poisoned").notarized.clone()
    }

    pub fn notarized_count(&self) -> usize {
        self.lists.read().expect("round lock poisoned").notarized.len()
    }

    pub fn increment_timeout_count(&self) -> u32 {
        self.timeout_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count.load(Ordering::Acquire)
    }

    pub fn set_random_seed(&self, seed: u64) {
        self.random_seed.store(seed, Ordering::Release);
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed.load(Ordering::Acquire)
    }

    /// Mark the round finalized. One-way.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RoundInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.read().expect("round lock poisoned");
        f.debug_struct("RoundInfo")
            .field("number", &self.number)
            .field("proposed", &lists.proposed.len())
            .field("notarized", &lists.notarized.len())
            .field("timeouts", &self.timeout_count())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
