//! Magic blocks: committee definitions.
//!
//! A magic block enumerates the miners (identity, public key, stake)
//! that govern consensus from its `starting_round` onward. Each magic
//! block supersedes prior ones for rounds at or beyond its starting
//! round.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{MinerId, PublicKey};

/// A committee member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Miner {
    /// Stable identity.
    pub id: MinerId,
    /// BLS public key used to verify tickets and proposals.
    pub public_key: PublicKey,
    /// Stake backing this miner.
    pub stake: u64,
}

impl Miner {
    /// Build a miner entry.
    pub fn new(id: MinerId, public_key: PublicKey, stake: u64) -> Self {
        Self {
            id,
            public_key,
            stake,
        }
    }
}

/// An ordered, stable miner list with identity lookup.
///
/// Order is the order miners were registered in; duplicates by id are
/// dropped, keeping the first occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Miner>", into = "Vec<Miner>")]
pub struct MinerSet {
    miners: Vec<Miner>,
    index: HashMap<MinerId, usize>,
}

impl MinerSet {
    /// Build a miner set, dropping duplicate identities.
    pub fn new(miners: Vec<Miner>) -> Self {
        let mut deduped = Vec::with_capacity(miners.len());
        let mut index = HashMap::with_capacity(miners.len());
        for miner in miners {
            if index.contains_key(&miner.id) {
                continue;
            }
            index.insert(miner.id, deduped.len());
            deduped.push(miner);
        }
        Self {
            miners: deduped,
            index,
        }
    }

    /// Look up a miner by identity.
    pub fn get(&self, id: &MinerId) -> Option<&Miner> {
        self.index.get(id).map(|&i| &self.miners[i])
    }

    /// Whether the identity is a member.
    pub fn contains(&self, id: &MinerId) -> bool {
        self.index.contains_key(id)
    }

    /// Position of the identity in registration order.
    pub fn position(&self, id: &MinerId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Stake of the identity, zero when absent.
    pub fn stake_of(&self, id: &MinerId) -> u64 {
        self.get(id).map(|m| m.stake).unwrap_or(0)
    }

    /// Total stake over all members.
    pub fn total_stake(&self) -> u64 {
        self.miners.iter().map(|m| m.stake).sum()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.miners.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.miners.is_empty()
    }

    /// Iterate over members in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Miner> {
        self.miners.iter()
    }
}

impl From<Vec<Miner>> for MinerSet {
    fn from(miners: Vec<Miner>) -> Self {
        Self::new(miners)
    }
}

impl From<MinerSet> for Vec<Miner> {
    fn from(set: MinerSet) -> Self {
        set.miners
    }
}

/// Notarization thresholds carried by a magic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Thresholds {
    /// Supermajority percentage of the miner count, 0 to disable.
    pub by_count: u32,
    /// Absolute stake floor, 0 to disable.
    pub by_stake: u64,
}

/// A committee definition effective from `starting_round`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicBlock {
    /// First round this committee governs.
    pub starting_round: u64,
    /// The committee.
    pub miners: MinerSet,
    /// Thresholds handed over with the committee.
    pub thresholds: Thresholds,
}

impl MagicBlock {
    /// Build a magic block.
    pub fn new(starting_round: u64, miners: MinerSet, thresholds: Thresholds) -> Self {
        Self {
            starting_round,
            miners,
            thresholds,
        }
    }
}
