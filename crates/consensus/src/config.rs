//! Chain configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;

/// Configuration of the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Notarization supermajority as a percentage of the round's miner
    /// count. Zero disables the count threshold.
    pub threshold_by_count: u32,

    /// Absolute stake that ticket signers must jointly hold. Zero
    /// disables the stake threshold.
    pub threshold_by_stake: u64,

    /// Number of block generators ranked per round.
    pub generators_num: usize,

    /// How far ahead of the latest finalized block the network is
    /// allowed to run; bounds ancestor sync depth.
    pub lfb_ticket_ahead: u64,

    /// Concurrent aggregate-signature verifications admitted before
    /// callers are pushed back.
    pub tickets_verifier_slots: usize,

    /// Threads in the crypto pool running aggregate computations.
    pub crypto_threads: usize,

    /// Capacity of the finalized-summary ring buffer.
    pub finalized_summary_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            threshold_by_count: 67,
            threshold_by_stake: 0,
            generators_num: 2,
            lfb_ticket_ahead: 5,
            tickets_verifier_slots: 8,
            crypto_threads: default_crypto_threads(),
            finalized_summary_capacity: 100,
        }
    }
}

fn default_crypto_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 4).max(1))
        .unwrap_or(1)
}

impl ChainConfig {
    /// Tickets required to notarize under a miner set of size
    /// `miners`. Rounds half-up toward the larger integer.
    pub fn notarization_threshold_count(&self, miners: usize) -> usize {
        (self.threshold_by_count as usize * miners + 50) / 100
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.threshold_by_count > 100 {
            return Err(ConsensusError::InvalidConfig(format!(
                "threshold_by_count must be a percentage, got {}",
                self.threshold_by_count
            )));
        }
        if self.threshold_by_count == 0 && self.threshold_by_stake == 0 {
            return Err(ConsensusError::InvalidConfig(
                "at least one notarization threshold must be enabled".to_string(),
            ));
        }
        if self.generators_num == 0 {
            return Err(ConsensusError::InvalidConfig(
                "generators_num must be at least 1".to_string(),
            ));
        }
        if self.tickets_verifier_slots == 0 {
            return Err(ConsensusError::InvalidConfig(
                "tickets_verifier_slots must be at least 1".to_string(),
            ));
        }
        if self.crypto_threads == 0 {
            return Err(ConsensusError::InvalidConfig(
                "crypto_threads must be at least 1".to_string(),
            ));
        }
        if self.finalized_summary_capacity == 0 {
            return Err(ConsensusError::InvalidConfig(
                "finalized_summary_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
