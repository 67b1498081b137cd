//! Finalization pipeline.
//!
//! Applies a notarized block's state changes, advances the head
//! pointers, promotes deterministic finality, and prunes dead sibling
//! forks. `save_changes` is the single safety gate: if persisting the
//! block's state fails, nothing advances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_types::Block;

use crate::chain::Chain;
use crate::error::ConsensusError;

/// How many predecessors behind a freshly finalized block the dead
/// siblings of a round are pruned. Independent of `lfb_ticket_ahead`.
pub const PRUNE_DEPTH: usize = 10;

/// Finalizations further apart than this are not counted toward the
/// steady-state latency timer.
const STEADY_STATE_WINDOW: Duration = Duration::from_secs(20);

/// Blocks older than this skip the start-to-finalize timer.
const START_TO_FINALIZE_WINDOW: Duration = Duration::from_secs(100);

impl Chain {
    /// Finalize a notarized block.
    pub async fn finalize_block(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), ConsensusError> {
        info!(
            round = block.round(),
            current_round = self.current_round(),
            lf_round = self.latest_finalized_block().round(),
            hash = %block.hash(),
            round_rank = block.round_rank(),
            "finalize block"
        );

        self.record_finalization_stats(block);
        self.record_finalization_latency(block);

        // Single safety gate: nothing advances if persistence fails.
        if let Err(err) = self.state.save_changes(ctx, block).await {
            error!(
                %err,
                round = block.round(),
                hash = %block.hash(),
                "finalize block save changes failed"
            );
            return Err(ConsensusError::StateSaveFailed(err.to_string()));
        }

        self.state.rebase(block);
        self.update_fee_stats(block);

        self.record_fork_switch(block);
        self.set_latest_own_finalized_round(block.round());
        self.set_latest_finalized_block(block);

        if let Some(mb) = block.magic_block() {
            match self.update_magic_block(mb.clone()) {
                Ok(_) => self.set_latest_finalized_magic_block(block),
                Err(err) => error!(
                    round = block.round(),
                    mb_starting_round = mb.starting_round,
                    %err,
                    "finalize block - update magic block failed"
                ),
            }
        }

        match self.get_round(block.round()) {
            Some(round) => {
                // A round can finalize with no locally notarized block
                // when its winner arrived through sync.
                if round.notarized_count() == 0 {
                    self.stats.record_zero_notarized();
                }
                round.finalize();
            }
            None => self.stats.record_zero_notarized(),
        }

        // Fire-and-forget: head advancement never waits on the
        // external handler.
        let handler = Arc::clone(&self.handler);
        let finalized = Arc::clone(block);
        tokio::spawn(async move {
            let round = finalized.round();
            let hash = finalized.hash();
            match handler.update_finalized_block(finalized).await {
                Ok(()) => debug!(round, %hash, "finalized-block handler completed"),
                Err(err) => error!(round, %hash, %err, "finalized-block handler failed"),
            }
        });

        self.summaries
            .write()
            .expect("chain lock poisoned")
            .push(block.summary());
        self.stats.record_finalized();

        self.promote_deterministic(block);
        self.prune_dead_forks(block);

        Ok(())
    }

    /// Whether a finalized block is deterministically final: a
    /// supermajority of distinct children have extended it.
    pub fn is_finalized_deterministically(&self, block: &Arc<Block>) -> bool {
        if self.latest_finalized_block().round() < block.round() {
            return false;
        }
        let mb = self.get_magic_block(block.round());
        block.unique_block_extension_count() * 100
            >= mb.miners.len() * self.config.threshold_by_count as usize
    }

    fn record_finalization_stats(&self, block: &Arc<Block>) {
        let num_generators = self.config.generators_num;
        let rank = block.round_rank();
        if rank < 0 || rank as usize >= num_generators {
            warn!(
                round_rank = rank,
                num_generators,
                "finalize block - round rank is invalid or greater than num_generators"
            );
        } else {
            let mut stats = self.miner_stats.write().expect("chain lock poisoned");
            stats
                .entry(block.miner_id())
                .or_default()
                .record_finalization(rank as usize, num_generators);
            // Higher-priority generators whose proposal lost this round.
            self.stats.record_missed(rank as u64);
        }

        if let Some(round) = self.get_round(block.round()) {
            let proposed = round.proposed_blocks();
            let mut stats = self.miner_stats.write().expect("chain lock poisoned");
            for (idx, hash) in proposed.iter().enumerate() {
                if let Some(proposal) = self.store.get(hash) {
                    stats
                        .entry(proposal.miner_id())
                        .or_default()
                        .record_generation(idx, proposed.len().max(num_generators));
                }
            }
        }
    }

    /// Detect whether finalizing `block` abandons the chain of the
    /// current latest finalized block, and record the rollback depth
    /// if so. Walks local parent links only; missing history just
    /// bounds the measured depth.
    fn record_fork_switch(&self, block: &Arc<Block>) {
        let lfb = self.latest_finalized_block();
        if block.round() < lfb.round() {
            return;
        }

        let mut cursor = Arc::clone(block);
        while cursor.round() > lfb.round() {
            match cursor.prev_block() {
                Some(prev) => cursor = prev,
                None => return,
            }
        }
        if cursor.hash() == lfb.hash() {
            return;
        }

        // The previously finalized suffix lost; walk both branches
        // back until they converge to measure how deep.
        let mut depth = 1u64;
        let mut old_branch = lfb;
        let mut new_branch = cursor;
        while let (Some(old_prev), Some(new_prev)) =
            (old_branch.prev_block(), new_branch.prev_block())
        {
            if old_prev.hash() == new_prev.hash() {
                break;
            }
            depth += 1;
            old_branch = old_prev;
            new_branch = new_prev;
        }

        warn!(
            round = block.round(),
            hash = %block.hash(),
            rolled_back = depth,
            "finalize block - switching away from finalized chain"
        );
        self.stats.record_rollback(depth);
    }

    fn record_finalization_latency(&self, block: &Arc<Block>) {
        let now = Instant::now();
        let mut last = self
            .timers
            .last_finalized_at
            .lock()
            .expect("chain lock poisoned");
        if let Some(prev) = *last {
            let since = now.duration_since(prev);
            if since < STEADY_STATE_WINDOW {
                self.timers.steady_state.record(since);
            }
        }
        *last = Some(now);

        let age = block.age();
        if age < START_TO_FINALIZE_WINDOW {
            self.timers.start_to_finalize.record(age);
        }
    }

    fn update_fee_stats(&self, block: &Arc<Block>) {
        let txns = block.transactions();
        if txns.is_empty() {
            return;
        }
        let total_fees: u64 = txns.iter().map(|t| t.fee).sum();
        self.fee_stats
            .write()
            .expect("chain lock poisoned")
            .update(total_fees, txns.len());
    }

    /// Walk back from the finalized block, promoting the newest
    /// predecessor that satisfies deterministic finality. One-way:
    /// the pointer never moves backward.
    fn promote_deterministic(&self, block: &Arc<Block>) {
        let ldb = self.latest_deterministic_block();
        let mut cursor = Some(Arc::clone(block));
        let mut steps = 0;
        while let Some(current) = cursor {
            if current.hash() == ldb.hash() || steps > PRUNE_DEPTH {
                break;
            }
            if self.is_finalized_deterministically(&current) {
                info!(
                    round = current.round(),
                    hash = %current.hash(),
                    "promoting latest deterministic block"
                );
                self.set_latest_deterministic_block(&current);
                break;
            }
            cursor = current.prev_block();
            steps += 1;
        }
    }

    /// At `PRUNE_DEPTH` behind the finalized block, every sibling at
    /// that round other than the kept predecessor is a dead fork and
    /// is deleted.
    fn prune_dead_forks(&self, block: &Arc<Block>) {
        let mut keep = Some(Arc::clone(block));
        for _ in 0..PRUNE_DEPTH {
            keep = keep.and_then(|b| b.prev_block());
        }
        let Some(keep) = keep else {
            return;
        };

        let dead: Vec<Arc<Block>> = self
            .store
            .get_round_blocks(keep.round())
            .into_iter()
            .filter(|b| b.hash() != keep.hash())
            .collect();
        if !dead.is_empty() {
            debug!(
                round = keep.round(),
                kept = %keep.hash(),
                pruned = dead.len(),
                "pruning dead fork blocks"
            );
            self.store.delete_blocks(&dead);
        }
        self.delete_rounds_below(keep.round());
    }
}
