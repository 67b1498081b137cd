//! Ancestor sync and chain repair.
//!
//! Pulls missing history from peers, obtains authoritative state
//! changes (or recomputes them locally), and finds common ancestors
//! across short forks. Sync failures are retryable and never roll
//! back head pointers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tessera_types::Block;

use crate::chain::Chain;
use crate::error::ConsensusError;

impl Chain {
    /// The block's parent, without a network request.
    pub fn get_local_previous_block(&self, block: &Arc<Block>) -> Option<Arc<Block>> {
        block
            .prev_block()
            .or_else(|| self.store.get(&block.prev_hash()))
    }

    /// The block's parent with its state computed, syncing ancestors
    /// from peers if the local node is missing history.
    ///
    /// # Panics
    ///
    /// Panics if the block's previous link points to itself.
    pub async fn get_previous_block(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Option<Arc<Block>> {
        if block.prev_hash() == block.hash()
            || block
                .prev_block()
                .is_some_and(|p| Arc::ptr_eq(&p, block))
        {
            panic!(
                "block previous link points to itself, round {} hash {}",
                block.round(),
                block.hash()
            );
        }

        if let Some(prev) = block.prev_block() {
            if prev.hash() == block.prev_hash() && prev.is_state_computed() {
                return Some(prev);
            }
        }

        if let Some(prev) = self.store.get(&block.prev_hash()) {
            if prev.is_state_computed() {
                block.set_previous_block(&prev);
                return Some(prev);
            }
        }

        let lfb = self.latest_finalized_block();
        if block.round() > 0
            && lfb.round() == block.round() - 1
            && lfb.hash() == block.prev_hash()
            && lfb.is_state_computed()
        {
            // The previous round is the latest finalized round.
            block.set_previous_block(&lfb);
            info!(
                round = block.round(),
                lfb_round = lfb.round(),
                block = %block.hash(),
                "get_previous_block - previous block is lfb"
            );
            return Some(lfb);
        }

        let max_sync_depth = self.config.lfb_ticket_ahead as i64 + 1;
        let mut sync_num = block.round() as i64 - lfb.round() as i64;
        // Sync the lfb too if its own state is not computed yet.
        if sync_num > 0 && sync_num < max_sync_depth && !lfb.is_state_computed() {
            sync_num += 1;
        }
        if sync_num > max_sync_depth {
            sync_num = max_sync_depth;
        }

        if sync_num <= 0 {
            // At or below the lfb: state changes must exist remotely,
            // fetch exactly one block.
            let blocks = self.sync_blocks(ctx, block, 1, false).await;
            let Some(prev) = blocks.into_iter().next() else {
                error!(
                    round = block.round().saturating_sub(1),
                    lfb_round = lfb.round(),
                    "get_previous_block - round is <= lfb, could not sync block from remote"
                );
                return None;
            };
            if prev.hash() != block.prev_hash() {
                error!(
                    round = block.round(),
                    want = %block.prev_hash(),
                    got = %prev.hash(),
                    "get_previous_block - synced block is not the parent"
                );
                return None;
            }
            block.set_previous_block(&prev);
            info!(
                sync_num = 1,
                round = block.round(),
                block = %block.hash(),
                previous_round = prev.round(),
                previous_block = %prev.hash(),
                "get_previous_block - sync successfully"
            );
            return Some(prev);
        }

        // Sync at most lfb_ticket_ahead + 1 blocks back: the state
        // changes of the latest finalized block are available from
        // remote, so the chain can be recomputed up from there.
        let blocks = self.sync_blocks(ctx, block, sync_num as u64, false).await;
        if blocks.first().map_or(true, |b| !b.is_state_computed()) {
            debug!(
                round = block.round().saturating_sub(1),
                sync_num,
                "get_previous_block - could not sync previous blocks"
            );
            return None;
        }

        let prev = blocks.last().cloned()?;
        if !prev.is_state_computed() {
            error!(
                round = block.round(),
                previous_round = prev.round(),
                previous_block = %prev.hash(),
                "get_previous_block - could not get state computed previous block"
            );
            return None;
        }
        if prev.hash() != block.prev_hash() {
            error!(
                round = block.round(),
                want = %block.prev_hash(),
                got = %prev.hash(),
                "get_previous_block - synced block is not the parent"
            );
            return None;
        }

        block.set_previous_block(&prev);
        info!(
            sync_num = blocks.len(),
            round = block.round(),
            block = %block.hash(),
            previous_round = prev.round(),
            previous_block = %prev.hash(),
            "get_previous_block - sync successfully"
        );
        Some(prev)
    }

    /// Pull up to `num` notarized ancestors of `block` and compute
    /// their states. Per-block failures are recorded and skipped; the
    /// returned slice starts after the last failure, so every
    /// returned block has its state computed. Blocks that survive are
    /// indexed in the store.
    ///
    /// # Panics
    ///
    /// Panics if a returned block other than the oldest has no parent
    /// link: that indicates a protocol bug in the fetcher.
    pub async fn sync_blocks(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
        num: u64,
        save: bool,
    ) -> Vec<Arc<Block>> {
        warn!(
            num,
            start_round = block.round(),
            save,
            "sync_blocks - start"
        );

        let blocks = self.fetcher.pull_notarized_blocks(ctx, block, num).await;
        if blocks.is_empty() {
            debug!("sync_blocks - pull blocks with no response");
            return Vec::new();
        }

        // Link consecutive ancestors.
        for i in 1..blocks.len() {
            if blocks[i].prev_block().is_none() && blocks[i].prev_hash() == blocks[i - 1].hash() {
                let prev = Arc::clone(&blocks[i - 1]);
                blocks[i].set_previous_block(&prev);
            }
        }

        // The oldest block has no local parent; its state comes from
        // the remote or a local re-execution.
        if let Some(first) = blocks.first() {
            if first.prev_block().is_none() {
                match self.sync_state_or_compute_local(ctx, first).await {
                    Err(err) => error!(
                        %err,
                        round = first.round(),
                        block = %first.hash(),
                        "sync_blocks - sync state for oldest block failed"
                    ),
                    Ok(()) => {
                        if save {
                            if let Err(err) = self.state.save_changes(ctx, first).await {
                                error!(%err, round = first.round(), "sync_blocks - save changes failed");
                            } else {
                                info!(
                                    round = first.round(),
                                    block = %first.hash(),
                                    "sync_blocks - save state changes success"
                                );
                            }
                        }
                    }
                }
            }
        }

        let mut failed_index: isize = -1;
        for (i, current) in blocks.iter().enumerate() {
            let Some(prev) = current.prev_block() else {
                // Only the oldest returned block may lack a parent.
                if i > 0 {
                    panic!(
                        "sync_blocks - block has no prev block, round {} block {} index {} end_round {} num {}",
                        current.round(),
                        current.hash(),
                        i,
                        block.round(),
                        num
                    );
                }
                continue;
            };

            current.set_state_db(&prev, self.state.state_db());
            if self.sync_state_or_compute_local(ctx, current).await.is_err() {
                failed_index = i as isize;
                continue;
            }

            if save {
                if let Err(err) = self.state.save_changes(ctx, current).await {
                    error!(%err, round = current.round(), "sync_blocks - save changes failed");
                } else {
                    info!(
                        round = current.round(),
                        block = %current.hash(),
                        "sync_blocks - save state changes success"
                    );
                }
            }

            info!(round = current.round(), block = %current.hash(), "sync_blocks success");
        }

        let blocks: Vec<Arc<Block>> = blocks
            .into_iter()
            .skip((failed_index + 1) as usize)
            .collect();
        for synced in &blocks {
            self.store.add_block(Arc::clone(synced));
        }
        blocks
    }

    /// Obtain a block's post-state: authoritative remote state change
    /// first, deterministic local re-execution as fallback. Both
    /// failing is a transient error that does not prevent processing
    /// later blocks.
    pub async fn sync_state_or_compute_local(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), ConsensusError> {
        if let Err(err) = self.fetcher.sync_block_state_change(block).await {
            error!(%err, round = block.round(), "sync_blocks - sync state change failed");

            if let Err(err) = self.state.compute_state_local(ctx, block).await {
                error!(%err, round = block.round(), "sync_blocks - compute state local failed");
                // Later blocks may still get state changes from
                // remote or compute successfully.
                return Err(ConsensusError::SyncFailed {
                    round: block.round(),
                    block: block.hash(),
                });
            }
        }
        Ok(())
    }

    /// Common ancestor of two tips. Designed for short forks: walks
    /// the higher tip down to the lower round, then both together.
    /// Returns `None` when any ancestor cannot be resolved.
    pub async fn common_ancestor(
        &self,
        ctx: &CancellationToken,
        b1: &Arc<Block>,
        b2: &Arc<Block>,
    ) -> Option<Arc<Block>> {
        let mut b1 = Arc::clone(b1);
        let mut b2 = Arc::clone(b2);

        if b1.hash() == b2.hash() {
            return Some(b1);
        }
        if b2.round() < b1.round() {
            std::mem::swap(&mut b1, &mut b2);
        }
        while b2.round() != b1.round() {
            b2 = self.get_previous_block(ctx, &b2).await?;
        }
        while b1.hash() != b2.hash() {
            b1 = self.get_previous_block(ctx, &b1).await?;
            b2 = self.get_previous_block(ctx, &b2).await?;
        }
        Some(b1)
    }
}
