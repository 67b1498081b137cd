//! Notarization: thresholds, ticket admission, block verification.
//!
//! The threshold predicate itself does no cryptography; aggregate
//! validity is enforced by the ticket verifier before a block is
//! marked notarized. Tickets already held by a block were verified
//! individually on admission, which is why `is_block_notarized` can
//! skip signature re-verification.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tessera_types::{Block, Hash, VerificationTicket};

use crate::chain::Chain;
use crate::error::ConsensusError;

impl Chain {
    /// Verify that a notarization is correct and mark the block
    /// notarized.
    ///
    /// Composes: related-magic-block presence, duplicate-verifier
    /// check, threshold check, aggregate signature verification. On
    /// success the current round advances to the block's round (never
    /// backward).
    pub async fn verify_notarization(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
        tickets: &[VerificationTicket],
        round: u64,
    ) -> Result<(), ConsensusError> {
        if tickets.is_empty() {
            return Err(ConsensusError::NoTickets);
        }

        self.verify_related_mb_presence(block)?;

        let mut verifiers = HashSet::with_capacity(tickets.len());
        for ticket in tickets {
            if !verifiers.insert(ticket.verifier_id) {
                return Err(ConsensusError::DuplicateTicketSignature(block.hash()));
            }
        }

        if !self.reached_notarization(round, block.hash(), tickets) {
            return Err(ConsensusError::BlockNotNotarized);
        }

        self.verify_tickets(ctx, block.hash(), tickets, round)
            .await?;

        if block.set_notarized() {
            self.on_block_notarized(block);
        }
        self.set_current_round(block.round());

        Ok(())
    }

    /// Cheap idempotent notarization check used by block ingress.
    ///
    /// If the block is already marked notarized this returns true
    /// immediately; otherwise it runs the magic-block presence and
    /// threshold checks over the block's own ticket set, without
    /// re-verifying signatures.
    pub fn is_block_notarized(&self, block: &Arc<Block>) -> bool {
        if block.is_notarized() {
            return true;
        }

        if let Err(err) = self.verify_related_mb_presence(block) {
            error!(block = %block.hash(), %err, "is_block_notarized");
            return false;
        }

        let notarized =
            self.reached_notarization(block.round(), block.hash(), &block.verification_tickets());
        if notarized && block.set_notarized() {
            self.on_block_notarized(block);
        }
        notarized
    }

    /// Pure threshold predicate: do `tickets` satisfy the configured
    /// count and/or stake thresholds for `round`?
    pub(crate) fn reached_notarization(
        &self,
        round: u64,
        hash: Hash,
        tickets: &[VerificationTicket],
    ) -> bool {
        let mb = self.get_magic_block(round);
        let active_miners = mb.miners.len();
        let threshold = self.config.notarization_threshold_count(active_miners);

        if self.config.threshold_by_count > 0 && tickets.len() < threshold {
            info!(
                mb_sr = mb.starting_round,
                active_miners,
                threshold,
                num_signatures = tickets.len(),
                current_round = self.current_round(),
                round,
                "not reached notarization"
            );
            return false;
        }

        if self.config.threshold_by_stake > 0 {
            let verifiers_stake: u64 = tickets
                .iter()
                .map(|t| mb.miners.stake_of(&t.verifier_id))
                .sum();
            if verifiers_stake < self.config.threshold_by_stake {
                info!(
                    mb_sr = mb.starting_round,
                    verifiers_stake,
                    threshold_stake = self.config.threshold_by_stake,
                    active_miners,
                    num_signatures = tickets.len(),
                    current_round = self.current_round(),
                    round,
                    "not reached notarization - stake below threshold"
                );
                return false;
            }
        }

        info!(
            round,
            current_round = self.current_round(),
            block = %hash,
            mb_sr = mb.starting_round,
            active_miners,
            num_signatures = tickets.len(),
            threshold,
            "reached notarization"
        );
        true
    }

    /// Check that the magic block governing the block's round is the
    /// one the block names. Already committed history (rounds below
    /// the latest finalized block) is trusted and skipped.
    ///
    /// The magic block hash is intentionally not cross-checked: the
    /// hash at hand is the hash of the carrying block, not of the
    /// magic block payload.
    pub fn verify_related_mb_presence(&self, block: &Arc<Block>) -> Result<(), ConsensusError> {
        let lfb = self.latest_finalized_block();
        if block.round() < lfb.round() {
            return Ok(());
        }

        let mb = self.get_magic_block(block.round());
        let related = block.latest_finalized_magic_block_round();
        if mb.starting_round != related {
            return Err(ConsensusError::MagicBlockMismatch {
                want: related,
                got: mb.starting_round,
            });
        }
        Ok(())
    }

    /// Add a verified ticket to the block, re-checking notarization
    /// on successful insertion.
    pub fn add_verification_ticket(&self, block: &Arc<Block>, ticket: VerificationTicket) -> bool {
        let added = block.add_verification_ticket(ticket);
        if added {
            self.is_block_notarized(block);
        }
        added
    }

    /// Merge a set of already-validated tickets into the block,
    /// re-checking notarization if any were new.
    pub fn merge_verification_tickets(
        &self,
        block: &Arc<Block>,
        tickets: Vec<VerificationTicket>,
    ) {
        if block.merge_verification_tickets(tickets) > 0 {
            self.is_block_notarized(block);
        }
    }

    /// Bookkeeping run exactly once per block, on the notarized
    /// transition.
    fn on_block_notarized(&self, block: &Arc<Block>) {
        let round = self.add_round(block.round());
        round.add_notarized_block(block.hash());
        self.stats.record_round_width(round.notarized_count());

        // The parent gained a distinct extender.
        if let Some(parent) = self.store.get(&block.prev_hash()) {
            parent.add_unique_block_extension(block.hash());
        }
    }

    // ── block verification (proposer side) ─────────────────────────

    /// Validate a received block: content hash, proposer membership,
    /// proposer signature. On success the block is marked verified and
    /// this node's verification ticket is returned.
    pub fn verify_block(
        &self,
        block: &Arc<Block>,
    ) -> Result<VerificationTicket, ConsensusError> {
        if block.compute_hash() != block.hash() {
            return Err(ConsensusError::InvalidBlock(
                "content hash mismatch".to_string(),
            ));
        }

        let mb = self.get_magic_block(block.round());
        let Some(miner) = mb.miners.get(&block.miner_id()) else {
            return Err(ConsensusError::UnknownVerifier(block.miner_id()));
        };

        if !block
            .signature()
            .verify(block.hash().as_bytes(), &miner.public_key)
        {
            return Err(ConsensusError::InvalidBlock(
                "proposer signature invalid".to_string(),
            ));
        }

        block.set_verified();
        self.add_round(block.round()).add_proposed_block(block.hash());
        self.sign_block(block)
    }

    /// Sign the block hash with this node's identity, producing its
    /// verification ticket.
    pub fn sign_block(&self, block: &Arc<Block>) -> Result<VerificationTicket, ConsensusError> {
        let identity = self.identity.as_ref().ok_or(ConsensusError::NoIdentity)?;
        Ok(VerificationTicket {
            verifier_id: identity.id,
            signature: identity.keys.sign(block.hash().as_bytes()),
        })
    }
}
