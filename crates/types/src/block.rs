//! Blocks and verification tickets.
//!
//! A block's identity fields are immutable after construction. The
//! guarded state (ticket set, unique extensions, previous-block link,
//! state-db handle, lifecycle flags) is mutated through methods that
//! serialize access per block, so blocks can be shared as `Arc<Block>`
//! across verification, notarization, and finalization.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Hash, KeyPair, MagicBlock, MinerId, Signature, Transaction};

/// Opaque handle to a state database rooted at a block.
pub trait StateDb: Send + Sync {}

/// A committee member's signature over a block hash asserting
/// validity. Unique within a block by `verifier_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationTicket {
    /// The signing miner.
    pub verifier_id: MinerId,
    /// BLS signature over the block hash.
    pub signature: Signature,
}

// Lifecycle flags. Notarized and state-computed transition at most
// once per block; the flag byte makes the transitions race-free.
const GENERATED: u8 = 0b0001;
const VERIFIED: u8 = 0b0010;
const NOTARIZED: u8 = 0b0100;
const STATE_COMPUTED: u8 = 0b1000;

#[derive(Default)]
struct BlockInner {
    tickets: Vec<VerificationTicket>,
    verifiers: HashSet<MinerId>,
    unique_extensions: HashSet<Hash>,
    prev_block: Option<Arc<Block>>,
    state_db: Option<Arc<dyn StateDb>>,
}

/// A proposed extension to the chain, identified by its content hash.
pub struct Block {
    hash: Hash,
    round: u64,
    prev_hash: Hash,
    miner_id: MinerId,
    signature: Signature,
    round_rank: i32,
    txns: Vec<Transaction>,
    magic_block: Option<MagicBlock>,
    latest_finalized_magic_block_round: u64,
    creation_date: u64,

    flags: AtomicU8,
    inner: RwLock<BlockInner>,
}

impl Block {
    /// Build a locally generated block. The content hash is computed
    /// from the identity fields; the signature starts zeroed and is
    /// set with [`Block::signed`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        round: u64,
        prev_hash: Hash,
        miner_id: MinerId,
        round_rank: i32,
        txns: Vec<Transaction>,
        magic_block: Option<MagicBlock>,
        latest_finalized_magic_block_round: u64,
    ) -> Self {
        let creation_date = unix_millis(SystemTime::now());
        let hash = content_hash(
            round,
            &prev_hash,
            &miner_id,
            &txns,
            magic_block.as_ref(),
            latest_finalized_magic_block_round,
            creation_date,
        );
        Self {
            hash,
            round,
            prev_hash,
            miner_id,
            signature: Signature::zero(),
            round_rank,
            txns,
            magic_block,
            latest_finalized_magic_block_round,
            creation_date,
            flags: AtomicU8::new(GENERATED),
            inner: RwLock::new(BlockInner::default()),
        }
    }

    /// Rebuild a block received from the network, with the hash and
    /// signature it arrived with.
    #[allow(clippy::too_many_arguments)]
    pub fn received(
        hash: Hash,
        signature: Signature,
        creation_date: u64,
        round: u64,
        prev_hash: Hash,
        miner_id: MinerId,
        round_rank: i32,
        txns: Vec<Transaction>,
        magic_block: Option<MagicBlock>,
        latest_finalized_magic_block_round: u64,
    ) -> Self {
        Self {
            hash,
            round,
            prev_hash,
            miner_id,
            signature,
            round_rank,
            txns,
            magic_block,
            latest_finalized_magic_block_round,
            creation_date,
            flags: AtomicU8::new(0),
            inner: RwLock::new(BlockInner::default()),
        }
    }

    /// The genesis block: round zero, no parent, all lifecycle flags
    /// set (its state is the initial state by definition).
    pub fn genesis() -> Self {
        let block = Self::new(0, Hash::ZERO, MinerId::default(), 0, Vec::new(), None, 0);
        block
            .flags
            .store(GENERATED | VERIFIED | NOTARIZED | STATE_COMPUTED, Ordering::Release);
        block
    }

    /// Sign the block hash with the proposer's key.
    pub fn signed(mut self, keys: &KeyPair) -> Self {
        self.signature = keys.sign(self.hash.as_bytes());
        self
    }

    /// Recompute the content hash from the identity fields.
    pub fn compute_hash(&self) -> Hash {
        content_hash(
            self.round,
            &self.prev_hash,
            &self.miner_id,
            &self.txns,
            self.magic_block.as_ref(),
            self.latest_finalized_magic_block_round,
            self.creation_date,
        )
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn prev_hash(&self) -> Hash {
        self.prev_hash
    }

    pub fn miner_id(&self) -> MinerId {
        self.miner_id
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Position of the proposer among the round's generators.
    pub fn round_rank(&self) -> i32 {
        self.round_rank
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.txns
    }

    pub fn magic_block(&self) -> Option<&MagicBlock> {
        self.magic_block.as_ref()
    }

    /// Starting round of the magic block governing this block's round.
    pub fn latest_finalized_magic_block_round(&self) -> u64 {
        self.latest_finalized_magic_block_round
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn creation_date(&self) -> u64 {
        self.creation_date
    }

    /// Time elapsed since the block was created.
    pub fn age(&self) -> Duration {
        let now = unix_millis(SystemTime::now());
        Duration::from_millis(now.saturating_sub(self.creation_date))
    }

    // ── lifecycle flags ────────────────────────────────────────────

    pub fn is_generated(&self) -> bool {
        self.flags.load(Ordering::Acquire) & GENERATED != 0
    }

    pub fn is_verified(&self) -> bool {
        self.flags.load(Ordering::Acquire) & VERIFIED != 0
    }

    pub fn set_verified(&self) {
        self.flags.fetch_or(VERIFIED, Ordering::AcqRel);
    }

    pub fn is_notarized(&self) -> bool {
        self.flags.load(Ordering::Acquire) & NOTARIZED != 0
    }

    /// Mark the block notarized. Returns true only for the transition
    /// that actually set the flag, so per-block side effects run once.
    pub fn set_notarized(&self) -> bool {
        self.flags.fetch_or(NOTARIZED, Ordering::AcqRel) & NOTARIZED == 0
    }

    pub fn is_state_computed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & STATE_COMPUTED != 0
    }

    pub fn set_state_computed(&self) {
        self.flags.fetch_or(STATE_COMPUTED, Ordering::AcqRel);
    }

    // ── verification tickets ───────────────────────────────────────

    /// Insert a ticket, rejecting duplicates by verifier identity.
    pub fn add_verification_ticket(&self, ticket: VerificationTicket) -> bool {
        let mut inner = self.inner.write().expect("block lock poisoned");
        if !inner.verifiers.insert(ticket.verifier_id) {
            return false;
        }
        inner.tickets.push(ticket);
        true
    }

    /// Merge already-validated tickets. Returns how many were new.
    pub fn merge_verification_tickets(&self, tickets: Vec<VerificationTicket>) -> usize {
        let mut inner = self.inner.write().expect("block lock poisoned");
        let mut added = 0;
        for ticket in tickets {
            if inner.verifiers.insert(ticket.verifier_id) {
                inner.tickets.push(ticket);
                added += 1;
            }
        }
        added
    }

    /// Snapshot of the current ticket set.
    pub fn verification_tickets(&self) -> Vec<VerificationTicket> {
        self.inner
            .read()
            .expect("block lock poisoned")
            .tickets
            .clone()
    }

    pub fn verification_tickets_len(&self) -> usize {
        self.inner.read().expect("block lock poisoned").tickets.len()
    }

    pub fn has_ticket_from(&self, verifier_id: &MinerId) -> bool {
        self.inner
            .read()
            .expect("block lock poisoned")
            .verifiers
            .contains(verifier_id)
    }

    // ── unique block extensions ────────────────────────────────────

    /// Record a distinct child block that extended this one.
    pub fn add_unique_block_extension(&self, child: Hash) -> bool {
        self.inner
            .write()
            .expect("block lock poisoned")
            .unique_extensions
            .insert(child)
    }

    pub fn unique_block_extension_count(&self) -> usize {
        self.inner
            .read()
            .expect("block lock poisoned")
            .unique_extensions
            .len()
    }

    // ── previous-block linkage ─────────────────────────────────────

    pub fn prev_block(&self) -> Option<Arc<Block>> {
        self.inner
            .read()
            .expect("block lock poisoned")
            .prev_block
            .clone()
    }

    /// Link the parent block. The link is write-once: relinking to the
    /// same parent is a no-op, a different parent is an invariant
    /// violation.
    ///
    /// # Panics
    ///
    /// Panics if a different previous block was already linked.
    pub fn set_previous_block(&self, prev: &Arc<Block>) {
        let mut inner = self.inner.write().expect("block lock poisoned");
        if let Some(existing) = &inner.prev_block {
            if existing.hash != prev.hash {
                panic!(
                    "previous-block link of {} already set to {}, refusing {}",
                    self.hash, existing.hash, prev.hash
                );
            }
            return;
        }
        inner.prev_block = Some(Arc::clone(prev));
    }

    /// Drop the parent link. Used when pruning dead forks so removed
    /// blocks do not keep ancestor chains alive.
    pub fn clear_prev_block(&self) {
        self.inner.write().expect("block lock poisoned").prev_block = None;
    }

    // ── state database handle ──────────────────────────────────────

    /// Attach the state database rooted at the parent's post-state.
    pub fn set_state_db(&self, prev: &Arc<Block>, db: Arc<dyn StateDb>) {
        debug_assert_eq!(prev.hash, self.prev_hash, "state db rooted at wrong parent");
        self.inner.write().expect("block lock poisoned").state_db = Some(db);
    }

    pub fn state_db(&self) -> Option<Arc<dyn StateDb>> {
        self.inner
            .read()
            .expect("block lock poisoned")
            .state_db
            .clone()
    }

    /// Summary record for the finalized ring buffer.
    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            hash: self.hash,
            round: self.round,
            miner_id: self.miner_id,
            txn_count: self.txns.len(),
            creation_date: self.creation_date,
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("hash", &self.hash)
            .field("round", &self.round)
            .field("prev_hash", &self.prev_hash)
            .field("miner_id", &self.miner_id)
            .field("round_rank", &self.round_rank)
            .field("txns", &self.txns.len())
            .field("tickets", &self.verification_tickets_len())
            .field("notarized", &self.is_notarized())
            .finish()
    }
}

/// Summary of a finalized block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub hash: Hash,
    pub round: u64,
    pub miner_id: MinerId,
    pub txn_count: usize,
    pub creation_date: u64,
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn content_hash(
    round: u64,
    prev_hash: &Hash,
    miner_id: &MinerId,
    txns: &[Transaction],
    magic_block: Option<&MagicBlock>,
    latest_finalized_magic_block_round: u64,
    creation_date: u64,
) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&round.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(miner_id.0.as_bytes());
    hasher.update(&latest_finalized_magic_block_round.to_le_bytes());
    hasher.update(&creation_date.to_le_bytes());
    hasher.update(&(txns.len() as u64).to_le_bytes());
    for txn in txns {
        hasher.update(txn.hash.as_bytes());
    }
    if let Some(mb) = magic_block {
        hasher.update(&mb.starting_round.to_le_bytes());
    }
    Hash::new(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn test_block(round: u64, prev_hash: Hash) -> Arc<Block> {
        Arc::new(Block::new(
            round,
            prev_hash,
            MinerId(Hash::digest(b"miner")),
            0,
            Vec::new(),
            None,
            0,
        ))
    }

    fn ticket(seed: u8) -> VerificationTicket {
        VerificationTicket {
            verifier_id: MinerId(Hash::digest(&[seed])),
            signature: Signature::zero(),
        }
    }

    #[test]
    fn ticket_insertion_is_idempotent_per_verifier() {
        let block = test_block(1, Hash::ZERO);
        assert!(block.add_verification_ticket(ticket(1)));
        assert!(!block.add_verification_ticket(ticket(1)));
        assert!(block.add_verification_ticket(ticket(2)));
        assert_eq!(block.verification_tickets_len(), 2);
    }

    #[test]
    fn merge_counts_only_new_tickets() {
        let block = test_block(1, Hash::ZERO);
        block.add_verification_ticket(ticket(1));
        let added = block.merge_verification_tickets(vec![ticket(1), ticket(2), ticket(3)]);
        assert_eq!(added, 2);
        assert_eq!(block.verification_tickets_len(), 3);
    }

    #[test]
    fn notarized_flag_transitions_once() {
        let block = test_block(1, Hash::ZERO);
        assert!(!block.is_notarized());
        assert!(block.set_notarized());
        assert!(!block.set_notarized());
        assert!(block.is_notarized());
    }

    #[test]
    fn prev_link_is_write_once() {
        let parent = test_block(1, Hash::ZERO);
        let child = test_block(2, parent.hash());
        child.set_previous_block(&parent);
        // Relinking the same parent is fine.
        child.set_previous_block(&parent);
        assert_eq!(child.prev_block().unwrap().hash(), parent.hash());
    }

    #[test]
    #[should_panic(expected = "previous-block link")]
    fn conflicting_prev_link_panics() {
        let parent = test_block(1, Hash::ZERO);
        let child = test_block(2, parent.hash());
        child.set_previous_block(&parent);
        let other = test_block(1, Hash::digest(b"fork"));
        child.set_previous_block(&other);
    }

    #[test]
    fn unique_extensions_deduplicate() {
        let block = test_block(1, Hash::ZERO);
        let child = Hash::digest(b"child");
        assert!(block.add_unique_block_extension(child));
        assert!(!block.add_unique_block_extension(child));
        assert_eq!(block.unique_block_extension_count(), 1);
    }

    #[test]
    fn signed_block_verifies_under_proposer_key() {
        let keys = KeyPair::generate();
        let block = Block::new(
            3,
            Hash::digest(b"parent"),
            MinerId::from_public_key(&keys.public_key()),
            0,
            Vec::new(),
            None,
            0,
        )
        .signed(&keys);
        assert!(block
            .signature()
            .verify(block.hash().as_bytes(), &keys.public_key()));
        assert_eq!(block.compute_hash(), block.hash());
    }

    #[test]
    fn genesis_is_fully_settled() {
        let genesis = Block::genesis();
        assert!(genesis.is_notarized());
        assert!(genesis.is_state_computed());
        assert_eq!(genesis.round(), 0);
    }
}
