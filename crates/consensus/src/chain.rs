//! The chain: head pointers, registries, and shared resources.
//!
//! Head pointers advance monotonically and are written only by the
//! finalization pipeline; everything else reads them through the
//! accessors here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::warn;

use tessera_types::{Block, KeyPair, MagicBlock, MinerId, RoundInfo};

use crate::config::ChainConfig;
use crate::error::ConsensusError;
use crate::registry::MagicBlockRegistry;
use crate::stats::{ChainStats, FeeStats, FinalizedRing, LatencyTimer, MinerStats};
use crate::store::BlockStore;
use crate::traits::{BlockFetcher, BlockStateHandler, StateBackend};
use crate::verifier::TicketVerifier;

/// This node's signing identity.
pub struct NodeIdentity {
    /// Miner identity, as registered in magic blocks.
    pub id: MinerId,
    /// Signing key for tickets and proposals.
    pub keys: KeyPair,
}

pub(crate) struct FinalizationTimers {
    /// Latency between consecutive finalizations while the chain is
    /// in steady state (consecutive means within 20 s).
    pub steady_state: LatencyTimer,
    /// Latency from block creation to finalization (recorded when
    /// under 100 s).
    pub start_to_finalize: LatencyTimer,
    pub last_finalized_at: Mutex<Option<Instant>>,
}

/// The consensus core. Shared as `Arc<Chain>`; all mutation goes
/// through guarded interior state.
pub struct Chain {
    pub(crate) config: ChainConfig,
    pub(crate) registry: MagicBlockRegistry,
    pub(crate) store: BlockStore,
    pub(crate) verifier: TicketVerifier,

    pub(crate) state: Arc<dyn StateBackend>,
    pub(crate) fetcher: Arc<dyn BlockFetcher>,
    pub(crate) handler: Arc<dyn BlockStateHandler>,
    pub(crate) identity: Option<NodeIdentity>,

    current_round: AtomicU64,
    latest_own_finalized_round: AtomicU64,
    lfb: RwLock<Arc<Block>>,
    latest_finalized_magic_block: RwLock<Option<Arc<Block>>>,
    latest_deterministic_block: RwLock<Arc<Block>>,

    rounds: RwLock<HashMap<u64, Arc<RoundInfo>>>,
    pub(crate) summaries: RwLock<FinalizedRing>,
    pub(crate) fee_stats: RwLock<FeeStats>,
    pub(crate) stats: ChainStats,
    pub(crate) miner_stats: RwLock<HashMap<MinerId, MinerStats>>,
    pub(crate) timers: FinalizationTimers,
}

impl Chain {
    /// Build a chain rooted at `genesis` under the genesis committee.
    pub fn new(
        config: ChainConfig,
        genesis: Arc<Block>,
        genesis_mb: MagicBlock,
        state: Arc<dyn StateBackend>,
        fetcher: Arc<dyn BlockFetcher>,
        handler: Arc<dyn BlockStateHandler>,
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        let verifier =
            TicketVerifier::new(config.tickets_verifier_slots, config.crypto_threads)?;
        let store = BlockStore::new();
        let genesis = store.add_block(genesis);
        let capacity = config.finalized_summary_capacity;

        Ok(Self {
            config,
            registry: MagicBlockRegistry::new(genesis_mb),
            store,
            verifier,
            state,
            fetcher,
            handler,
            identity: None,
            current_round: AtomicU64::new(genesis.round()),
            latest_own_finalized_round: AtomicU64::new(genesis.round()),
            lfb: RwLock::new(Arc::clone(&genesis)),
            latest_finalized_magic_block: RwLock::new(None),
            latest_deterministic_block: RwLock::new(genesis),
            rounds: RwLock::new(HashMap::new()),
            summaries: RwLock::new(FinalizedRing::new(capacity)),
            fee_stats: RwLock::new(FeeStats::default()),
            stats: ChainStats::default(),
            miner_stats: RwLock::new(HashMap::new()),
            timers: FinalizationTimers {
                steady_state: LatencyTimer::default(),
                start_to_finalize: LatencyTimer::default(),
                last_finalized_at: Mutex::new(None),
            },
        })
    }

    /// Attach this node's signing identity.
    pub fn with_identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    // ── head pointers ──────────────────────────────────────────────

    pub fn current_round(&self) -> u64 {
        self.current_round.load(Ordering::Acquire)
    }

    /// Advance the current round. Never moves backward.
    pub fn set_current_round(&self, round: u64) {
        self.current_round.fetch_max(round, Ordering::AcqRel);
    }

    pub fn latest_finalized_block(&self) -> Arc<Block> {
        Arc::clone(&self.lfb.read().expect("chain lock poisoned"))
    }

    /// Advance the latest finalized block. Never moves backward.
    pub(crate) fn set_latest_finalized_block(&self, block: &Arc<Block>) {
        let mut lfb = self.lfb.write().expect("chain lock poisoned");
        if block.round() < lfb.round() {
            warn!(
                round = block.round(),
                lfb_round = lfb.round(),
                "refusing to move latest finalized block backward"
            );
            return;
        }
        *lfb = Arc::clone(block);
    }

    pub fn latest_own_finalized_round(&self) -> u64 {
        self.latest_own_finalized_round.load(Ordering::Acquire)
    }

    pub(crate) fn set_latest_own_finalized_round(&self, round: u64) {
        self.latest_own_finalized_round
            .fetch_max(round, Ordering::AcqRel);
    }

    /// The block that carried the latest finalized magic block.
    pub fn latest_finalized_magic_block(&self) -> Option<Arc<Block>> {
        self.latest_finalized_magic_block
            .read()
            .expect("chain lock poisoned")
            .clone()
    }

    pub(crate) fn set_latest_finalized_magic_block(&self, block: &Arc<Block>) {
        let mut lfmb = self
            .latest_finalized_magic_block
            .write()
            .expect("chain lock poisoned");
        if let Some(current) = &*lfmb {
            if block.round() < current.round() {
                warn!(
                    round = block.round(),
                    lfmb_round = current.round(),
                    "refusing to move latest finalized magic block backward"
                );
                return;
            }
        }
        *lfmb = Some(Arc::clone(block));
    }

    /// The most recent block promoted to permanent finality.
    pub fn latest_deterministic_block(&self) -> Arc<Block> {
        Arc::clone(
            &self
                .latest_deterministic_block
                .read()
                .expect("chain lock poisoned"),
        )
    }

    /// Promote the latest deterministic block. One-way: once set it is
    /// never rolled back.
    pub(crate) fn set_latest_deterministic_block(&self, block: &Arc<Block>) {
        let mut ldb = self
            .latest_deterministic_block
            .write()
            .expect("chain lock poisoned");
        if block.round() < ldb.round() {
            return;
        }
        *ldb = Arc::clone(block);
    }

    // ── magic blocks & miners ──────────────────────────────────────

    /// The magic block governing `round`. Optimistic beyond the
    /// latest known committee; see [`MagicBlockRegistry::get`].
    pub fn get_magic_block(&self, round: u64) -> Arc<MagicBlock> {
        self.registry.get(round)
    }

    /// Install a new committee.
    pub fn update_magic_block(&self, mb: MagicBlock) -> Result<Arc<MagicBlock>, ConsensusError> {
        self.registry.install(mb)
    }

    /// Miner set of the round's governing committee.
    pub fn get_miners(&self, round: u64) -> Arc<MagicBlock> {
        self.registry.get(round)
    }

    /// Stake of a miner under the round's committee; zero if unknown.
    pub fn mining_stake(&self, round: u64, id: &MinerId) -> u64 {
        self.registry.get(round).miners.stake_of(id)
    }

    // ── rounds ─────────────────────────────────────────────────────

    /// Round bookkeeping entry, created on first use.
    pub fn add_round(&self, number: u64) -> Arc<RoundInfo> {
        let mut rounds = self.rounds.write().expect("chain lock poisoned");
        Arc::clone(
            rounds
                .entry(number)
                .or_insert_with(|| Arc::new(RoundInfo::new(number))),
        )
    }

    pub fn get_round(&self, number: u64) -> Option<Arc<RoundInfo>> {
        self.rounds
            .read()
            .expect("chain lock poisoned")
            .get(&number)
            .cloned()
    }

    pub fn delete_round(&self, number: u64) {
        self.rounds
            .write()
            .expect("chain lock poisoned")
            .remove(&number);
    }

    /// Drop bookkeeping for rounds below `floor`.
    pub fn delete_rounds_below(&self, floor: u64) {
        self.rounds
            .write()
            .expect("chain lock poisoned")
            .retain(|n, _| *n >= floor);
    }

    // ── block store ────────────────────────────────────────────────

    /// Index a block. Idempotent on hash.
    pub fn add_block(&self, block: Arc<Block>) -> Arc<Block> {
        self.store.add_block(block)
    }

    pub fn get_block(&self, hash: &tessera_types::Hash) -> Option<Arc<Block>> {
        self.store.get(hash)
    }

    pub fn get_round_blocks(&self, round: u64) -> Vec<Arc<Block>> {
        self.store.get_round_blocks(round)
    }

    /// Remove dead blocks and free their parent links.
    pub fn delete_blocks(&self, dead: &[Arc<Block>]) {
        self.store.delete_blocks(dead)
    }

    // ── statistics ─────────────────────────────────────────────────

    pub fn stats(&self) -> &ChainStats {
        &self.stats
    }

    pub fn fee_stats(&self) -> FeeStats {
        *self.fee_stats.read().expect("chain lock poisoned")
    }

    pub fn miner_stats(&self, id: &MinerId) -> Option<MinerStats> {
        self.miner_stats
            .read()
            .expect("chain lock poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot of recent finalized block summaries, oldest first.
    pub fn finalized_summaries(&self) -> Vec<tessera_types::BlockSummary> {
        self.summaries
            .read()
            .expect("chain lock poisoned")
            .snapshot()
    }

    /// Mean latency between consecutive steady-state finalizations.
    pub fn steady_state_finalization_latency(&self) -> std::time::Duration {
        self.timers.steady_state.mean()
    }

    /// Mean latency from block creation to finalization.
    pub fn start_to_finalize_latency(&self) -> std::time::Duration {
        self.timers.start_to_finalize.mean()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("current_round", &self.current_round())
            .field("lfb_round", &self.latest_finalized_block().round())
            .field(
                "ldb_round",
                &self.latest_deterministic_block().round(),
            )
            .field("blocks", &self.store.len())
            .field("magic_blocks", &self.registry.len())
            .finish()
    }
}
