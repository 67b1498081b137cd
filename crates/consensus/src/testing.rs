//! In-memory collaborator stubs and fixture builders.
//!
//! Used by the integration suite and available to downstream crates
//! through the `test-utils` feature.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tessera_types::{
    Block, Hash, KeyPair, MagicBlock, Miner, MinerId, MinerSet, StateDb, Thresholds, Transaction,
    VerificationTicket,
};

use crate::chain::{Chain, NodeIdentity};
use crate::config::ChainConfig;
use crate::traits::{
    BlockFetcher, BlockStateHandler, FetchError, HandlerError, StateBackend, StateError,
};

/// Trivial state database handle.
pub struct MemoryStateDb;

impl StateDb for MemoryStateDb {}

/// State backend that tracks saves and can be told to fail.
pub struct MemoryStateBackend {
    db: Arc<MemoryStateDb>,
    fail_save: AtomicBool,
    fail_compute: AtomicBool,
    saved: Mutex<Vec<Hash>>,
    rebased: Mutex<Vec<Hash>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self {
            db: Arc::new(MemoryStateDb),
            fail_save: AtomicBool::new(false),
            fail_compute: AtomicBool::new(false),
            saved: Mutex::new(Vec::new()),
            rebased: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::Release);
    }

    pub fn fail_compute(&self, fail: bool) {
        self.fail_compute.store(fail, Ordering::Release);
    }

    pub fn saved(&self) -> Vec<Hash> {
        self.saved.lock().expect("test lock poisoned").clone()
    }

    pub fn rebased(&self) -> Vec<Hash> {
        self.rebased.lock().expect("test lock poisoned").clone()
    }
}

impl Default for MemoryStateBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    fn state_db(&self) -> Arc<dyn StateDb> {
        Arc::clone(&self.db) as Arc<dyn StateDb>
    }

    async fn save_changes(
        &self,
        _ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), StateError> {
        if self.fail_save.load(Ordering::Acquire) {
            return Err(StateError::Persist("injected failure".to_string()));
        }
        self.saved
            .lock()
            .expect("test lock poisoned")
            .push(block.hash());
        Ok(())
    }

    async fn compute_state_local(
        &self,
        _ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), StateError> {
        if self.fail_compute.load(Ordering::Acquire) {
            return Err(StateError::Compute("injected failure".to_string()));
        }
        block.set_state_computed();
        Ok(())
    }

    fn rebase(&self, block: &Arc<Block>) {
        self.rebased
            .lock()
            .expect("test lock poisoned")
            .push(block.hash());
    }
}

/// Fetcher serving ancestors from a registered block map, walking the
/// parent hashes back from the requested tip.
pub struct ChainFetcher {
    blocks: RwLock<HashMap<Hash, Arc<Block>>>,
    state_changes_available: AtomicBool,
    unavailable: Mutex<HashSet<Hash>>,
}

impl ChainFetcher {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            state_changes_available: AtomicBool::new(true),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    /// Make a block pullable.
    pub fn register(&self, block: &Arc<Block>) {
        self.blocks
            .write()
            .expect("test lock poisoned")
            .insert(block.hash(), Arc::clone(block));
    }

    /// Toggle remote state-change availability globally.
    pub fn set_state_changes_available(&self, available: bool) {
        self.state_changes_available
            .store(available, Ordering::Release);
    }

    /// Mark a single block's state change as unavailable remotely.
    pub fn set_state_change_unavailable(&self, hash: Hash) {
        self.unavailable
            .lock()
            .expect("test lock poisoned")
            .insert(hash);
    }
}

impl Default for ChainFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockFetcher for ChainFetcher {
    async fn pull_notarized_blocks(
        &self,
        _ctx: &CancellationToken,
        tip: &Arc<Block>,
        num: u64,
    ) -> Vec<Arc<Block>> {
        let blocks = self.blocks.read().expect("test lock poisoned");
        let mut chain = Vec::new();
        let mut cursor = tip.prev_hash();
        for _ in 0..num {
            let Some(block) = blocks.get(&cursor) else {
                break;
            };
            chain.push(Arc::clone(block));
            cursor = block.prev_hash();
        }
        chain.reverse();
        chain
    }

    async fn sync_block_state_change(&self, block: &Arc<Block>) -> Result<(), FetchError> {
        let globally = self.state_changes_available.load(Ordering::Acquire);
        let blocked = self
            .unavailable
            .lock()
            .expect("test lock poisoned")
            .contains(&block.hash());
        if !globally || blocked {
            return Err(FetchError::StateChangeUnavailable(
                block.hash().to_hex(),
            ));
        }
        block.set_state_computed();
        Ok(())
    }
}

/// Handler recording finalized blocks; can be told to fail.
pub struct RecordingHandler {
    finalized: Mutex<Vec<Hash>>,
    fail: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            finalized: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn finalized(&self) -> Vec<Hash> {
        self.finalized.lock().expect("test lock poisoned").clone()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStateHandler for RecordingHandler {
    async fn update_finalized_block(&self, block: Arc<Block>) -> Result<(), HandlerError> {
        if self.fail.load(Ordering::Acquire) {
            return Err(HandlerError("injected failure".to_string()));
        }
        self.finalized
            .lock()
            .expect("test lock poisoned")
            .push(block.hash());
        Ok(())
    }
}

/// A committee with its signing keys.
pub struct TestCommittee {
    seeds: Vec<[u8; 32]>,
    pub keys: Vec<KeyPair>,
    pub miners: MinerSet,
}

/// Process-unique key material so committees generated by different
/// tests never share keys.
fn fresh_seed() -> [u8; 32] {
    use std::sync::atomic::AtomicU64;
    static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = SEED_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut material = *b"tessera-test-committee-seed-----";
    material[24..].copy_from_slice(&n.to_le_bytes());
    *Hash::digest(&material).as_bytes()
}

impl TestCommittee {
    /// Generate `n` miners with `stake` each.
    pub fn generate(n: usize, stake: u64) -> Self {
        let seeds: Vec<[u8; 32]> = (0..n).map(|_| fresh_seed()).collect();
        let keys: Vec<KeyPair> = seeds
            .iter()
            .map(|seed| KeyPair::from_ikm(seed).expect("seed is valid key material"))
            .collect();
        let miners = MinerSet::new(
            keys.iter()
                .map(|k| {
                    let public_key = k.public_key();
                    Miner::new(MinerId::from_public_key(&public_key), public_key, stake)
                })
                .collect(),
        );
        Self {
            seeds,
            keys,
            miners,
        }
    }

    /// A fresh copy of the `i`-th miner's keypair.
    pub fn keypair(&self, i: usize) -> KeyPair {
        KeyPair::from_ikm(&self.seeds[i]).expect("seed is valid key material")
    }

    /// Identity of the `i`-th miner.
    pub fn id(&self, i: usize) -> MinerId {
        MinerId::from_public_key(&self.keys[i].public_key())
    }

    /// Ticket of the `i`-th miner over a block hash.
    pub fn ticket(&self, i: usize, block_hash: &Hash) -> VerificationTicket {
        VerificationTicket {
            verifier_id: self.id(i),
            signature: self.keys[i].sign(block_hash.as_bytes()),
        }
    }

    /// A magic block carrying this committee.
    pub fn magic_block(&self, starting_round: u64, thresholds: Thresholds) -> MagicBlock {
        MagicBlock::new(starting_round, self.miners.clone(), thresholds)
    }
}

/// A fully wired chain over in-memory collaborators.
pub struct TestChain {
    pub chain: Arc<Chain>,
    pub committee: TestCommittee,
    pub genesis: Arc<Block>,
    pub backend: Arc<MemoryStateBackend>,
    pub fetcher: Arc<ChainFetcher>,
    pub handler: Arc<RecordingHandler>,
}

/// Build a chain with `n_miners` equal-stake miners governing from
/// round zero. The node identity is committee member zero.
pub fn test_chain(config: ChainConfig, n_miners: usize) -> TestChain {
    let committee = TestCommittee::generate(n_miners, 100);
    let genesis = Arc::new(Block::genesis());
    let backend = Arc::new(MemoryStateBackend::new());
    let fetcher = Arc::new(ChainFetcher::new());
    let handler = Arc::new(RecordingHandler::new());

    let genesis_mb = committee.magic_block(
        0,
        Thresholds {
            by_count: config.threshold_by_count,
            by_stake: config.threshold_by_stake,
        },
    );

    let identity = NodeIdentity {
        id: committee.id(0),
        keys: committee.keypair(0),
    };

    let chain = Chain::new(
        config,
        Arc::clone(&genesis),
        genesis_mb,
        Arc::clone(&backend) as Arc<dyn StateBackend>,
        Arc::clone(&fetcher) as Arc<dyn BlockFetcher>,
        Arc::clone(&handler) as Arc<dyn BlockStateHandler>,
    )
    .expect("test config is valid")
    .with_identity(identity);

    TestChain {
        chain: Arc::new(chain),
        committee,
        genesis,
        backend,
        fetcher,
        handler,
    }
}

/// Build a signed child block extending `parent`.
pub fn build_block(
    parent: &Arc<Block>,
    committee: &TestCommittee,
    proposer: usize,
    rank: i32,
    txns: Vec<Transaction>,
    lfmb_round: u64,
) -> Arc<Block> {
    let block = Block::new(
        parent.round() + 1,
        parent.hash(),
        committee.id(proposer),
        rank,
        txns,
        None,
        lfmb_round,
    )
    .signed(&committee.keys[proposer]);
    Arc::new(block)
}

/// Shorthand for an empty rank-zero child block.
pub fn child_of(parent: &Arc<Block>, committee: &TestCommittee, proposer: usize) -> Arc<Block> {
    build_block(parent, committee, proposer, 0, Vec::new(), 0)
}
