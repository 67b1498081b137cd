//! Tessera consensus core.
//!
//! Drives a block from `generated → verified → notarized → finalized
//! → deterministically finalized`:
//!
//! - blocks and tickets arrive from a transport and are indexed by
//!   the [`BlockStore`];
//! - tickets accumulate per block, deduplicated by verifier;
//! - the notarization engine checks count/stake thresholds and the
//!   [`TicketVerifier`] confirms the BLS aggregate signature under
//!   the round's miner set;
//! - the finalization pipeline commits state, advances the head
//!   pointers, promotes deterministic finality, and prunes dead
//!   forks;
//! - sync/repair pulls missing ancestors from peers and recomputes
//!   state where the remote has nothing authoritative.
//!
//! The core is transport-agnostic: everything it needs from the
//! outside world comes through the [`BlockFetcher`], [`StateBackend`],
//! and [`BlockStateHandler`] traits. Every suspending operation takes
//! a cancellation token; cancellation propagates through semaphore
//! waits, crypto-pool joins, and collaborator IO, and no chain state
//! mutates on a cancelled path.

mod chain;
mod config;
mod error;
mod finalize;
mod notarization;
mod registry;
mod stats;
mod store;
mod sync;
mod traits;
mod verifier;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use chain::{Chain, NodeIdentity};
pub use config::ChainConfig;
pub use error::ConsensusError;
pub use finalize::PRUNE_DEPTH;
pub use registry::MagicBlockRegistry;
pub use stats::{
    ChainStats, ChainStatsSnapshot, FeeStats, FinalizedRing, LatencyTimer, MinerStats,
};
pub use store::BlockStore;
pub use traits::{
    BlockFetcher, BlockStateHandler, FetchError, HandlerError, StateBackend, StateError,
};
pub use verifier::TicketVerifier;
