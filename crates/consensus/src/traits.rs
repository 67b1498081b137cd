//! Collaborator interfaces.
//!
//! The consensus core consumes signed blocks and tickets from a
//! transport and drives consensus invariants over them; everything it
//! needs from the outside world comes through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use tessera_types::{Block, StateDb};

/// Errors from remote block and state-change fetches.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The remote has no state change for the block.
    #[error("remote state change unavailable: {0}")]
    StateChangeUnavailable(String),

    /// The pull returned no blocks.
    #[error("pull returned no blocks")]
    Empty,

    /// The fetch was cancelled.
    #[error("fetch cancelled")]
    Cancelled,
}

/// Errors from the state backend.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    /// Persisting state changes failed.
    #[error("state persistence failed: {0}")]
    Persist(String),

    /// Deterministic local re-execution failed.
    #[error("local state recomputation failed: {0}")]
    Compute(String),

    /// The operation was cancelled.
    #[error("state operation cancelled")]
    Cancelled,
}

/// Error returned by the post-finalization handler.
#[derive(Debug, Clone, Error)]
#[error("finalized-block handler failed: {0}")]
pub struct HandlerError(pub String);

/// Pulls notarized ancestors and authoritative state changes from
/// peers.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Pull up to `num` notarized ancestors of `tip`, ordered oldest
    /// first and ending at `tip`'s parent. An empty vec means the
    /// remote had nothing; the caller treats that as retryable.
    async fn pull_notarized_blocks(
        &self,
        ctx: &CancellationToken,
        tip: &Arc<Block>,
        num: u64,
    ) -> Vec<Arc<Block>>;

    /// Fetch the authoritative state change for `block` and apply it,
    /// marking the block's state computed on success.
    async fn sync_block_state_change(&self, block: &Arc<Block>) -> Result<(), FetchError>;
}

/// Owns the state trie during commit.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Handle to the node's state database.
    fn state_db(&self) -> Arc<dyn StateDb>;

    /// Persist the block's state changes. This is the single safety
    /// gate of finalization: on failure the head does not advance.
    async fn save_changes(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), StateError>;

    /// Deterministically re-execute the block against its parent's
    /// state, marking the block's state computed on success.
    async fn compute_state_local(
        &self,
        ctx: &CancellationToken,
        block: &Arc<Block>,
    ) -> Result<(), StateError>;

    /// Rebase the state trie on the newly finalized block. Readers
    /// see either the pre- or post-commit snapshot, never a torn view.
    fn rebase(&self, block: &Arc<Block>);
}

/// External observer of finalization. Invoked fire-and-forget; it
/// must be idempotent and its failures never unwind chain state.
#[async_trait]
pub trait BlockStateHandler: Send + Sync {
    async fn update_finalized_block(&self, block: Arc<Block>) -> Result<(), HandlerError>;
}
