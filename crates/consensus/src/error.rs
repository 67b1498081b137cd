//! Consensus error taxonomy.
//!
//! Threshold-not-met (`BlockNotNotarized`) and sync failures are
//! transient: callers may retry as more tickets or peers arrive.
//! Protocol and cryptographic rejections are final for the offending
//! input. Invariant violations do not appear here; they panic.

use thiserror::Error;

use tessera_types::{Hash, MinerId};

/// Errors surfaced by the consensus core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// No verification tickets were supplied for the block.
    #[error("no verification tickets for this block")]
    NoTickets,

    /// Two tickets in the notarization share a verifier.
    #[error("duplicate ticket signature in the notarization of block {0}")]
    DuplicateTicketSignature(Hash),

    /// A ticket's verifier is not in the round's miner set.
    #[error("verifier unknown or not authorized at this time: {0}")]
    UnknownVerifier(MinerId),

    /// The block names a magic block the registry does not govern its
    /// round with.
    #[error("no corresponding magic block, want starting round {want}, got {got}")]
    MagicBlockMismatch { want: u64, got: u64 },

    /// Ticket signature bytes failed to decode or aggregate.
    #[error("failed to aggregate ticket signatures")]
    AggregateBuildFailed,

    /// A miner public key failed to decode.
    #[error("failed to decode miner public keys")]
    KeyDecodeFailed,

    /// The aggregate signature did not verify.
    #[error("failed to verify aggregate ticket signatures")]
    AggregateVerifyFailed,

    /// Tickets are not sufficient to reach notarization. Transient.
    #[error("verification tickets not sufficient to reach notarization")]
    BlockNotNotarized,

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// Neither a remote state-change fetch nor local recomputation
    /// produced the block's state. Transient.
    #[error("sync or compute state failed, round {round}, block {block}")]
    SyncFailed { round: u64, block: Hash },

    /// Persisting a finalized block's state changes failed; the head
    /// was not advanced.
    #[error("save changes failed: {0}")]
    StateSaveFailed(String),

    /// The block failed content or proposer-signature validation.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// The node has no signing identity configured.
    #[error("node has no signing identity")]
    NoIdentity,

    /// A magic block older than the installed one was offered.
    #[error("magic block starting round {new} is older than installed {current}")]
    StaleMagicBlock { new: u64, current: u64 },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BlockNotNotarized | Self::SyncFailed { .. } | Self::Cancelled
        )
    }
}
