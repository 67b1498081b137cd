//! Core types for Tessera consensus.
//!
//! This crate provides the foundational types used throughout the
//! consensus implementation:
//!
//! - **Primitives**: content hashes, BLS keys and signatures
//! - **Identifiers**: `MinerId`
//! - **Consensus types**: `Block`, `VerificationTicket`, `MagicBlock`,
//!   `RoundInfo`
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation
//! layer.

mod block;
mod crypto;
mod hash;
mod identifiers;
mod magic_block;
mod round;
mod transaction;

pub use block::{Block, BlockSummary, StateDb, VerificationTicket};
pub use crypto::{
    aggregate_signatures, verify_aggregate, CryptoError, KeyPair, PublicKey, Signature, DST,
};
pub use hash::{Hash, HexError};
pub use identifiers::MinerId;
pub use magic_block::{MagicBlock, Miner, MinerSet, Thresholds};
pub use round::RoundInfo;
pub use transaction::Transaction;
