//! Transactions as seen by the consensus core.
//!
//! The core never orders or executes transactions; it only carries
//! them through blocks and reads the fee for chain statistics.

use serde::{Deserialize, Serialize};

use crate::Hash;

/// An opaque transaction: content hash plus the fields the chain
/// statistics consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash of the transaction.
    pub hash: Hash,
    /// Fee paid by the transaction.
    pub fee: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub creation_date: u64,
}

impl Transaction {
    /// Build a transaction record.
    pub fn new(hash: Hash, fee: u64, creation_date: u64) -> Self {
        Self {
            hash,
            fee,
            creation_date,
        }
    }
}
