//! Stable identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Hash, PublicKey};

/// Stable miner identity: the hash of the miner's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct MinerId(pub Hash);

impl MinerId {
    /// Derive the identity of a public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(Hash::digest(public_key.as_bytes()))
    }
}

impl fmt::Display for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

impl fmt::Debug for MinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MinerId({}..)", &self.0.to_hex()[..8])
    }
}
