//! Bounded-concurrency aggregate ticket verification.
//!
//! A semaphore of `tickets_verifier_slots` permits gates entry;
//! callers that cannot acquire a slot before their context is
//! cancelled fail with `Cancelled` instead of queueing unbounded
//! work. Inside the slot the aggregate computation runs on a
//! dedicated crypto thread pool and the caller observes completion or
//! cancellation, whichever comes first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tessera_types::{
    aggregate_signatures, verify_aggregate, Hash, PublicKey, Signature, VerificationTicket,
};

use crate::chain::Chain;
use crate::error::ConsensusError;

/// Verifies BLS aggregate signatures over verification tickets under
/// backpressure.
pub struct TicketVerifier {
    permits: Semaphore,
    pool: rayon::ThreadPool,
    pending: Arc<AtomicUsize>,
}

impl TicketVerifier {
    /// Build a verifier with `slots` admission permits and a crypto
    /// pool of `threads` workers.
    pub fn new(slots: usize, threads: usize) -> Result<Self, ConsensusError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("crypto-{i}"))
            .build()
            .map_err(|e| ConsensusError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            permits: Semaphore::new(slots),
            pool,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Aggregate verifications currently queued or running.
    pub fn queue_depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Verify that the aggregate of `signatures` over `block_hash`
    /// verifies against `public_keys`. Holds an admission slot for the
    /// duration of the computation.
    pub async fn verify(
        &self,
        ctx: &CancellationToken,
        block_hash: Hash,
        public_keys: Vec<PublicKey>,
        signatures: Vec<Signature>,
    ) -> Result<(), ConsensusError> {
        let _permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(
                    queue_depth = self.queue_depth(),
                    "tickets verifier is full"
                );
                return Err(ConsensusError::Cancelled);
            }
            permit = self.permits.acquire() => {
                permit.map_err(|_| ConsensusError::Cancelled)?
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        pending.fetch_add(1, Ordering::Relaxed);
        self.pool.spawn(move || {
            let result = compute_aggregate(&block_hash, &public_keys, &signatures);
            pending.fetch_sub(1, Ordering::Relaxed);
            let _ = done_tx.send(result);
        });

        tokio::select! {
            result = done_rx => result.map_err(|_| ConsensusError::Cancelled)?,
            _ = ctx.cancelled() => Err(ConsensusError::Cancelled),
        }
    }
}

fn compute_aggregate(
    block_hash: &Hash,
    public_keys: &[PublicKey],
    signatures: &[Signature],
) -> Result<(), ConsensusError> {
    let aggregate =
        aggregate_signatures(signatures).map_err(|_| ConsensusError::AggregateBuildFailed)?;
    let keys = public_keys
        .iter()
        .map(PublicKey::decode)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConsensusError::KeyDecodeFailed)?;
    if !verify_aggregate(&aggregate, &keys, block_hash.as_bytes()) {
        return Err(ConsensusError::AggregateVerifyFailed);
    }
    Ok(())
}

impl Chain {
    /// Verify tickets aggregately against the miner set of `round`.
    ///
    /// Succeeds iff every ticket's verifier is a miner of the round
    /// and the aggregate BLS signature over the block hash verifies
    /// under their public keys.
    pub async fn verify_tickets(
        &self,
        ctx: &CancellationToken,
        block_hash: Hash,
        tickets: &[VerificationTicket],
        round: u64,
    ) -> Result<(), ConsensusError> {
        if tickets.is_empty() {
            return Err(ConsensusError::NoTickets);
        }
        let mb = self.get_miners(round);
        let mut public_keys = Vec::with_capacity(tickets.len());
        let mut signatures = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            let Some(miner) = mb.miners.get(&ticket.verifier_id) else {
                return Err(ConsensusError::UnknownVerifier(ticket.verifier_id));
            };
            public_keys.push(miner.public_key);
            signatures.push(ticket.signature);
        }
        self.verifier
            .verify(ctx, block_hash, public_keys, signatures)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::KeyPair;

    fn signed_set(message: &Hash, n: usize) -> (Vec<PublicKey>, Vec<Signature>) {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        let public_keys = keys.iter().map(|k| k.public_key()).collect();
        let signatures = keys.iter().map(|k| k.sign(message.as_bytes())).collect();
        (public_keys, signatures)
    }

    #[tokio::test]
    async fn verifies_valid_aggregate() {
        let verifier = TicketVerifier::new(2, 1).unwrap();
        let hash = Hash::digest(b"block");
        let (public_keys, signatures) = signed_set(&hash, 3);
        let ctx = CancellationToken::new();
        verifier
            .verify(&ctx, hash, public_keys, signatures)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_signature_over_different_hash() {
        let verifier = TicketVerifier::new(2, 1).unwrap();
        let hash = Hash::digest(b"block");
        let (public_keys, mut signatures) = signed_set(&hash, 3);
        // Replace one signature with a valid signature over another hash.
        let stranger = KeyPair::generate();
        signatures[1] = stranger.sign(Hash::digest(b"other block").as_bytes());
        let ctx = CancellationToken::new();
        let err = verifier
            .verify(&ctx, hash, public_keys, signatures)
            .await
            .unwrap_err();
        assert_eq!(err, ConsensusError::AggregateVerifyFailed);
    }

    #[tokio::test]
    async fn rejects_malformed_signature_bytes() {
        let verifier = TicketVerifier::new(2, 1).unwrap();
        let hash = Hash::digest(b"block");
        let (public_keys, mut signatures) = signed_set(&hash, 2);
        signatures[0] = Signature::from_bytes([0xff; Signature::SIZE]);
        let ctx = CancellationToken::new();
        let err = verifier
            .verify(&ctx, hash, public_keys, signatures)
            .await
            .unwrap_err();
        assert_eq!(err, ConsensusError::AggregateBuildFailed);
    }

    #[tokio::test]
    async fn rejects_malformed_public_key_bytes() {
        let verifier = TicketVerifier::new(2, 1).unwrap();
        let hash = Hash::digest(b"block");
        let (mut public_keys, signatures) = signed_set(&hash, 2);
        public_keys[0] = PublicKey::from_bytes([0xff; PublicKey::SIZE]);
        let ctx = CancellationToken::new();
        let err = verifier
            .verify(&ctx, hash, public_keys, signatures)
            .await
            .unwrap_err();
        assert_eq!(err, ConsensusError::KeyDecodeFailed);
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_acquiring_slot() {
        let verifier = TicketVerifier::new(1, 1).unwrap();
        let hash = Hash::digest(b"block");
        let (public_keys, signatures) = signed_set(&hash, 1);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = verifier
            .verify(&ctx, hash, public_keys, signatures)
            .await
            .unwrap_err();
        assert_eq!(err, ConsensusError::Cancelled);
    }
}
