//! Finalization pipeline tests: head advancement, the save-changes
//! safety gate, deterministic finality, fork pruning, fee stats.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tessera_consensus::testing::{build_block, child_of, test_chain, RecordingHandler, TestChain};
use tessera_consensus::{ChainConfig, ConsensusError};
use tessera_types::{Block, Hash, Thresholds, Transaction, VerificationTicket};

fn config(threshold_by_count: u32) -> ChainConfig {
    ChainConfig {
        threshold_by_count,
        threshold_by_stake: 0,
        ..ChainConfig::default()
    }
}

fn notarize(t: &TestChain, block: &Arc<Block>, signers: usize) {
    let tickets: Vec<VerificationTicket> = (0..signers)
        .map(|i| t.committee.ticket(i, &block.hash()))
        .collect();
    t.chain.merge_verification_tickets(block, tickets);
    assert!(block.is_notarized());
}

/// Extend the chain by one notarized, finalized block.
async fn extend_and_finalize(
    t: &TestChain,
    parent: &Arc<Block>,
    proposer: usize,
    signers: usize,
) -> Arc<Block> {
    let block = child_of(parent, &t.committee, proposer);
    block.set_previous_block(parent);
    block.set_state_computed();
    let block = t.chain.add_block(block);
    notarize(t, &block, signers);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();
    block
}

async fn wait_for_handler(handler: &RecordingHandler, hash: Hash) {
    for _ in 0..100 {
        if handler.finalized().contains(&hash) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handler did not observe block {hash}");
}

#[tokio::test]
async fn finalize_advances_heads_and_notifies_handler() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;

    assert_eq!(t.chain.latest_finalized_block().hash(), b1.hash());
    assert_eq!(t.chain.latest_own_finalized_round(), 1);
    assert!(t.backend.saved().contains(&b1.hash()));
    assert!(t.backend.rebased().contains(&b1.hash()));
    assert_eq!(t.chain.stats().snapshot().finalized_blocks, 1);

    let summaries = t.chain.finalized_summaries();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].hash, b1.hash());

    wait_for_handler(&t.handler, b1.hash()).await;
}

#[tokio::test]
async fn save_changes_failure_aborts_without_advancing() {
    let t = test_chain(config(67), 4);
    let block = child_of(&t.genesis, &t.committee, 0);
    block.set_previous_block(&t.genesis);
    let block = t.chain.add_block(block);
    notarize(&t, &block, 3);

    t.backend.fail_save(true);
    let ctx = CancellationToken::new();
    let err = t.chain.finalize_block(&ctx, &block).await.unwrap_err();
    assert!(matches!(err, ConsensusError::StateSaveFailed(_)));

    assert_eq!(t.chain.latest_finalized_block().hash(), t.genesis.hash());
    assert!(t.chain.finalized_summaries().is_empty());
    assert!(t.handler.finalized().is_empty());
}

#[tokio::test]
async fn lfb_round_is_non_decreasing() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    let b2 = extend_and_finalize(&t, &b1, 1, 3).await;

    // Re-finalizing an older block must not move the head backward.
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &b1).await.unwrap();
    assert_eq!(t.chain.latest_finalized_block().hash(), b2.hash());
    assert_eq!(t.chain.latest_finalized_block().round(), 2);
}

#[tokio::test]
async fn handler_failure_does_not_unwind_finalization() {
    let t = test_chain(config(67), 4);
    t.handler.fail(true);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    assert_eq!(t.chain.latest_finalized_block().hash(), b1.hash());
}

#[tokio::test]
async fn fee_stats_use_integer_mean() {
    let t = test_chain(config(67), 4);
    let txns = vec![
        Transaction::new(Hash::digest(b"t1"), 100, 0),
        Transaction::new(Hash::digest(b"t2"), 200, 0),
        Transaction::new(Hash::digest(b"t3"), 301, 0),
    ];
    let block = build_block(&t.genesis, &t.committee, 0, 0, txns, 0);
    block.set_previous_block(&t.genesis);
    let block = t.chain.add_block(block);
    notarize(&t, &block, 3);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();

    let fees = t.chain.fee_stats();
    // (100 + 200 + 301) / 3 = 200 by integer division.
    assert_eq!(fees.mean_fees, 200);
    assert_eq!(fees.max_fees, 200);
    assert_eq!(fees.min_fees, 200);
}

#[tokio::test]
async fn finalized_ring_advances_one_slot_per_block() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    let b2 = extend_and_finalize(&t, &b1, 1, 3).await;
    let b3 = extend_and_finalize(&t, &b2, 2, 3).await;

    let rounds: Vec<u64> = t
        .chain
        .finalized_summaries()
        .iter()
        .map(|s| s.round)
        .collect();
    assert_eq!(rounds, vec![1, 2, 3]);
    assert_eq!(t.chain.finalized_summaries().last().unwrap().hash, b3.hash());
}

#[tokio::test]
async fn embedded_magic_block_installs_on_finalize() {
    let t = test_chain(config(67), 4);
    let mb = t.committee.magic_block(
        5,
        Thresholds {
            by_count: 67,
            by_stake: 0,
        },
    );
    let block = Arc::new(
        Block::new(
            1,
            t.genesis.hash(),
            t.committee.id(0),
            0,
            Vec::new(),
            Some(mb),
            0,
        )
        .signed(&t.committee.keys[0]),
    );
    block.set_previous_block(&t.genesis);
    let block = t.chain.add_block(block);
    notarize(&t, &block, 3);

    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();

    assert_eq!(t.chain.get_magic_block(5).starting_round, 5);
    assert_eq!(t.chain.get_magic_block(4).starting_round, 0);
    assert_eq!(
        t.chain.latest_finalized_magic_block().unwrap().hash(),
        block.hash()
    );
}

#[tokio::test]
async fn deterministic_finality_at_supermajority_of_extenders() {
    // Ten miners, 67%: seven distinct children satisfy
    // 7 * 100 >= 10 * 67.
    let t = test_chain(config(67), 10);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 7).await;

    for proposer in 0..7 {
        let child = child_of(&b1, &t.committee, proposer);
        let child = t.chain.add_block(child);
        notarize(&t, &child, 7);
    }
    assert_eq!(b1.unique_block_extension_count(), 7);
    assert!(t.chain.is_finalized_deterministically(&b1));

    // The promotion happens on the next finalize pass.
    let next = t.chain.get_round_blocks(2).into_iter().next().unwrap();
    next.set_previous_block(&b1);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &next).await.unwrap();

    let ldb = t.chain.latest_deterministic_block();
    assert_eq!(ldb.hash(), b1.hash());
    // The deterministic pointer never runs ahead of the finalized one.
    assert!(ldb.round() <= t.chain.latest_finalized_block().round());
}

#[tokio::test]
async fn deterministic_finality_needs_full_supermajority() {
    // Six children of ten miners: 600 < 670.
    let t = test_chain(config(67), 10);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 7).await;

    for proposer in 0..6 {
        let child = child_of(&b1, &t.committee, proposer);
        let child = t.chain.add_block(child);
        notarize(&t, &child, 7);
    }
    assert_eq!(b1.unique_block_extension_count(), 6);
    assert!(!t.chain.is_finalized_deterministically(&b1));
}

#[tokio::test]
async fn deterministic_finality_never_ahead_of_lfb() {
    let t = test_chain(config(67), 4);
    let block = child_of(&t.genesis, &t.committee, 0);
    let block = t.chain.add_block(block);
    for proposer in 0..4 {
        let child = child_of(&block, &t.committee, proposer);
        let child = t.chain.add_block(child);
        notarize(&t, &child, 3);
    }
    // Plenty of extenders, but the block is not finalized yet.
    assert!(!t.chain.is_finalized_deterministically(&block));
}

#[tokio::test]
async fn dead_fork_is_pruned_at_depth_ten() {
    let t = test_chain(config(67), 4);

    // Two competing proposals at round 1.
    let p = child_of(&t.genesis, &t.committee, 0);
    p.set_previous_block(&t.genesis);
    let p = t.chain.add_block(p);
    let q = child_of(&t.genesis, &t.committee, 1);
    let q = t.chain.add_block(q);

    notarize(&t, &p, 3);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &p).await.unwrap();

    // Ten more finalized rounds on top of p.
    let mut tip = p.clone();
    for round in 2..=11 {
        tip = extend_and_finalize(&t, &tip, (round % 4) as usize, 3).await;
    }

    // The dead sibling at round 1 is gone; the kept block remains.
    assert!(t.chain.get_block(&q.hash()).is_none());
    assert!(t.chain.get_block(&p.hash()).is_some());
    let survivors = t.chain.get_round_blocks(1);
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].hash(), p.hash());
}

#[tokio::test]
async fn fork_switch_records_rollback() {
    let t = test_chain(config(67), 4);
    let p = child_of(&t.genesis, &t.committee, 0);
    p.set_previous_block(&t.genesis);
    let p = t.chain.add_block(p);
    notarize(&t, &p, 3);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &p).await.unwrap();
    assert_eq!(t.chain.stats().snapshot().rollback_count, 0);

    // A competing proposal at the same round wins finalization: the
    // previously finalized block is rolled back.
    let q = child_of(&t.genesis, &t.committee, 1);
    q.set_previous_block(&t.genesis);
    let q = t.chain.add_block(q);
    notarize(&t, &q, 3);
    t.chain.finalize_block(&ctx, &q).await.unwrap();

    let snap = t.chain.stats().snapshot();
    assert_eq!(snap.rollback_count, 1);
    assert_eq!(snap.longest_rollback_length, 1);
    assert_eq!(t.chain.latest_finalized_block().hash(), q.hash());
}

#[tokio::test]
async fn extending_the_finalized_chain_is_not_a_rollback() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    let _b2 = extend_and_finalize(&t, &b1, 1, 3).await;
    assert_eq!(t.chain.stats().snapshot().rollback_count, 0);
}

#[tokio::test]
async fn synced_round_counts_as_zero_notarized() {
    let t = test_chain(config(67), 4);
    // A block adopted through sync: finalized without ever being
    // locally notarized.
    let block = child_of(&t.genesis, &t.committee, 0);
    block.set_previous_block(&t.genesis);
    block.set_state_computed();
    let block = t.chain.add_block(block);

    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();

    let snap = t.chain.stats().snapshot();
    assert_eq!(snap.zero_notarized_blocks_count, 1);
    assert_eq!(t.chain.latest_finalized_block().hash(), block.hash());
}

#[tokio::test]
async fn notarized_rounds_do_not_count_as_zero_notarized() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    let _b2 = extend_and_finalize(&t, &b1, 1, 3).await;
    assert_eq!(t.chain.stats().snapshot().zero_notarized_blocks_count, 0);
}

#[tokio::test]
async fn stale_blocks_bypass_magic_block_mismatch() {
    let t = test_chain(config(67), 4);
    let b1 = extend_and_finalize(&t, &t.genesis, 0, 3).await;
    let _b2 = extend_and_finalize(&t, &b1, 1, 3).await;

    // Round 1 is below the LFB round: mismatch check skipped.
    let stale = build_block(&t.genesis, &t.committee, 2, 0, Vec::new(), 9);
    assert_eq!(stale.round(), 1);
    t.chain.verify_related_mb_presence(&stale).unwrap();

    // At the LFB round the check applies again.
    let at_lfb = build_block(&b1, &t.committee, 2, 0, Vec::new(), 9);
    assert_eq!(at_lfb.round(), 2);
    let err = t.chain.verify_related_mb_presence(&at_lfb).unwrap_err();
    assert_eq!(err, ConsensusError::MagicBlockMismatch { want: 9, got: 0 });
}

#[tokio::test]
async fn finalization_records_miner_stats_by_rank() {
    let t = test_chain(config(67), 4);
    let block = build_block(&t.genesis, &t.committee, 1, 1, Vec::new(), 0);
    block.set_previous_block(&t.genesis);
    let block = t.chain.add_block(block);
    notarize(&t, &block, 3);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();

    let stats = t.chain.miner_stats(&t.committee.id(1)).unwrap();
    assert_eq!(stats.finalization_count_by_rank, vec![0, 1]);
}

#[tokio::test]
async fn out_of_range_round_rank_is_tolerated() {
    let t = test_chain(config(67), 4);
    // generators_num is 2; rank 7 is out of range and only warned.
    let block = build_block(&t.genesis, &t.committee, 0, 7, Vec::new(), 0);
    block.set_previous_block(&t.genesis);
    let block = t.chain.add_block(block);
    notarize(&t, &block, 3);
    let ctx = CancellationToken::new();
    t.chain.finalize_block(&ctx, &block).await.unwrap();

    assert_eq!(t.chain.latest_finalized_block().hash(), block.hash());
    assert!(t.chain.miner_stats(&t.committee.id(0)).is_none());
}
