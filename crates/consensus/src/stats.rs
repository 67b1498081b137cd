//! Chain statistics.
//!
//! All counters are explicit per-chain structs with read-only
//! accessors; nothing global. The latency timers are lock-free so the
//! finalization pipeline never blocks on bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_types::BlockSummary;

/// Per-miner finalization and generation counters, indexed by round
/// rank.
#[derive(Debug, Clone, Default)]
pub struct MinerStats {
    /// How many of this miner's blocks finalized, by round rank.
    pub finalization_count_by_rank: Vec<u64>,
    /// How many blocks this miner generated, by round rank.
    pub generation_count_by_rank: Vec<u64>,
}

impl MinerStats {
    /// Count a finalized block at `rank`.
    pub fn record_finalization(&mut self, rank: usize, num_generators: usize) {
        if self.finalization_count_by_rank.len() < num_generators {
            self.finalization_count_by_rank.resize(num_generators, 0);
        }
        self.finalization_count_by_rank[rank] += 1;
    }

    /// Count a generated block at `rank`.
    pub fn record_generation(&mut self, rank: usize, num_generators: usize) {
        if self.generation_count_by_rank.len() < num_generators {
            self.generation_count_by_rank.resize(num_generators, 0);
        }
        self.generation_count_by_rank[rank] += 1;
    }
}

/// Runtime counters of the chain.
#[derive(Debug, Default)]
pub struct ChainStats {
    finalized_blocks: AtomicU64,
    missed_blocks: AtomicU64,
    rollback_count: AtomicU64,
    longest_rollback_length: AtomicU64,
    zero_notarized_blocks_count: AtomicU64,
    multi_notarized_rounds: AtomicU64,
    max_notarized_blocks_per_round: AtomicU64,
}

/// Point-in-time copy of [`ChainStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatsSnapshot {
    pub finalized_blocks: u64,
    pub missed_blocks: u64,
    pub rollback_count: u64,
    pub longest_rollback_length: u64,
    pub zero_notarized_blocks_count: u64,
    pub multi_notarized_rounds: u64,
    pub max_notarized_blocks_per_round: u64,
}

impl ChainStats {
    pub fn record_finalized(&self) {
        self.finalized_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count generators whose proposal at the round lost to a
    /// lower-priority block.
    pub fn record_missed(&self, count: u64) {
        self.missed_blocks.fetch_add(count, Ordering::Relaxed);
    }

    /// Count a fork switch that rolled back `depth` previously
    /// finalized blocks.
    pub fn record_rollback(&self, depth: u64) {
        self.rollback_count.fetch_add(1, Ordering::Relaxed);
        self.longest_rollback_length
            .fetch_max(depth, Ordering::Relaxed);
    }

    /// Count a round that finalized without any locally notarized
    /// block (its winner arrived through sync).
    pub fn record_zero_notarized(&self) {
        self.zero_notarized_blocks_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Track how many notarized blocks a round accumulated.
    pub fn record_round_width(&self, notarized: usize) {
        let notarized = notarized as u64;
        self.max_notarized_blocks_per_round
            .fetch_max(notarized, Ordering::Relaxed);
        if notarized == 2 {
            // First transition past one: the round is multi-notarized.
            self.multi_notarized_rounds.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ChainStatsSnapshot {
        ChainStatsSnapshot {
            finalized_blocks: self.finalized_blocks.load(Ordering::Relaxed),
            missed_blocks: self.missed_blocks.load(Ordering::Relaxed),
            rollback_count: self.rollback_count.load(Ordering::Relaxed),
            longest_rollback_length: self.longest_rollback_length.load(Ordering::Relaxed),
            zero_notarized_blocks_count: self
                .zero_notarized_blocks_count
                .load(Ordering::Relaxed),
            multi_notarized_rounds: self.multi_notarized_rounds.load(Ordering::Relaxed),
            max_notarized_blocks_per_round: self
                .max_notarized_blocks_per_round
                .load(Ordering::Relaxed),
        }
    }
}

/// Lock-free latency accumulator.
#[derive(Debug, Default)]
pub struct LatencyTimer {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyTimer {
    /// Record one observation.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_micros.load(Ordering::Relaxed) / count)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_micros.load(Ordering::Relaxed))
    }
}

/// Steady-state transaction fee statistics over finalized blocks.
///
/// Tracks the per-block mean fee and the rolling extrema of those
/// means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeStats {
    pub mean_fees: u64,
    pub max_fees: u64,
    pub min_fees: u64,
}

impl Default for FeeStats {
    fn default() -> Self {
        Self {
            mean_fees: 0,
            max_fees: 0,
            min_fees: u64::MAX,
        }
    }
}

impl FeeStats {
    /// Fold one finalized block's mean fee into the stats.
    pub fn update(&mut self, total_fees: u64, txn_count: usize) {
        if txn_count == 0 {
            return;
        }
        let mean = total_fees / txn_count as u64;
        self.mean_fees = mean;
        if mean > self.max_fees {
            self.max_fees = mean;
        }
        if mean < self.min_fees {
            self.min_fees = mean;
        }
    }
}

/// Fixed-size circular buffer of finalized block summaries. The
/// newest write overwrites the oldest; readers take a snapshot.
pub struct FinalizedRing {
    slots: Vec<Option<BlockSummary>>,
    next: usize,
}

impl FinalizedRing {
    /// Create a ring with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            next: 0,
        }
    }

    /// Advance one slot, overwriting the oldest entry.
    pub fn push(&mut self, summary: BlockSummary) {
        let capacity = self.slots.len();
        self.slots[self.next] = Some(summary);
        self.next = (self.next + 1) % capacity;
    }

    /// Snapshot of the retained summaries, oldest first.
    pub fn snapshot(&self) -> Vec<BlockSummary> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|i| (self.next + i) % capacity)
            .filter_map(|i| self.slots[i].clone())
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_types::{Hash, MinerId};

    fn summary(round: u64) -> BlockSummary {
        BlockSummary {
            hash: Hash::digest(&round.to_le_bytes()),
            round,
            miner_id: MinerId(Hash::ZERO),
            txn_count: 0,
            creation_date: 0,
        }
    }

    #[test]
    fn ring_overwrites_oldest() {
        let mut ring = FinalizedRing::new(3);
        for round in 1..=5 {
            ring.push(summary(round));
        }
        let rounds: Vec<u64> = ring.snapshot().iter().map(|s| s.round).collect();
        assert_eq!(rounds, vec![3, 4, 5]);
    }

    #[test]
    fn ring_snapshot_before_full() {
        let mut ring = FinalizedRing::new(4);
        ring.push(summary(1));
        ring.push(summary(2));
        let rounds: Vec<u64> = ring.snapshot().iter().map(|s| s.round).collect();
        assert_eq!(rounds, vec![1, 2]);
    }

    #[test]
    fn fee_stats_track_extrema_of_means() {
        let mut stats = FeeStats::default();
        stats.update(300, 3); // mean 100
        assert_eq!(stats.mean_fees, 100);
        stats.update(50, 1); // mean 50
        stats.update(900, 3); // mean 300
        assert_eq!(stats.mean_fees, 300);
        assert_eq!(stats.min_fees, 50);
        assert_eq!(stats.max_fees, 300);
    }

    #[test]
    fn fee_stats_ignore_empty_blocks() {
        let mut stats = FeeStats::default();
        stats.update(0, 0);
        assert_eq!(stats, FeeStats::default());
    }

    #[test]
    fn miner_stats_grow_with_generators() {
        let mut stats = MinerStats::default();
        stats.record_finalization(1, 2);
        stats.record_finalization(3, 4);
        assert_eq!(stats.finalization_count_by_rank, vec![0, 1, 0, 1]);
    }

    #[test]
    fn round_width_counts_multi_notarized_once() {
        let stats = ChainStats::default();
        stats.record_round_width(1);
        stats.record_round_width(2);
        stats.record_round_width(3);
        let snap = stats.snapshot();
        assert_eq!(snap.multi_notarized_rounds, 1);
        assert_eq!(snap.max_notarized_blocks_per_round, 3);
    }

    #[test]
    fn rollbacks_track_count_and_longest_depth() {
        let stats = ChainStats::default();
        stats.record_rollback(1);
        stats.record_rollback(3);
        stats.record_rollback(2);
        let snap = stats.snapshot();
        assert_eq!(snap.rollback_count, 3);
        assert_eq!(snap.longest_rollback_length, 3);
    }

    #[test]
    fn zero_notarized_rounds_accumulate() {
        let stats = ChainStats::default();
        stats.record_zero_notarized();
        stats.record_zero_notarized();
        assert_eq!(stats.snapshot().zero_notarized_blocks_count, 2);
    }

    #[test]
    fn latency_timer_tracks_mean_and_max() {
        let timer = LatencyTimer::default();
        timer.record(Duration::from_millis(10));
        timer.record(Duration::from_millis(30));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.mean(), Duration::from_millis(20));
        assert_eq!(timer.max(), Duration::from_millis(30));
    }
}
