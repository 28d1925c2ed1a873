//! Core order book implementation
//!
//! Uses BTreeMap for sorted price level management and a bounded FIFO of diffs
//! received before the book could be bridged onto a snapshot.

use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

use super::{DiffOutcome, OrderBookMetrics, OrderBookState, Side, SyncState};
use crate::decoder::{DepthDiff, PriceLevel};
use crate::snapshot::DepthSnapshot;

/// Default bound on diffs buffered while unsynced
pub const DEFAULT_PENDING_CAPACITY: usize = 5000;

/// Levels included in the imbalance metric
const IMBALANCE_LEVELS: usize = 5;

/// Where the book is in the snapshot/diff reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No version baseline (startup, gap or forced resync)
    AwaitingSnapshot,
    /// Snapshot loaded, waiting for a buffered diff to straddle it
    Bridging { baseline: u64 },
    /// Diffs apply monotonically on top of `last`
    Live { last: u64 },
}

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<OrderedFloat<f64>>, f64>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    phase: Phase,
    /// Diffs received while unsynced, oldest first
    pending: VecDeque<DepthDiff>,
    pending_capacity: usize,
    /// Treat a `pu` that does not chain onto the last applied diff as a gap
    verify_update_chain: bool,
    /// Event time of the last applied diff
    last_update_time: u64,
    /// Buffered diffs evicted because the buffer was full
    dropped_diffs: u64,
}

impl OrderBook {
    /// Create a new empty, unsynced order book
    pub fn new(symbol: &str, pending_capacity: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            phase: Phase::AwaitingSnapshot,
            pending: VecDeque::new(),
            pending_capacity: pending_capacity.max(1),
            verify_update_chain: false,
            last_update_time: 0,
            dropped_diffs: 0,
        }
    }

    pub fn with_update_chain_verification(mut self, enabled: bool) -> Self {
        self.verify_update_chain = enabled;
        self
    }

    /// Replace both sides with a snapshot and take its version as the baseline.
    ///
    /// A snapshot alone does not sync the book. Diffs buffered before it arrived
    /// are checked against the new baseline right away, so the outcome is
    /// `Synced` when one of them bridges it.
    pub fn load_snapshot(&mut self, snapshot: &DepthSnapshot) -> DiffOutcome {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.quantity > 0.0 {
                self.bids.insert(Reverse(OrderedFloat(level.price)), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.quantity > 0.0 {
                self.asks.insert(OrderedFloat(level.price), level.quantity);
            }
        }

        self.phase = Phase::Bridging {
            baseline: snapshot.last_update_id,
        };

        info!(
            symbol = %self.symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            pending = self.pending.len(),
            "Snapshot loaded"
        );

        self.bridge()
    }

    /// Feed one depth diff. Never blocks.
    pub fn apply_diff(&mut self, diff: DepthDiff) -> DiffOutcome {
        match self.phase {
            Phase::Live { last } => self.apply_live(last, diff),
            Phase::AwaitingSnapshot | Phase::Bridging { .. } => {
                self.buffer(diff);
                self.bridge()
            }
        }
    }

    /// Drop sync (reconnect, channel overflow). Buffered diffs are discarded and
    /// the book waits for a new snapshot.
    pub fn force_resync(&mut self) {
        self.pending.clear();
        self.phase = Phase::AwaitingSnapshot;
    }

    fn apply_live(&mut self, last: u64, diff: DepthDiff) -> DiffOutcome {
        if diff.last_update_id <= last {
            debug!(
                symbol = %self.symbol,
                last_update_id = last,
                diff_last = diff.last_update_id,
                "Stale diff discarded"
            );
            return DiffOutcome::Stale;
        }

        if diff.first_update_id > last + 1 {
            return self.sequence_gap(last + 1, diff.first_update_id, diff);
        }

        if self.verify_update_chain {
            if let Some(pu) = diff.prev_final_update_id {
                if pu != last {
                    return self.sequence_gap(last, pu, diff);
                }
            }
        }

        self.apply_levels(&diff);
        self.phase = Phase::Live {
            last: diff.last_update_id,
        };
        DiffOutcome::Applied
    }

    fn sequence_gap(&mut self, expected: u64, got: u64, diff: DepthDiff) -> DiffOutcome {
        warn!(
            symbol = %self.symbol,
            expected,
            got,
            "Sequence gap detected, book needs resync"
        );
        // Diffs still queued behind this one may bridge the next snapshot
        self.phase = Phase::AwaitingSnapshot;
        self.pending.push_front(diff);
        DiffOutcome::Gap { expected, got }
    }

    fn buffer(&mut self, diff: DepthDiff) {
        if self.pending.len() >= self.pending_capacity {
            self.pending.pop_front();
            self.dropped_diffs += 1;
            warn!(
                symbol = %self.symbol,
                capacity = self.pending_capacity,
                dropped = self.dropped_diffs,
                "Pending diff buffer full, dropping oldest"
            );
        }
        self.pending.push_back(diff);
    }

    /// Look for the buffered diff that straddles the snapshot version.
    fn bridge(&mut self) -> DiffOutcome {
        let Phase::Bridging { baseline } = self.phase else {
            return DiffOutcome::Buffered;
        };

        while let Some(front) = self.pending.front() {
            if front.last_update_id <= baseline {
                self.pending.pop_front();
                continue;
            }

            // front.last_update_id > baseline here, so this is the straddle check
            if front.first_update_id > baseline + 1 {
                return DiffOutcome::SnapshotBehind {
                    snapshot_id: baseline,
                    first_buffered: front.first_update_id,
                };
            }

            let Some(diff) = self.pending.pop_front() else {
                break;
            };
            self.apply_levels(&diff);
            self.phase = Phase::Live {
                last: diff.last_update_id,
            };
            info!(
                symbol = %self.symbol,
                snapshot_id = baseline,
                last_update_id = diff.last_update_id,
                "Order book synced"
            );
            return self.replay_pending();
        }

        DiffOutcome::Buffered
    }

    /// Push diffs still buffered behind the bridge through the live path.
    fn replay_pending(&mut self) -> DiffOutcome {
        while let Some(diff) = self.pending.pop_front() {
            let Phase::Live { last } = self.phase else {
                break;
            };
            if let gap @ DiffOutcome::Gap { .. } = self.apply_live(last, diff) {
                return gap;
            }
        }
        DiffOutcome::Synced
    }

    fn apply_levels(&mut self, diff: &DepthDiff) {
        for level in &diff.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &diff.asks {
            self.update_side(Side::Ask, level);
        }
        self.last_update_time = diff.event_time_us;
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        let price = OrderedFloat(level.price);
        match side {
            Side::Bid => {
                if level.quantity == 0.0 {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == 0.0 {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, level.quantity);
                }
            }
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn sync_state(&self) -> SyncState {
        match self.phase {
            Phase::Live { .. } => SyncState::Synced,
            _ => SyncState::Unsynced,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state() == SyncState::Synced
    }

    /// Version of the last applied diff, or the snapshot version while bridging
    pub fn last_update_id(&self) -> Option<u64> {
        match self.phase {
            Phase::AwaitingSnapshot => None,
            Phase::Bridging { baseline } => Some(baseline),
            Phase::Live { last } => Some(last),
        }
    }

    /// Get best bid price. `None` while unsynced.
    pub fn best_bid(&self) -> Option<f64> {
        if !self.is_synced() {
            return None;
        }
        self.bids.first_key_value().map(|(Reverse(p), _)| p.into_inner())
    }

    /// Get best ask price. `None` while unsynced.
    pub fn best_ask(&self) -> Option<f64> {
        if !self.is_synced() {
            return None;
        }
        self.asks.first_key_value().map(|(p, _)| p.into_inner())
    }

    /// Best ask minus best bid
    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<f64> {
        match (self.spread(), self.mid_price()) {
            (Some(spread), Some(mid)) if mid > 0.0 => Some(spread / mid * 10_000.0),
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<f64> {
        if !self.is_synced() {
            return None;
        }
        let bid_volume: f64 = self.bids.values().take(levels).sum();
        let ask_volume: f64 = self.asks.values().take(levels).sum();

        let total = bid_volume + ask_volume;
        if total > 0.0 {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Resting quantity at a bid price. Raw storage, not authoritative while unsynced.
    pub fn bid_quantity(&self, price: f64) -> Option<f64> {
        self.bids.get(&Reverse(OrderedFloat(price))).copied()
    }

    /// Resting quantity at an ask price. Raw storage, not authoritative while unsynced.
    pub fn ask_quantity(&self, price: f64) -> Option<f64> {
        self.asks.get(&OrderedFloat(price)).copied()
    }

    /// Bid levels, best first
    pub fn bids(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids
            .iter()
            .map(|(Reverse(p), q)| PriceLevel::new(p.into_inner(), *q))
    }

    /// Ask levels, best first
    pub fn asks(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks
            .iter()
            .map(|(p, q)| PriceLevel::new(p.into_inner(), *q))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn dropped_diffs(&self) -> u64 {
        self.dropped_diffs
    }

    /// Get current state for publishing, limited to the top `depth` levels
    pub fn state(&self, depth: usize) -> OrderBookState {
        OrderBookState {
            symbol: self.symbol.clone(),
            sync_state: self.sync_state(),
            timestamp_us: self.last_update_time,
            last_update_id: self.last_update_id(),
            bids: self.bids().take(depth).collect(),
            asks: self.asks().take(depth).collect(),
            metrics: self.calculate_metrics(),
        }
    }

    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread: self.spread(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(IMBALANCE_LEVELS),
            bid_depth: self.bids.values().sum(),
            ask_depth: self.asks.values().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
