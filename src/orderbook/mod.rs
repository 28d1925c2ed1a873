//! Order book module
//!
//! Reconstructs a local book from a REST snapshot plus the Binance diff stream,
//! following the buffer-then-bridge synchronization protocol.

mod book;
mod metrics;

pub use book::{OrderBook, DEFAULT_PENDING_CAPACITY};
pub use metrics::OrderBookMetrics;

use serde::{Deserialize, Serialize};

use crate::decoder::PriceLevel;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Synchronization state. Levels are authoritative only while `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Unsynced,
    Synced,
}

/// Result of feeding a diff or a snapshot into the book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// Applied on top of a synced book
    Applied,
    /// Already covered by the current version; discarded
    Stale,
    /// Buffered while unsynced; nothing to bridge yet
    Buffered,
    /// A buffered diff straddled the snapshot version and the book is now synced
    Synced,
    /// The oldest buffered diff starts after the snapshot version; a fresher
    /// snapshot is needed to bridge
    SnapshotBehind { snapshot_id: u64, first_buffered: u64 },
    /// Version hole detected; the book dropped back to unsynced and needs a snapshot
    Gap { expected: u64, got: u64 },
}

impl DiffOutcome {
    /// A fresh snapshot must be fetched
    pub fn needs_snapshot(&self) -> bool {
        matches!(
            self,
            DiffOutcome::Gap { .. } | DiffOutcome::SnapshotBehind { .. }
        )
    }
}

/// Order book view to be published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookState {
    pub symbol: String,
    pub sync_state: SyncState,
    pub timestamp_us: u64,
    pub last_update_id: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub metrics: OrderBookMetrics,
}
