//! Single-producer/single-consumer event pipeline
//!
//! Ingestion pushes events into a bounded FIFO channel; one consumer task owns the
//! order book and the quoting engine and applies events strictly in arrival order.

mod consumer;
mod sender;

pub use consumer::{Pipeline, SnapshotRequest};
pub use sender::{event_channel, EventSender};

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::decoder::{DepthDiff, MarketEvent, Trade};
use crate::orderbook::OrderBookState;
use crate::quoting::QuotingStatus;

/// Why the book must drop sync and wait for a new snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    /// Transport reconnected; diff continuity is lost
    Reconnect,
    /// Events were dropped on a full channel
    Overflow,
}

impl ResyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::Reconnect => "reconnect",
            ResyncReason::Overflow => "overflow",
        }
    }
}

/// Item carried by the pipeline channel
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Depth(DepthDiff),
    Trade(Trade),
    Resync(ResyncReason),
}

impl From<MarketEvent> for PipelineEvent {
    fn from(event: MarketEvent) -> Self {
        match event {
            MarketEvent::Depth(diff) => PipelineEvent::Depth(diff),
            MarketEvent::Trade(trade) => PipelineEvent::Trade(trade),
        }
    }
}

/// What the producer does when the channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for room; nothing is lost
    Block,
    /// Drop the event; a dropped depth diff forces a resync
    Drop,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(BackpressurePolicy::Block),
            "drop" => Ok(BackpressurePolicy::Drop),
            other => Err(format!("unknown backpressure policy: {}", other)),
        }
    }
}

/// Read-only snapshot of book and quoting state for observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: Option<f64>,
    pub book: OrderBookState,
    pub quoting: QuotingStatus,
    /// Wall clock time the status was taken (microseconds)
    pub timestamp_us: i64,
}

impl EngineStatus {
    pub fn is_synced(&self) -> bool {
        self.book.sync_state == crate::orderbook::SyncState::Synced
    }
}
