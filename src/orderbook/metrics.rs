//! Order book metrics calculation

use serde::{Deserialize, Serialize};

/// Computed metrics for an order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<f64>,

    /// Best ask minus best bid
    pub spread: Option<f64>,

    /// Spread in basis points of mid
    pub spread_bps: Option<f64>,

    /// Simple imbalance: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<f64>,

    /// Total bid depth (volume)
    pub bid_depth: f64,

    /// Total ask depth (volume)
    pub ask_depth: f64,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Check if the order book is healthy (has valid data)
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some() && self.bid_levels > 0 && self.ask_levels > 0
    }
}
