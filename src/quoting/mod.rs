//! Advisory market-making quotes
//!
//! The engine reads the synced book, keeps a simulated inventory and realized PnL,
//! and maintains at most one bid and one ask quote. Quotes are never sent to the
//! venue.

mod engine;

pub use engine::QuotingEngine;

use serde::{Deserialize, Serialize};

/// Side of an advisory quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSide {
    Buy,
    Sell,
}

/// Advisory resting quote
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub side: QuoteSide,
    pub price: f64,
    pub quantity: f64,
}

/// Quoting parameters, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotingConfig {
    /// Size of each quote in base currency
    pub quote_size: f64,
    /// Absolute inventory at which the accumulating side is withdrawn
    pub max_inventory: f64,
    /// Distance of each quote from mid, in price units
    pub spread_offset: f64,
    /// Price shift per unit of inventory
    pub inventory_skew: f64,
    /// Widest top-of-book gap still considered quotable
    pub max_book_spread: f64,
}

impl Default for QuotingConfig {
    fn default() -> Self {
        Self {
            quote_size: 0.01,
            max_inventory: 0.01,
            spread_offset: 0.01,
            inventory_skew: 0.02,
            max_book_spread: 1.0,
        }
    }
}

/// Simulated fill of an advisory quote by a public trade
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatedFill {
    pub trade_id: u64,
    pub side: QuoteSide,
    pub price: f64,
    pub quantity: f64,
}

/// Read-only view of the quoting state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotingStatus {
    pub inventory: f64,
    pub realized_pnl: f64,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub fills: u64,
}
