//! Inventory-skewed quoting around the mid price

use tracing::{debug, info};

use super::{Quote, QuoteSide, QuotingConfig, QuotingStatus, SimulatedFill};
use crate::decoder::{TakerSide, Trade};
use crate::orderbook::OrderBook;

/// Quoting engine for one book. Inventory and PnL survive book resyncs.
#[derive(Debug)]
pub struct QuotingEngine {
    config: QuotingConfig,
    /// Net position (positive = long)
    inventory: f64,
    realized_pnl: f64,
    bid_quote: Option<Quote>,
    ask_quote: Option<Quote>,
    fills: u64,
}

impl QuotingEngine {
    pub fn new(config: QuotingConfig) -> Self {
        Self {
            config,
            inventory: 0.0,
            realized_pnl: 0.0,
            bid_quote: None,
            ask_quote: None,
            fills: 0,
        }
    }

    pub fn config(&self) -> &QuotingConfig {
        &self.config
    }

    /// Recompute both quotes from the current top of book.
    pub fn on_book_update(&mut self, book: &OrderBook) {
        let (bid, ask) = match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) if book.is_synced() => (bid, ask),
            _ => {
                self.withdraw();
                return;
            }
        };

        let mid = (bid + ask) / 2.0;
        let gap = (ask - bid).abs();
        if gap > self.config.max_book_spread {
            debug!(
                best_bid = bid,
                best_ask = ask,
                max_book_spread = self.config.max_book_spread,
                "Top of book too wide, withdrawing quotes"
            );
            self.withdraw();
            return;
        }

        // Long inventory pushes both quotes down, short pushes them up
        let skew = self.inventory * self.config.inventory_skew;
        let bid_price = mid - self.config.spread_offset - skew;
        let ask_price = mid + self.config.spread_offset - skew;

        self.bid_quote = if self.inventory >= self.config.max_inventory {
            None
        } else {
            Some(Quote {
                side: QuoteSide::Buy,
                price: bid_price,
                quantity: self.config.quote_size,
            })
        };

        self.ask_quote = if self.inventory <= -self.config.max_inventory {
            None
        } else {
            Some(Quote {
                side: QuoteSide::Sell,
                price: ask_price,
                quantity: self.config.quote_size,
            })
        };
    }

    /// Treat a public trade at or through an active quote as a fill of that quote.
    pub fn on_trade(&mut self, trade: &Trade) -> Option<SimulatedFill> {
        // Sellers hit our bid, buyers lift our ask
        let (slot, crosses) = match trade.taker_side {
            TakerSide::Sell => {
                let crosses = self.bid_quote.is_some_and(|q| trade.price <= q.price);
                (&mut self.bid_quote, crosses)
            }
            TakerSide::Buy => {
                let crosses = self.ask_quote.is_some_and(|q| trade.price >= q.price);
                (&mut self.ask_quote, crosses)
            }
        };
        if !crosses {
            return None;
        }
        let quote = slot.take()?;

        let quantity = trade.quantity.min(quote.quantity);
        match quote.side {
            QuoteSide::Buy => {
                self.inventory += quantity;
                self.realized_pnl -= quote.price * quantity;
            }
            QuoteSide::Sell => {
                self.inventory -= quantity;
                self.realized_pnl += quote.price * quantity;
            }
        }
        self.fills += 1;

        let fill = SimulatedFill {
            trade_id: trade.trade_id,
            side: quote.side,
            price: quote.price,
            quantity,
        };
        info!(
            trade_id = fill.trade_id,
            side = ?fill.side,
            price = fill.price,
            quantity = fill.quantity,
            inventory = self.inventory,
            realized_pnl = self.realized_pnl,
            "Simulated fill"
        );
        Some(fill)
    }

    pub fn status(&self) -> QuotingStatus {
        QuotingStatus {
            inventory: self.inventory,
            realized_pnl: self.realized_pnl,
            bid_price: self.bid_quote.map(|q| q.price),
            ask_price: self.ask_quote.map(|q| q.price),
            fills: self.fills,
        }
    }

    pub fn bid_quote(&self) -> Option<&Quote> {
        self.bid_quote.as_ref()
    }

    pub fn ask_quote(&self) -> Option<&Quote> {
        self.ask_quote.as_ref()
    }

    pub fn inventory(&self) -> f64 {
        self.inventory
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    fn withdraw(&mut self) {
        self.bid_quote = None;
        self.ask_quote = None;
    }
}
