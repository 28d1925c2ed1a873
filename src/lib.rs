//! ORPflow HFT - Order Book Consistency Engine
//!
//! This crate reconstructs a Binance spot order book from a REST snapshot plus the
//! diff stream, detects sequence gaps and resyncs, and derives advisory
//! market-making quotes from the synced book.

pub mod config;
pub mod decoder;
pub mod error;
pub mod monitoring;
pub mod orderbook;
pub mod pipeline;
pub mod publisher;
pub mod quoting;
pub mod snapshot;
pub mod websocket;

pub use config::Config;
pub use decoder::{DepthDiff, EventDecoder, MarketEvent, PriceLevel, TakerSide, Trade};
pub use error::{DecodeError, MarketDataError, Result};
pub use monitoring::PipelineMetrics;
pub use orderbook::{DiffOutcome, OrderBook, OrderBookMetrics, OrderBookState, SyncState};
pub use pipeline::{event_channel, EngineStatus, EventSender, Pipeline, PipelineEvent};
pub use publisher::Publisher;
pub use quoting::{Quote, QuoteSide, QuotingConfig, QuotingEngine, QuotingStatus};
pub use snapshot::{DepthSnapshot, RestSnapshotSource, SnapshotPolicy, SnapshotSource};
pub use websocket::WebSocketManager;
