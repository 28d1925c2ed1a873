//! WebSocket module for Binance connection management

mod client;
mod manager;

pub use client::WebSocketClient;
pub use manager::{ReconnectPolicy, WebSocketManager};
