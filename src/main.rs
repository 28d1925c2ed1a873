//! ORPflow HFT - Order Book Consistency Engine
//!
//! Keeps a synced Binance order book for one symbol and derives advisory quotes
//! from it. Ingestion and book maintenance run on separate tasks joined by a
//! bounded channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orp_flow_quoter::{
    event_channel, Config, EngineStatus, OrderBook, Pipeline, PipelineMetrics, Publisher,
    QuotingEngine, RestSnapshotSource, SnapshotPolicy, WebSocketManager,
};

/// State shared with the HTTP handlers
#[derive(Clone)]
struct AppState {
    registry: Registry,
    status: watch::Receiver<EngineStatus>,
    symbol: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting ORPflow order book engine");

    // Load configuration
    let config = Config::load()?;
    info!(
        symbol = %config.symbol,
        backpressure = ?config.backpressure,
        "Configuration loaded"
    );

    let registry = Registry::new();
    let metrics = Arc::new(PipelineMetrics::new(&registry)?);

    let policy = SnapshotPolicy::from_config(&config);
    let source = Arc::new(RestSnapshotSource::new(&config.rest_endpoint, policy.timeout)?);

    let book = OrderBook::new(&config.symbol, config.pending_capacity)
        .with_update_chain_verification(config.verify_update_chain);
    let mut pipeline = Pipeline::new(
        book,
        QuotingEngine::new(config.quoting),
        source,
        policy,
        metrics.clone(),
    )
    .with_depth_levels(config.depth_levels);

    // Initialize publisher for IPC
    if let Some(path) = &config.ipc_socket_path {
        pipeline = pipeline.with_publisher(Arc::new(Publisher::new(path).await));
    }

    let status = pipeline.subscribe();
    let (sender, events) =
        event_channel(config.channel_capacity, config.backpressure, metrics.clone());
    let mut consumer = tokio::spawn(pipeline.run(events));

    // Start health check server
    let app_state = AppState {
        registry,
        status: status.clone(),
        symbol: config.symbol.clone(),
    };
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(app_state, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    // Status logging task
    let status_interval = Duration::from_secs(config.status_interval_secs);
    tokio::spawn(log_status(status, status_interval));

    // Start WebSocket manager
    let mut ws_manager = WebSocketManager::new(&config, sender, metrics);
    let producer = tokio::spawn(async move { ws_manager.run().await });

    tokio::select! {
        result = producer => match result {
            Ok(Ok(())) => info!("WebSocket manager stopped"),
            Ok(Err(e)) => error!(error = %e, "WebSocket manager failed"),
            Err(e) => error!(error = %e, "WebSocket manager task panicked"),
        },
        result = &mut consumer => {
            if let Err(e) = result {
                error!(error = %e, "Pipeline consumer task panicked");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    // Dropping the pipeline also cancels an in-flight snapshot fetch
    consumer.abort();
    info!("Order book engine stopped");
    Ok(())
}

/// Periodically log book and quote state
async fn log_status(status: watch::Receiver<EngineStatus>, every: Duration) {
    let mut ticker = interval(every);
    loop {
        ticker.tick().await;
        let current = status.borrow().clone();
        let metrics = &current.book.metrics;
        info!(
            symbol = %current.book.symbol,
            synced = current.is_synced(),
            last_update_id = ?current.book.last_update_id,
            mid_price = ?metrics.mid_price,
            spread_bps = ?metrics.spread_bps,
            imbalance = ?metrics.imbalance,
            bid_quote = ?current.quoting.bid_price,
            ask_quote = ?current.quoting.ask_price,
            inventory = current.quoting.inventory,
            realized_pnl = current.quoting.realized_pnl,
            "Order book status"
        );
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let synced = state.status.borrow().is_synced();
    Json(serde_json::json!({
        "status": if synced { "healthy" } else { "syncing" },
        "component": "orderbook-engine",
        "symbol": state.symbol,
        "synced": synced,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.status.borrow().clone())
}
