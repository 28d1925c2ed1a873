//! Consumer side of the pipeline
//!
//! The consumer task is the only writer of the order book and the quoting engine.
//! Snapshot fetches run on a separate task so the event queue keeps draining while
//! a REST call is in flight; the fetched snapshot is installed back on this task.

use std::sync::Arc;

use futures_util::future::OptionFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{EngineStatus, PipelineEvent, ResyncReason};
use crate::decoder::{DepthDiff, Trade};
use crate::monitoring::PipelineMetrics;
use crate::orderbook::{DiffOutcome, OrderBook};
use crate::publisher::Publisher;
use crate::quoting::QuotingEngine;
use crate::snapshot::{fetch_with_retry, DepthSnapshot, SnapshotPolicy, SnapshotSource};

/// Default number of levels per side in published status
const DEFAULT_DEPTH_LEVELS: usize = 20;

/// Snapshot fetch the consumer still has to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRequest {
    /// Abort any in-flight fetch and start over
    Restart,
    /// Start a fetch unless one is already running
    IfIdle,
}

/// Owns the book and the quoting engine and applies pipeline events in order
pub struct Pipeline {
    book: OrderBook,
    engine: QuotingEngine,
    source: Arc<dyn SnapshotSource>,
    policy: SnapshotPolicy,
    metrics: Arc<PipelineMetrics>,
    publisher: Option<Arc<Publisher>>,
    status_tx: watch::Sender<EngineStatus>,
    depth_levels: usize,
    snapshot_request: Option<SnapshotRequest>,
    fetch: Option<JoinHandle<DepthSnapshot>>,
}

impl Pipeline {
    /// A new pipeline starts unsynced with a snapshot fetch pending.
    pub fn new(
        book: OrderBook,
        engine: QuotingEngine,
        source: Arc<dyn SnapshotSource>,
        policy: SnapshotPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let status = snapshot_status(&book, &engine, DEFAULT_DEPTH_LEVELS);
        let (status_tx, _) = watch::channel(status);

        Self {
            book,
            engine,
            source,
            policy,
            metrics,
            publisher: None,
            status_tx,
            depth_levels: DEFAULT_DEPTH_LEVELS,
            snapshot_request: Some(SnapshotRequest::Restart),
            fetch: None,
        }
    }

    /// Also push every status change over IPC
    pub fn with_publisher(mut self, publisher: Arc<Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_depth_levels(mut self, depth_levels: usize) -> Self {
        self.depth_levels = depth_levels;
        self.status_tx
            .send_replace(snapshot_status(&self.book, &self.engine, depth_levels));
        self
    }

    /// Observer handle on the latest engine status
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn engine(&self) -> &QuotingEngine {
        &self.engine
    }

    pub fn pending_snapshot_request(&self) -> Option<SnapshotRequest> {
        self.snapshot_request
    }

    pub fn status(&self) -> EngineStatus {
        self.status_tx.borrow().clone()
    }

    /// Drain events until every producer is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<PipelineEvent>) {
        info!(symbol = %self.book.symbol(), "Pipeline consumer started");

        loop {
            self.dispatch_snapshot_request();

            tokio::select! {
                biased;

                Some(joined) = OptionFuture::from(self.fetch.as_mut()), if self.fetch.is_some() => {
                    self.fetch = None;
                    match joined {
                        Ok(snapshot) => self.install_snapshot(snapshot).await,
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => {
                            warn!(error = %e, "Snapshot task failed, restarting fetch");
                            self.snapshot_request = Some(SnapshotRequest::Restart);
                        }
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        info!(symbol = %self.book.symbol(), "Pipeline consumer stopped");
    }

    fn dispatch_snapshot_request(&mut self) {
        let Some(request) = self.snapshot_request.take() else {
            return;
        };

        if let Some(fetch) = self.fetch.as_ref() {
            match request {
                SnapshotRequest::IfIdle => return,
                SnapshotRequest::Restart => fetch.abort(),
            }
        }

        debug!(symbol = %self.book.symbol(), ?request, "Starting snapshot fetch");
        self.fetch = Some(tokio::spawn(fetch_with_retry(
            self.source.clone(),
            self.book.symbol().to_string(),
            self.policy,
            self.metrics.clone(),
        )));
    }

    /// Apply one event. Events for other symbols are ignored.
    pub async fn handle_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Depth(diff) => self.on_depth(diff).await,
            PipelineEvent::Trade(trade) => self.on_trade(trade).await,
            PipelineEvent::Resync(reason) => self.on_resync(reason).await,
        }
    }

    async fn on_depth(&mut self, diff: DepthDiff) {
        if !diff.symbol.eq_ignore_ascii_case(self.book.symbol()) {
            debug!(symbol = %diff.symbol, "Depth diff for another symbol ignored");
            return;
        }

        trace!(
            first_update_id = diff.first_update_id,
            last_update_id = diff.last_update_id,
            latency_us = diff.latency_us(),
            "Depth diff"
        );

        let outcome = self.book.apply_diff(diff);
        match outcome {
            DiffOutcome::Applied | DiffOutcome::Synced => self.metrics.diffs_applied.inc(),
            DiffOutcome::Stale => self.metrics.diffs_stale.inc(),
            DiffOutcome::Buffered | DiffOutcome::SnapshotBehind { .. } => {
                self.metrics.diffs_buffered.inc()
            }
            DiffOutcome::Gap { .. } => {}
        }
        self.on_book_outcome(outcome).await;
    }

    /// React to a book transition, whether a diff or a snapshot caused it
    async fn on_book_outcome(&mut self, outcome: DiffOutcome) {
        match outcome {
            DiffOutcome::Applied | DiffOutcome::Synced => self.refresh_quotes().await,
            DiffOutcome::Stale | DiffOutcome::Buffered => {}
            DiffOutcome::SnapshotBehind {
                snapshot_id,
                first_buffered,
            } => {
                if self.fetch.is_none() && self.snapshot_request.is_none() {
                    info!(
                        snapshot_id,
                        first_buffered, "Snapshot older than buffered diffs, refetching"
                    );
                    self.metrics.record_resync("snapshot_behind");
                    self.snapshot_request = Some(SnapshotRequest::IfIdle);
                }
            }
            DiffOutcome::Gap { .. } => {
                self.metrics.sequence_gaps.inc();
                self.metrics.record_resync("gap");
                self.snapshot_request = Some(SnapshotRequest::Restart);
                self.refresh_quotes().await;
            }
        }
    }

    async fn on_trade(&mut self, trade: Trade) {
        if !trade.symbol.eq_ignore_ascii_case(self.book.symbol()) {
            debug!(symbol = %trade.symbol, "Trade for another symbol ignored");
            return;
        }

        if self.engine.on_trade(&trade).is_some() {
            self.metrics.simulated_fills.inc();
            self.metrics.inventory.set(self.engine.inventory());
            self.metrics.realized_pnl.set(self.engine.realized_pnl());
            self.publish_status().await;
        }
    }

    async fn on_resync(&mut self, reason: ResyncReason) {
        info!(
            symbol = %self.book.symbol(),
            reason = reason.as_str(),
            "Resync requested, dropping book sync"
        );
        self.book.force_resync();
        self.metrics.record_resync(reason.as_str());
        self.snapshot_request = Some(SnapshotRequest::Restart);
        self.refresh_quotes().await;
    }

    /// Load a fetched snapshot and bridge it with the diffs buffered so far.
    /// Ignored once the book is synced again.
    pub async fn install_snapshot(&mut self, snapshot: DepthSnapshot) {
        if self.book.is_synced() {
            debug!(
                last_update_id = snapshot.last_update_id,
                "Book already synced, snapshot ignored"
            );
            return;
        }

        let outcome = self.book.load_snapshot(&snapshot);
        self.metrics.snapshots_loaded.inc();
        self.snapshot_request = None;
        self.on_book_outcome(outcome).await;
        self.publish_status().await;
    }

    async fn refresh_quotes(&mut self) {
        self.engine.on_book_update(&self.book);
        self.metrics.book_synced.set(i64::from(self.book.is_synced()));
        self.publish_status().await;
    }

    async fn publish_status(&mut self) {
        let status = snapshot_status(&self.book, &self.engine, self.depth_levels);
        let changed = {
            let current = self.status_tx.borrow();
            current.book != status.book || current.quoting != status.quoting
        };
        if !changed {
            return;
        }

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&status).await {
                warn!(error = %e, "Failed to publish engine status");
            }
        }
        self.status_tx.send_replace(status);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // A fetch must not outlive the consumer, including when its task is aborted
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
    }
}

fn snapshot_status(book: &OrderBook, engine: &QuotingEngine, depth: usize) -> EngineStatus {
    EngineStatus {
        best_bid: book.best_bid(),
        best_ask: book.best_ask(),
        spread: book.spread(),
        book: book.state(depth),
        quoting: engine.status(),
        timestamp_us: chrono::Utc::now().timestamp_micros(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{PriceLevel, TakerSide};
    use crate::quoting::QuotingConfig;
    use crate::error::Result;
    use crate::snapshot::MockSnapshotSource;
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::time::Duration;
    use tokio::time::timeout;

    fn levels(raw: &[(f64, f64)]) -> Vec<PriceLevel> {
        raw.iter().map(|&(p, q)| PriceLevel::new(p, q)).collect()
    }

    fn snapshot(version: u64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: version,
            bids: levels(&[(100.0, 1.0)]),
            asks: levels(&[(100.02, 1.0)]),
        }
    }

    fn diff(symbol: &str, first: u64, last: u64) -> PipelineEvent {
        PipelineEvent::Depth(DepthDiff {
            event_time_us: last,
            recv_time_us: last + 5,
            symbol: symbol.to_string(),
            first_update_id: first,
            last_update_id: last,
            prev_final_update_id: None,
            bids: vec![],
            asks: vec![],
        })
    }

    fn sell(price: f64) -> PipelineEvent {
        PipelineEvent::Trade(Trade {
            event_time_us: 0,
            recv_time_us: 0,
            symbol: "BTCUSDT".to_string(),
            trade_id: 42,
            price,
            quantity: 1.0,
            taker_side: TakerSide::Sell,
        })
    }

    /// Never answers a snapshot request
    struct StalledSource;

    #[async_trait]
    impl SnapshotSource for StalledSource {
        async fn fetch(&self, _symbol: &str, _limit: u32) -> Result<DepthSnapshot> {
            std::future::pending().await
        }
    }

    fn pipeline(source: MockSnapshotSource) -> (Pipeline, Arc<PipelineMetrics>) {
        pipeline_with(Arc::new(source))
    }

    fn pipeline_with(source: Arc<dyn SnapshotSource>) -> (Pipeline, Arc<PipelineMetrics>) {
        let metrics = Arc::new(PipelineMetrics::new(&Registry::new()).unwrap());
        let pipeline = Pipeline::new(
            OrderBook::new("BTCUSDT", 64),
            QuotingEngine::new(QuotingConfig::default()),
            source,
            SnapshotPolicy {
                depth_limit: 100,
                timeout: Duration::from_millis(200),
                retry_delay: Duration::from_millis(1),
                max_retry_delay: Duration::from_millis(5),
            },
            metrics.clone(),
        );
        (pipeline, metrics)
    }

    async fn synced_pipeline() -> (Pipeline, Arc<PipelineMetrics>) {
        let (mut pipeline, metrics) = pipeline(MockSnapshotSource::new());
        pipeline.install_snapshot(snapshot(10)).await;
        pipeline.handle_event(diff("BTCUSDT", 9, 11)).await;
        assert!(pipeline.book().is_synced());
        (pipeline, metrics)
    }

    #[tokio::test]
    async fn test_new_pipeline_requests_snapshot() {
        let (pipeline, _) = pipeline(MockSnapshotSource::new());
        assert_eq!(
            pipeline.pending_snapshot_request(),
            Some(SnapshotRequest::Restart)
        );
        assert!(!pipeline.status().is_synced());
    }

    #[tokio::test]
    async fn test_sync_publishes_quotes() {
        let (pipeline, metrics) = synced_pipeline().await;

        assert_eq!(pipeline.pending_snapshot_request(), None);
        let status = pipeline.status();
        assert!(status.is_synced());
        assert_eq!(status.best_bid, Some(100.0));
        assert_eq!(status.best_ask, Some(100.02));
        assert!(status.quoting.bid_price.is_some());
        assert!(status.quoting.ask_price.is_some());
        assert_eq!(metrics.snapshots_loaded.get(), 1);
        assert_eq!(metrics.diffs_applied.get(), 1);
        assert_eq!(metrics.book_synced.get(), 1);
    }

    #[tokio::test]
    async fn test_gap_requests_restart_and_withdraws_quotes() {
        let (mut pipeline, metrics) = synced_pipeline().await;

        pipeline.handle_event(diff("BTCUSDT", 15, 16)).await;

        assert_eq!(
            pipeline.pending_snapshot_request(),
            Some(SnapshotRequest::Restart)
        );
        assert_eq!(metrics.sequence_gaps.get(), 1);
        assert_eq!(metrics.resyncs.with_label_values(&["gap"]).get(), 1);
        assert_eq!(metrics.book_synced.get(), 0);

        let status = pipeline.status();
        assert!(!status.is_synced());
        assert_eq!(status.best_bid, None);
        assert_eq!(status.quoting.bid_price, None);
        assert_eq!(status.quoting.ask_price, None);
    }

    #[tokio::test]
    async fn test_reconnect_resync_keeps_inventory() {
        let (mut pipeline, metrics) = synced_pipeline().await;

        pipeline.handle_event(sell(99.9)).await;
        assert_eq!(metrics.simulated_fills.get(), 1);
        assert_eq!(pipeline.status().quoting.fills, 1);
        let inventory = pipeline.engine().inventory();
        assert!(inventory > 0.0);

        pipeline
            .handle_event(PipelineEvent::Resync(ResyncReason::Reconnect))
            .await;

        assert!(!pipeline.book().is_synced());
        assert_eq!(pipeline.book().last_update_id(), None);
        assert_eq!(metrics.resyncs.with_label_values(&["reconnect"]).get(), 1);
        assert_eq!(pipeline.status().quoting.inventory, inventory);
        assert_eq!(
            pipeline.pending_snapshot_request(),
            Some(SnapshotRequest::Restart)
        );
    }

    #[tokio::test]
    async fn test_other_symbol_ignored() {
        let (mut pipeline, metrics) = synced_pipeline().await;
        let before = pipeline.book().last_update_id();

        pipeline.handle_event(diff("ETHUSDT", 12, 20)).await;

        assert_eq!(pipeline.book().last_update_id(), before);
        assert_eq!(metrics.diffs_applied.get(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_behind_requests_refetch() {
        let (mut pipeline, metrics) = pipeline(MockSnapshotSource::new());
        pipeline.install_snapshot(snapshot(10)).await;

        pipeline.handle_event(diff("BTCUSDT", 20, 25)).await;

        assert_eq!(
            pipeline.pending_snapshot_request(),
            Some(SnapshotRequest::IfIdle)
        );
        assert_eq!(
            metrics.resyncs.with_label_values(&["snapshot_behind"]).get(),
            1
        );
        assert!(!pipeline.book().is_synced());
    }

    #[tokio::test]
    async fn test_snapshot_bridges_diffs_received_during_fetch() {
        let (mut pipeline, metrics) = pipeline(MockSnapshotSource::new());
        pipeline.handle_event(diff("BTCUSDT", 5, 10)).await;
        pipeline.handle_event(diff("BTCUSDT", 11, 14)).await;
        assert!(!pipeline.status().is_synced());

        pipeline.install_snapshot(snapshot(10)).await;

        assert!(pipeline.book().is_synced());
        assert_eq!(pipeline.book().last_update_id(), Some(14));
        assert_eq!(pipeline.pending_snapshot_request(), None);
        assert_eq!(metrics.diffs_buffered.get(), 2);
        assert_eq!(metrics.book_synced.get(), 1);

        let status = pipeline.status();
        assert!(status.is_synced());
        assert!(status.quoting.bid_price.is_some());
        assert!(status.quoting.ask_price.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_behind_buffer_on_load_requests_refetch() {
        let (mut pipeline, metrics) = pipeline(MockSnapshotSource::new());
        pipeline.handle_event(diff("BTCUSDT", 20, 25)).await;

        pipeline.install_snapshot(snapshot(10)).await;

        assert!(!pipeline.book().is_synced());
        assert_eq!(
            pipeline.pending_snapshot_request(),
            Some(SnapshotRequest::IfIdle)
        );
        assert_eq!(
            metrics.resyncs.with_label_values(&["snapshot_behind"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_aborted_consumer_cancels_snapshot_fetch() {
        let source = Arc::new(StalledSource);
        let (pipeline, _) = pipeline_with(source.clone());
        let (_tx, rx) = mpsc::channel(16);
        let consumer = tokio::spawn(pipeline.run(rx));

        // Test handle, pipeline and the in-flight fetch
        timeout(Duration::from_secs(2), async {
            while Arc::strong_count(&source) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        consumer.abort();
        assert!(consumer.await.unwrap_err().is_cancelled());

        timeout(Duration::from_secs(2), async {
            while Arc::strong_count(&source) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_ignored_when_synced() {
        let (mut pipeline, metrics) = synced_pipeline().await;

        pipeline.install_snapshot(snapshot(5)).await;

        assert!(pipeline.book().is_synced());
        assert_eq!(pipeline.book().last_update_id(), Some(11));
        assert_eq!(metrics.snapshots_loaded.get(), 1);
    }

    #[tokio::test]
    async fn test_run_fetches_snapshot_and_syncs() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|symbol, limit| {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(limit, 100);
                Ok(snapshot(10))
            });

        let (pipeline, metrics) = pipeline(source);
        let mut status = pipeline.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let consumer = tokio::spawn(pipeline.run(rx));

        timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.book.last_update_id == Some(10)),
        )
        .await
        .unwrap()
        .unwrap();

        tx.send(diff("BTCUSDT", 9, 11)).await.unwrap();
        timeout(Duration::from_secs(2), status.wait_for(|s| s.is_synced()))
            .await
            .unwrap()
            .unwrap();

        drop(tx);
        consumer.await.unwrap();
        assert_eq!(metrics.snapshots_loaded.get(), 1);
        assert_eq!(metrics.diffs_applied.get(), 1);
    }
}
