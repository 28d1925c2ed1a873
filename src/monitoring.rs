//! Prometheus metrics for the ingestion and consumer tasks

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::error::Result;

/// Pipeline counters and gauges, registered on a caller-owned registry
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub diffs_applied: IntCounter,
    pub diffs_stale: IntCounter,
    pub diffs_buffered: IntCounter,
    pub sequence_gaps: IntCounter,
    /// Resyncs by reason: gap, snapshot_behind, reconnect, overflow
    pub resyncs: IntCounterVec,
    pub snapshots_loaded: IntCounter,
    pub snapshot_failures: IntCounter,
    pub decode_errors: IntCounter,
    pub channel_dropped: IntCounter,
    pub simulated_fills: IntCounter,
    pub book_synced: IntGauge,
    pub inventory: Gauge,
    pub realized_pnl: Gauge,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            diffs_applied: IntCounter::new(
                "depth_diffs_applied_total",
                "Depth diffs applied to a synced book",
            )?,
            diffs_stale: IntCounter::new(
                "depth_diffs_stale_total",
                "Depth diffs discarded as already applied",
            )?,
            diffs_buffered: IntCounter::new(
                "depth_diffs_buffered_total",
                "Depth diffs buffered while unsynced",
            )?,
            sequence_gaps: IntCounter::new(
                "sequence_gaps_total",
                "Version gaps detected in the diff stream",
            )?,
            resyncs: IntCounterVec::new(
                Opts::new("book_resyncs_total", "Snapshot resyncs requested"),
                &["reason"],
            )?,
            snapshots_loaded: IntCounter::new(
                "snapshots_loaded_total",
                "REST snapshots loaded into the book",
            )?,
            snapshot_failures: IntCounter::new(
                "snapshot_fetch_failures_total",
                "Failed REST snapshot fetches",
            )?,
            decode_errors: IntCounter::new(
                "decode_errors_total",
                "Recognized messages that failed to decode",
            )?,
            channel_dropped: IntCounter::new(
                "channel_dropped_events_total",
                "Events dropped on a full channel",
            )?,
            simulated_fills: IntCounter::new(
                "simulated_fills_total",
                "Advisory quotes filled by public trades",
            )?,
            book_synced: IntGauge::new("book_synced", "1 while the book is synced")?,
            inventory: Gauge::new("quoting_inventory", "Simulated net inventory")?,
            realized_pnl: Gauge::new("quoting_realized_pnl", "Simulated realized PnL")?,
        };

        registry.register(Box::new(metrics.diffs_applied.clone()))?;
        registry.register(Box::new(metrics.diffs_stale.clone()))?;
        registry.register(Box::new(metrics.diffs_buffered.clone()))?;
        registry.register(Box::new(metrics.sequence_gaps.clone()))?;
        registry.register(Box::new(metrics.resyncs.clone()))?;
        registry.register(Box::new(metrics.snapshots_loaded.clone()))?;
        registry.register(Box::new(metrics.snapshot_failures.clone()))?;
        registry.register(Box::new(metrics.decode_errors.clone()))?;
        registry.register(Box::new(metrics.channel_dropped.clone()))?;
        registry.register(Box::new(metrics.simulated_fills.clone()))?;
        registry.register(Box::new(metrics.book_synced.clone()))?;
        registry.register(Box::new(metrics.inventory.clone()))?;
        registry.register(Box::new(metrics.realized_pnl.clone()))?;

        Ok(metrics)
    }

    pub fn record_resync(&self, reason: &str) {
        self.resyncs.with_label_values(&[reason]).inc();
    }
}
