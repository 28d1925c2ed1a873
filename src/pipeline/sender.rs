//! Producer side of the pipeline channel

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{BackpressurePolicy, PipelineEvent, ResyncReason};
use crate::error::{MarketDataError, Result};
use crate::monitoring::PipelineMetrics;

/// Create the bounded pipeline channel
pub fn event_channel(
    capacity: usize,
    policy: BackpressurePolicy,
    metrics: Arc<PipelineMetrics>,
) -> (EventSender, mpsc::Receiver<PipelineEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            policy,
            resync_owed: false,
            metrics,
        },
        rx,
    )
}

/// Sole producer handle. Not `Clone`: one producer keeps venue order intact.
pub struct EventSender {
    tx: mpsc::Sender<PipelineEvent>,
    policy: BackpressurePolicy,
    /// A depth diff was dropped and the consumer has not been told yet
    resync_owed: bool,
    metrics: Arc<PipelineMetrics>,
}

impl EventSender {
    /// Enqueue one event. Fails only when the consumer is gone.
    pub async fn send(&mut self, event: PipelineEvent) -> Result<()> {
        match self.policy {
            BackpressurePolicy::Block => self
                .tx
                .send(event)
                .await
                .map_err(|_| MarketDataError::ChannelClosed),
            BackpressurePolicy::Drop => self.try_send(event),
        }
    }

    fn try_send(&mut self, event: PipelineEvent) -> Result<()> {
        if self.resync_owed {
            match self
                .tx
                .try_send(PipelineEvent::Resync(ResyncReason::Overflow))
            {
                Ok(()) => self.resync_owed = false,
                Err(TrySendError::Full(_)) => {
                    self.record_drop(&event);
                    return Ok(());
                }
                Err(TrySendError::Closed(_)) => return Err(MarketDataError::ChannelClosed),
            }
        }

        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                self.record_drop(&event);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(MarketDataError::ChannelClosed),
        }
    }

    fn record_drop(&mut self, event: &PipelineEvent) {
        self.metrics.channel_dropped.inc();
        match event {
            PipelineEvent::Depth(diff) => {
                if !self.resync_owed {
                    warn!(
                        last_update_id = diff.last_update_id,
                        "Channel full, depth diff dropped; book will resync"
                    );
                }
                self.resync_owed = true;
            }
            PipelineEvent::Resync(reason) => {
                debug!(reason = reason.as_str(), "Channel full, resync folded into overflow");
                self.resync_owed = true;
            }
            PipelineEvent::Trade(trade) => {
                debug!(trade_id = trade.trade_id, "Channel full, trade dropped");
            }
        }
    }
}
