//! REST depth snapshots
//!
//! A snapshot is the version baseline the live diff stream is bridged onto. Fetches
//! always run under a timeout and are retried with capped exponential backoff; a
//! failed fetch never touches the book.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decoder::{deserialize_levels, PriceLevel};
use crate::error::{MarketDataError, Result};
use crate::monitoring::PipelineMetrics;

/// Order book snapshot from REST API
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepthSnapshot {
    /// Book version the snapshot reflects
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Point-in-time depth snapshot provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot>;
}

/// Binance `GET /api/v3/depth` snapshot source
pub struct RestSnapshotSource {
    client: reqwest::Client,
    rest_endpoint: String,
}

impl RestSnapshotSource {
    pub fn new(rest_endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            self.rest_endpoint,
            symbol.to_uppercase(),
            limit
        );

        debug!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::SnapshotFetch(format!(
                "HTTP {} from {}",
                status, url
            )));
        }

        Ok(response.json::<DepthSnapshot>().await?)
    }
}

/// Depth limit, per-attempt timeout and retry backoff for snapshot fetches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotPolicy {
    pub depth_limit: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl SnapshotPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            depth_limit: config.snapshot_depth,
            timeout: Duration::from_millis(config.snapshot_timeout_ms),
            retry_delay: Duration::from_millis(config.snapshot_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.snapshot_max_retry_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            depth_limit: 1000,
            timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
        }
    }
}

/// Single fetch bounded by the policy timeout.
pub async fn fetch_once(
    source: &dyn SnapshotSource,
    symbol: &str,
    policy: &SnapshotPolicy,
) -> Result<DepthSnapshot> {
    match timeout(policy.timeout, source.fetch(symbol, policy.depth_limit)).await {
        Ok(result) => result,
        Err(_) => Err(MarketDataError::SnapshotTimeout(
            policy.timeout.as_millis() as u64,
        )),
    }
}

/// Fetch until a snapshot arrives. Cancel by dropping or aborting the future.
pub async fn fetch_with_retry(
    source: Arc<dyn SnapshotSource>,
    symbol: String,
    policy: SnapshotPolicy,
    metrics: Arc<PipelineMetrics>,
) -> DepthSnapshot {
    let mut attempt = 0u32;
    loop {
        match fetch_once(source.as_ref(), &symbol, &policy).await {
            Ok(snapshot) => {
                info!(
                    symbol = %symbol,
                    last_update_id = snapshot.last_update_id,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    attempts = attempt + 1,
                    "Depth snapshot received"
                );
                return snapshot;
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                metrics.snapshot_failures.inc();
                let delay = policy.backoff(attempt);
                warn!(
                    symbol = %symbol,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Snapshot fetch failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
