//! WebSocket connection manager
//!
//! Handles reconnection logic and forwards decoded events into the pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{error, info, trace, warn};

use super::WebSocketClient;
use crate::config::Config;
use crate::decoder::EventDecoder;
use crate::error::{MarketDataError, Result};
use crate::monitoring::PipelineMetrics;
use crate::pipeline::{EventSender, PipelineEvent, ResyncReason};

/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Idle time before a keepalive ping is sent
const KEEPALIVE_SECS: u64 = 30;
/// Silence after which the connection is probed
const RECV_TIMEOUT_SECS: u64 = 45;

/// Capped exponential backoff between connection attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    /// Consecutive failures tolerated (0 = unlimited)
    max_attempts: u32,
    cooldown: Duration,
    attempts: u32,
    last_connected: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            cooldown: Duration::from_secs(RECONNECT_COOLDOWN_SECS),
            attempts: 0,
            last_connected: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_delay_ms),
            Duration::from_millis(config.max_reconnect_delay_ms),
            config.max_reconnect_attempts,
        )
    }

    /// How long a connection must have lived to clear the failure count
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn on_connected(&mut self) {
        self.last_connected = Some(Instant::now());
    }

    /// Record a failure. Returns the delay before the next attempt, or `None`
    /// once the attempt limit is exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        // Flapping connections keep counting; stable ones start over
        if let Some(connected) = self.last_connected.take() {
            if connected.elapsed() >= self.cooldown && self.attempts > 0 {
                info!(
                    previous_attempts = self.attempts,
                    "Resetting reconnect counter after cooldown period"
                );
                self.attempts = 0;
            }
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.max_attempts > 0 && self.attempts > self.max_attempts {
            return None;
        }

        let factor = 1u32 << (self.attempts - 1).min(16);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Owns the transport and is the pipeline's single producer
pub struct WebSocketManager {
    client: WebSocketClient,
    decoder: EventDecoder,
    sender: EventSender,
    policy: ReconnectPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl WebSocketManager {
    /// Create a new WebSocket manager
    pub fn new(config: &Config, sender: EventSender, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            client: WebSocketClient::new(
                &config.ws_endpoint,
                &config.symbol,
                config.timestamps_in_micros,
            ),
            decoder: EventDecoder::new(config.timestamps_in_micros),
            sender,
            policy: ReconnectPolicy::from_config(config),
            metrics,
        }
    }

    /// Run until the consumer goes away or reconnect attempts run out.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting WebSocket manager");

        loop {
            let err = match self.connect_and_process().await {
                Ok(()) => MarketDataError::WebSocketConnection("Stream ended".to_string()),
                Err(e) => e,
            };
            self.client.close().await;

            if matches!(err, MarketDataError::ChannelClosed) {
                info!("Pipeline consumer gone, stopping WebSocket manager");
                return Ok(());
            }

            error!(error = %err, "WebSocket error");
            let Some(delay) = self.policy.on_failure() else {
                error!(attempts = self.policy.attempts(), "Giving up on reconnecting");
                return Err(MarketDataError::MaxReconnectAttemptsExceeded(
                    self.policy.attempts() - 1,
                ));
            };

            warn!(
                attempt = self.policy.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after error..."
            );
            sleep(delay).await;
        }
    }

    /// Connect and forward messages until the connection fails
    async fn connect_and_process(&mut self) -> Result<()> {
        self.client.connect().await?;
        self.policy.on_connected();

        // Diffs from the new connection cannot be chained onto the old book
        self.sender
            .send(PipelineEvent::Resync(ResyncReason::Reconnect))
            .await?;

        let mut last_message = Instant::now();
        let keepalive = Duration::from_secs(KEEPALIVE_SECS);
        let recv_timeout = Duration::from_secs(RECV_TIMEOUT_SECS);

        loop {
            match timeout(recv_timeout, self.client.recv()).await {
                Ok(Ok(Some(text))) => {
                    last_message = Instant::now();
                    self.forward(&text).await?;
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > keepalive {
                        if let Err(e) = self.client.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = self.client.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(MarketDataError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    /// Decode one frame and push the event. Only a closed channel is an error.
    async fn forward(&mut self, raw: &str) -> Result<()> {
        let recv_us = chrono::Utc::now().timestamp_micros().max(0) as u64;

        match self.decoder.decode_text(raw, recv_us) {
            Ok(Some(event)) => self.sender.send(event.into()).await,
            Ok(None) => {
                trace!(len = raw.len(), "Unrecognized message skipped");
                Ok(())
            }
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(error = %e, "Failed to decode message");
                Ok(())
            }
        }
    }
}
