//! Publisher module for IPC communication
//!
//! Pushes engine status snapshots to other system components over a Unix socket.
//! Frames are a 4-byte big-endian length followed by a MessagePack body.

use bytes::{BufMut, BytesMut};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MarketDataError, Result};
use crate::pipeline::EngineStatus;

/// Publisher for sending status updates via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // Reader may not be up yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    /// Connect to the Unix socket
    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(MarketDataError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            MarketDataError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        let mut guard = self.stream.lock().await;
        *guard = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Length-prefixed MessagePack frame for one status
    pub fn encode(status: &EngineStatus) -> Result<BytesMut> {
        let data = rmp_serde::to_vec_named(status).map_err(|e| {
            MarketDataError::SerializationError(format!("Failed to serialize: {}", e))
        })?;

        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(data.len() as u32);
        frame.put_slice(&data);
        Ok(frame)
    }

    /// Publish a status snapshot. Socket failures are logged, not returned.
    pub async fn publish(&self, status: &EngineStatus) -> Result<()> {
        let frame = Self::encode(status)?;

        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(_) => {
                    debug!(
                        symbol = %status.book.symbol,
                        update_id = ?status.book.last_update_id,
                        "Published engine status"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }
}
