use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::errors::{DriverError, Result};

/// Configuration options for the driver's channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed per consume channel (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether the send channel uses publisher confirms
    pub confirm_mode: bool,

    /// Identifier for logging (defaults to a short UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("driver-{}", &Uuid::new_v4().to_string()[..8]),
        }
    }
}

/// Opens the send channel and one consume channel per channel group.
pub struct ChannelManager {
    connection: Arc<dyn AmqpConnection>,
    config: ChannelConfig,
    send: Option<Arc<dyn AmqpChannel>>,
    consume: BTreeMap<String, Arc<dyn AmqpChannel>>,
}

impl ChannelManager {
    pub fn new(connection: Arc<dyn AmqpConnection>, config: ChannelConfig) -> Self {
        debug!(
            driver_id = %config.id,
            prefetch = %config.prefetch_count,
            confirm = %config.confirm_mode,
            "Creating channel manager"
        );

        Self {
            connection,
            config,
            send: None,
            consume: BTreeMap::new(),
        }
    }

    /// The shared channel every outgoing publish goes through.
    pub async fn open_send_channel(&mut self) -> Result<Arc<dyn AmqpChannel>> {
        if let Some(channel) = &self.send {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let channel = self.connection.create_channel().await?;
        if self.config.confirm_mode {
            channel.confirm_select().await?;
        }

        info!(driver_id = %self.config.id, channel_id = channel.id(), "Send channel ready");
        self.send = Some(channel.clone());
        Ok(channel)
    }

    /// Returns the consume channel for `group`, opening it on first use.
    pub async fn open_consume_channel(&mut self, group: &str) -> Result<Arc<dyn AmqpChannel>> {
        if let Some(channel) = self.consume.get(group) {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let channel = self.connection.create_channel().await.map_err(|e| {
            DriverError::Channel(format!("group '{}': {}", group, e))
        })?;

        if self.config.prefetch_count > 0 {
            if let Err(e) = channel.basic_qos(self.config.prefetch_count).await {
                // A channel we cannot configure is not handed out.
                let _ = channel.close().await;
                return Err(DriverError::Channel(format!("group '{}': {}", group, e)));
            }
        }

        info!(
            driver_id = %self.config.id,
            channel_id = channel.id(),
            group = %group,
            "Consume channel ready"
        );
        self.consume.insert(group.to_string(), channel.clone());
        Ok(channel)
    }

    /// Closes every channel, consume channels first. Failures are logged and returned, never short-circuit.
    pub async fn close_all(&mut self) -> Vec<DriverError> {
        let mut failures = Vec::new();

        let consume = std::mem::take(&mut self.consume);
        for (group, channel) in consume {
            if !channel.is_open() {
                continue;
            }
            if let Err(e) = channel.close().await {
                error!(group = %group, channel_id = channel.id(), "Failed to close consume channel: {}", e);
                failures.push(e);
            }
        }

        if let Some(channel) = self.send.take() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    error!(channel_id = channel.id(), "Failed to close send channel: {}", e);
                    failures.push(e);
                }
            }
        }

        failures
    }
}
