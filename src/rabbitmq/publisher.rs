use std::sync::Arc;

use lapin::BasicProperties;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, DeclaredQueue, QueueOptions};
use super::errors::{DriverError, Result};

/// The default exchange routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

const COMMAND_BUFFER: usize = 64;

enum Command {
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: BasicProperties,
        reply: oneshot::Sender<Result<()>>,
    },
    Declare {
        name: String,
        options: QueueOptions,
        reply: oneshot::Sender<Result<DeclaredQueue>>,
    },
}

/// Cloneable front for the send channel.
///
/// All operations go through one publisher task, so the channel is never
/// used concurrently no matter how many handlers hold a handle.
#[derive(Clone, Debug)]
pub struct SendHandle {
    sender: mpsc::Sender<Command>,
}

impl SendHandle {
    /// A handle whose every operation fails with `DriverError::Closed`.
    pub fn closed() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self { sender }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        properties: BasicProperties,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            properties,
            reply,
        })
        .await?;
        response.await.map_err(|_| DriverError::Closed)?
    }

    /// Publishes raw bytes to `queue` through the default exchange.
    pub async fn publish_to_queue(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.publish(DEFAULT_EXCHANGE, queue, payload, BasicProperties::default())
            .await
    }

    pub async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;

        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        self.publish(DEFAULT_EXCHANGE, queue, payload, properties).await
    }

    /// Declares a queue on the send channel. Repeating an identical declaration is a no-op.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<DeclaredQueue> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Declare {
            name: name.to_string(),
            options,
            reply,
        })
        .await?;
        response.await.map_err(|_| DriverError::Closed)?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.sender.send(command).await.map_err(|_| DriverError::Closed)
    }
}

/// Starts the task that owns the send channel. It exits when `stop` flips to true.
pub(crate) fn spawn_publisher(
    channel: Arc<dyn AmqpChannel>,
    mut stop: watch::Receiver<bool>,
) -> (SendHandle, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::channel::<Command>(COMMAND_BUFFER);

    let task = tokio::spawn(async move {
        info!(channel_id = channel.id(), "Publisher started");
        loop {
            let command = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                command = receiver.recv() => command,
            };

            let Some(command) = command else { break };
            execute(channel.as_ref(), command).await;
        }
        debug!(channel_id = channel.id(), "Publisher stopped");
    });

    (SendHandle { sender }, task)
}

async fn execute(channel: &dyn AmqpChannel, command: Command) {
    match command {
        Command::Publish {
            exchange,
            routing_key,
            payload,
            properties,
            reply,
        } => {
            let result = channel
                .basic_publish(&exchange, &routing_key, &payload, properties)
                .await;
            match &result {
                Ok(()) => debug!(exchange = %exchange, routing_key = %routing_key, bytes = payload.len(), "Published message"),
                Err(e) => error!(exchange = %exchange, routing_key = %routing_key, "Publish failed: {}", e),
            }
            let _ = reply.send(result);
        }
        Command::Declare { name, options, reply } => {
            let result = channel.queue_declare(&name, &options).await;
            if let Err(e) = &result {
                error!(queue = %name, "Declare failed: {}", e);
            }
            let _ = reply.send(result);
        }
    }
}
