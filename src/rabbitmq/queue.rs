// src/rabbitmq/queue.rs
//
// Queue specifications, the registry that maps names to them, and the
// declare-then-consume step run on each consume channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, ConsumeOptions, DeclaredQueue, QueueOptions};
use super::dispatch::{DeliveryEvent, DispatchPool, MessageHandler};
use super::errors::Result;

pub const DEFAULT_CHANNEL_GROUP: &str = "default";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a delivery settled as soon as it is sent.
    #[default]
    Auto,
    /// The handler must ack, nack or reject each delivery.
    Manual,
}

/// Which consume channel a queue is declared on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelTarget {
    /// The shared consume channel.
    #[default]
    Default,
    /// A channel shared by every queue naming the same group.
    Group(String),
    /// A channel of its own.
    Dedicated,
}

impl ChannelTarget {
    pub fn group_key(&self, queue: &str) -> String {
        match self {
            ChannelTarget::Default => DEFAULT_CHANNEL_GROUP.to_string(),
            ChannelTarget::Group(name) => format!("group:{}", name),
            ChannelTarget::Dedicated => format!("queue:{}", queue),
        }
    }
}

/// How one named queue is set up.
#[derive(Clone)]
pub struct QueueSpec {
    pub name: String,
    pub handler: Option<Arc<dyn MessageHandler>>,
    pub ack_mode: AckMode,
    pub exclusive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub consumer_tag: Option<String>,
    pub arguments: FieldTable,
    pub channel: ChannelTarget,
}

impl fmt::Debug for QueueSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueSpec")
            .field("name", &self.name)
            .field("has_handler", &self.handler.is_some())
            .field("ack_mode", &self.ack_mode)
            .field("exclusive", &self.exclusive)
            .field("durable", &self.durable)
            .field("auto_delete", &self.auto_delete)
            .field("consumer_tag", &self.consumer_tag)
            .field("channel", &self.channel)
            .finish()
    }
}

impl QueueSpec {
    /// A publish-only queue with broker defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            ack_mode: AckMode::Auto,
            exclusive: false,
            durable: false,
            auto_delete: false,
            consumer_tag: None,
            arguments: FieldTable::default(),
            channel: ChannelTarget::Default,
        }
    }

    pub fn handler<H: MessageHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn manual_ack(mut self) -> Self {
        self.ack_mode = AckMode::Manual;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn channel(mut self, target: ChannelTarget) -> Self {
        self.channel = target;
        self
    }

    pub fn is_publish_only(&self) -> bool {
        self.handler.is_none()
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.arguments.clone(),
        }
    }

    /// The explicit tag, or `<queue>-<8 hex chars>`.
    pub fn resolved_consumer_tag(&self) -> String {
        self.consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, &Uuid::new_v4().simple().to_string()[..8]))
    }
}

/// Where a registered queue ended up after setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Declared { channel_id: u16 },
    Consuming { channel_id: u16, consumer_tag: String },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RegisteredQueue {
    pub spec: QueueSpec,
    pub status: QueueStatus,
}

/// Queue name to spec. Never shrinks during a run.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, RegisteredQueue>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the spec for `spec.name`.
    pub fn register(&mut self, spec: QueueSpec) -> &mut Self {
        if self.queues.contains_key(&spec.name) {
            debug!(queue = %spec.name, "Replacing queue spec");
        }
        self.queues.insert(
            spec.name.clone(),
            RegisteredQueue {
                spec,
                status: QueueStatus::Pending,
            },
        );
        self
    }

    pub fn with(mut self, spec: QueueSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredQueue> {
        self.queues.get(name)
    }

    pub fn status(&self, name: &str) -> Option<&QueueStatus> {
        self.queues.get(name).map(|q| &q.status)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Queue specs grouped by the consume channel they belong to.
    pub fn channel_groups(&self) -> BTreeMap<String, Vec<QueueSpec>> {
        let mut groups: BTreeMap<String, Vec<QueueSpec>> = BTreeMap::new();
        for queue in self.queues.values() {
            groups
                .entry(queue.spec.channel.group_key(&queue.spec.name))
                .or_default()
                .push(queue.spec.clone());
        }
        groups
    }

    pub(crate) fn set_status(&mut self, name: &str, status: QueueStatus) {
        if let Some(queue) = self.queues.get_mut(name) {
            queue.status = status;
        }
    }
}

/// Declares `spec` on `channel` and, when it has a handler, attaches a consumer
/// that feeds the pool. The consumer only starts after the declaration succeeded.
pub async fn declare(
    channel: Arc<dyn AmqpChannel>,
    spec: &QueueSpec,
    pool: &DispatchPool,
) -> Result<(QueueStatus, Option<JoinHandle<()>>)> {
    let declared: DeclaredQueue = channel.queue_declare(&spec.name, &spec.queue_options()).await?;

    info!(
        queue = %spec.name,
        channel_id = channel.id(),
        messages = declared.message_count,
        consumers = declared.consumer_count,
        "Queue declared"
    );

    let Some(handler) = spec.handler.clone() else {
        return Ok((QueueStatus::Declared { channel_id: channel.id() }, None));
    };

    let consumer_tag = spec.resolved_consumer_tag();
    let mut deliveries = channel
        .basic_consume(
            &spec.name,
            &consumer_tag,
            ConsumeOptions {
                no_ack: spec.ack_mode == AckMode::Auto,
                exclusive: spec.exclusive,
            },
        )
        .await?;

    info!(queue = %spec.name, consumer_tag = %consumer_tag, "Consumer attached");

    let queue = spec.name.clone();
    let ack_mode = spec.ack_mode;
    let pool = pool.clone();
    let consume_channel = channel.clone();
    let tag = consumer_tag.clone();

    let task = tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(raw) => {
                    let event = DeliveryEvent::new(
                        queue.clone(),
                        consume_channel.clone(),
                        ack_mode,
                        raw.delivery_tag,
                        raw.exchange,
                        raw.routing_key,
                        raw.redelivered,
                        raw.properties,
                        raw.body,
                    );
                    if pool.submit(handler.clone(), event).await.is_err() {
                        debug!(queue = %queue, "Dispatch pool closed, stopping consumer");
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %queue, consumer_tag = %tag, "Error receiving message: {}", e);
                    if !consume_channel.is_open() {
                        warn!(queue = %queue, "Consume channel closed");
                        break;
                    }
                }
            }
        }
        debug!(queue = %queue, consumer_tag = %tag, "Consumer finished");
    });

    Ok((
        QueueStatus::Consuming {
            channel_id: channel.id(),
            consumer_tag,
        },
        Some(task),
    ))
}
