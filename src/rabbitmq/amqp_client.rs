// src/rabbitmq/amqp_client.rs
//
// The broker seam. The driver only ever sees these traits; `LapinTransport`
// speaks AMQP 0-9-1 through lapin and `memory::MemoryTransport` stands in for
// a broker in tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::debug;

use super::connection::ConnectionParams;
use super::errors::{DriverError, Result};

/// Parameters for a queue declaration. Everything defaults to the broker's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// What the broker reported back for a successful declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A delivery as it comes off a consume channel, before it is bound to a queue spec.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Invoked from the transport's I/O side when the connection fails after it was established.
pub type ErrorCallback = Box<dyn Fn(DriverError) + Send + Sync>;

#[async_trait]
pub trait AmqpTransport: Send + Sync {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    fn on_error(&self, callback: ErrorCallback);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<DeclaredQueue>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Production transport backed by lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    let userinfo = match &params.credentials {
        Some(creds) => AMQPUserInfo {
            username: creds.username.clone(),
            password: creds.password.clone(),
        },
        None => AMQPUserInfo::default(),
    };

    AMQPUri {
        authority: AMQPAuthority {
            userinfo,
            host: params.host.clone(),
            port: params.port,
        },
        ..AMQPUri::default()
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn AmqpConnection>> {
        let connection = Connection::connect_uri(amqp_uri(params), ConnectionProperties::default())
            .await
            .map_err(|e| {
                DriverError::Connection(format!(
                    "Failed to connect to {}:{}: {}",
                    params.host, params.port, e
                ))
            })?;

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| DriverError::Channel(format!("Failed to create channel: {}", e)))?;

        debug!(channel_id = channel.id(), "Channel opened");
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.inner
            .on_error(move |err| callback(DriverError::Connection(err.to_string())));
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(200, "Closing connection")
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| DriverError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| DriverError::Channel(format!("Failed to enable confirms: {}", e)))
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<DeclaredQueue> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                options.arguments.clone(),
            )
            .await
            .map_err(|e| DriverError::Channel(format!("Failed to declare queue '{}': {}", name, e)))?;

        Ok(DeclaredQueue {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Channel(format!("Failed to consume '{}': {}", queue, e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| RawDelivery {
                    delivery_tag: d.delivery_tag,
                    exchange: d.exchange.as_str().to_string(),
                    routing_key: d.routing_key.as_str().to_string(),
                    redelivered: d.redelivered,
                    properties: d.properties,
                    body: d.data,
                })
                .map_err(|e| DriverError::Channel(e.to_string()))
        });

        Ok(stream.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| DriverError::Publish(e.to_string()))?;

        // Resolves immediately when the channel is not in confirm mode.
        let confirmation = confirm
            .await
            .map_err(|e| DriverError::Publish(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(DriverError::Publish(format!(
                "Broker rejected message for routing key '{}'",
                routing_key
            )));
        }
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| DriverError::Ack(e.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| DriverError::Ack(e.to_string()))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| DriverError::Ack(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(200, "Closing channel")
            .await
            .map_err(|e| DriverError::Channel(e.to_string()))
    }
}
