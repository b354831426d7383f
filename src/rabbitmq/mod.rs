// src/rabbitmq/mod.rs
// Queue driver: one broker connection, multiplexed queues, bounded handler dispatch.

pub mod errors;
pub mod amqp_client;
pub mod connection;
pub mod channel_manager;
pub mod queue;
pub mod dispatch;
pub mod publisher;
pub mod driver;

#[cfg(feature = "test-export-mocks")]
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, AmqpConnection, AmqpTransport, LapinTransport, QueueOptions};
pub use channel_manager::ChannelConfig;
pub use connection::{BrokerSettings, ConnectOptions, Credentials};
pub use dispatch::{DeliveryEvent, MessageHandler, UnsettledPolicy, DEFAULT_CONCURRENCY};
pub use driver::{Driver, DriverBuilder, DriverState};
pub use errors::{DriverError, Result};
pub use publisher::SendHandle;
pub use queue::{AckMode, ChannelTarget, QueueRegistry, QueueSpec, QueueStatus};

#[cfg(feature = "test-export-mocks")]
pub use memory::MemoryTransport;
