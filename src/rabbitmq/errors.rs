// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    #[error("Handler for queue '{queue}' failed: {message}")]
    Handler { queue: String, message: String },

    #[error("Driver is not ready (state: {0})")]
    NotReady(String),

    #[error("Driver has already been initialized")]
    AlreadyInitialized,

    #[error("Driver is already listening")]
    AlreadyListening,

    #[error("RabbitMQ publish error: {0}")]
    Publish(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    Ack(String),

    #[error("Driver is closed")]
    Closed,

    #[error("Connection timeout: {0}")]
    Timeout(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),
}

// Custom Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// True for errors that come from misusing the driver's state machine.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            DriverError::NotReady(_) | DriverError::AlreadyInitialized | DriverError::AlreadyListening
        )
    }
}

impl From<Elapsed> for DriverError {
    fn from(_: Elapsed) -> Self {
        DriverError::Timeout("Connection timed out".to_string())
    }
}
