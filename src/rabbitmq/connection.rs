use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::amqp_client::{AmqpConnection, AmqpTransport};
use super::errors::{DriverError, Result};

pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5000;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Process-wide broker settings used when an explicit argument is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Explicit connection arguments handed to `Driver::initialize`.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials: Option<Credentials>,
    pub concurrency: Option<usize>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Fully resolved parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

impl ConnectionParams {
    /// Explicit arguments win, then the fallback settings. There is no default host or port.
    pub fn resolve(
        options: &ConnectOptions,
        fallback: &BrokerSettings,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let host = options
            .host
            .clone()
            .or_else(|| fallback.host.clone())
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| DriverError::Configuration("broker host is not configured".to_string()))?;

        let port = options
            .port
            .or(fallback.port)
            .ok_or_else(|| DriverError::Configuration("broker port is not configured".to_string()))?;

        let credentials = match &options.credentials {
            Some(creds) => Some(creds.clone()),
            None => match (&fallback.username, &fallback.password) {
                (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
                (None, None) => None,
                _ => {
                    return Err(DriverError::Configuration(
                        "broker username and password must be provided together".to_string(),
                    ))
                }
            },
        };

        if let Some(creds) = &credentials {
            if creds.username.is_empty() {
                return Err(DriverError::Configuration(
                    "broker username must not be empty".to_string(),
                ));
            }
        }

        Ok(Self {
            host,
            port,
            credentials,
            timeout: connect_timeout,
        })
    }
}

/// Owns the single broker connection for one driver.
pub struct ConnectionManager {
    transport: Arc<dyn AmqpTransport>,
    connection: Option<Arc<dyn AmqpConnection>>,
    max_connect_attempts: u32,
    connect_delay_ms: u64,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn AmqpTransport>) -> Self {
        ConnectionManager {
            transport,
            connection: None,
            max_connect_attempts: 1,
            connect_delay_ms: 1000,
        }
    }

    /// Retries only the initial handshake. A connection that drops later is never re-opened.
    pub fn with_retry_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_connect_attempts = max_attempts.max(1);
        self.connect_delay_ms = initial_delay_ms;
        self
    }

    pub async fn open(&mut self, params: &ConnectionParams) -> Result<Arc<dyn AmqpConnection>> {
        if let Some(conn) = &self.connection {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }

        let mut attempts = 0;
        let mut delay = self.connect_delay_ms;

        loop {
            info!(host = %params.host, port = params.port, "Connecting to RabbitMQ");

            let outcome = match timeout(params.timeout, self.transport.connect(params)).await {
                Ok(result) => result,
                Err(elapsed) => Err(DriverError::Connection(format!(
                    "{} after {}ms",
                    DriverError::from(elapsed),
                    params.timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(conn) => {
                    info!(host = %params.host, port = params.port, "Connected to RabbitMQ");
                    self.connection = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_connect_attempts, err
                    );

                    if attempts >= self.max_connect_attempts {
                        return Err(match err {
                            DriverError::Connection(_) => err,
                            other => DriverError::Connection(other.to_string()),
                        });
                    }

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    warn!("Waiting {}ms before next connect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay * 2, 30000);
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            info!("Closing RabbitMQ connection");
            conn.close().await?;
        }
        Ok(())
    }
}
