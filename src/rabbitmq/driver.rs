// src/rabbitmq/driver.rs
//
// The facade: one connection, one send channel, consume channels per group,
// a registry of queues and the dispatch pool, driven through an explicit
// state machine.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::amqp_client::{AmqpTransport, LapinTransport};
use super::channel_manager::{ChannelConfig, ChannelManager};
use super::connection::{
    BrokerSettings, ConnectOptions, ConnectionManager, ConnectionParams,
    DEFAULT_CONNECTION_TIMEOUT_MS,
};
use super::dispatch::{DispatchPool, UnsettledPolicy, DEFAULT_CONCURRENCY};
use super::errors::{DriverError, Result};
use super::publisher::{spawn_publisher, SendHandle};
use super::queue::{self, QueueRegistry, QueueSpec, QueueStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Connecting,
    Ready,
    Listening,
    Closed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Uninitialized => "UNINITIALIZED",
            DriverState::Connecting => "CONNECTING",
            DriverState::Ready => "READY",
            DriverState::Listening => "LISTENING",
            DriverState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

pub struct DriverBuilder {
    transport: Option<Arc<dyn AmqpTransport>>,
    fallback: BrokerSettings,
    channel_config: ChannelConfig,
    unsettled_policy: UnsettledPolicy,
    connect_attempts: u32,
    connect_delay_ms: u64,
    connection_timeout: Duration,
    concurrency: usize,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            fallback: BrokerSettings::default(),
            channel_config: ChannelConfig::default(),
            unsettled_policy: UnsettledPolicy::default(),
            connect_attempts: 1,
            connect_delay_ms: 1000,
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl DriverBuilder {
    pub fn transport<T: AmqpTransport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Process-wide settings consulted when `initialize` is not given a value.
    pub fn fallback(mut self, settings: BrokerSettings) -> Self {
        self.fallback = settings;
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    pub fn unsettled_policy(mut self, policy: UnsettledPolicy) -> Self {
        self.unsettled_policy = policy;
        self
    }

    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn connect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.connect_delay_ms = delay_ms;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Pool size used when `initialize` is not given one.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn build(self) -> Driver {
        let (shutdown, _) = watch::channel(false);
        Driver {
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(LapinTransport::new())),
            fallback: self.fallback,
            channel_config: self.channel_config,
            unsettled_policy: self.unsettled_policy,
            connect_attempts: self.connect_attempts,
            connect_delay_ms: self.connect_delay_ms,
            connection_timeout: self.connection_timeout,
            concurrency: self.concurrency,
            state: Arc::new(Mutex::new(DriverState::Uninitialized)),
            registry: Mutex::new(QueueRegistry::new()),
            send_handle: Arc::new(Mutex::new(None)),
            session: tokio::sync::Mutex::new(None),
            shutdown: Arc::new(shutdown),
            connection_lost: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct Session {
    connection: ConnectionManager,
    channels: ChannelManager,
    pool: DispatchPool,
    publisher: JoinHandle<()>,
    consumers: Vec<JoinHandle<()>>,
}

pub struct Driver {
    transport: Arc<dyn AmqpTransport>,
    fallback: BrokerSettings,
    channel_config: ChannelConfig,
    unsettled_policy: UnsettledPolicy,
    connect_attempts: u32,
    connect_delay_ms: u64,
    connection_timeout: Duration,
    concurrency: usize,
    state: Arc<Mutex<DriverState>>,
    registry: Mutex<QueueRegistry>,
    send_handle: Arc<Mutex<Option<SendHandle>>>,
    session: tokio::sync::Mutex<Option<Session>>,
    shutdown: Arc<watch::Sender<bool>>,
    connection_lost: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for Driver {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Driver {
    pub fn builder() -> DriverBuilder {
        DriverBuilder::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DriverState {
        *lock(&self.state)
    }

    /// True once the broker reported the connection as failed.
    pub fn connection_lost(&self) -> bool {
        self.connection_lost.load(Ordering::Acquire)
    }

    /// Adds a queue before initialization. Returns false, and changes nothing,
    /// once setup has started: declaration happens once per run.
    pub fn register(&self, spec: QueueSpec) -> bool {
        if self.state() != DriverState::Uninitialized {
            warn!(queue = %spec.name, state = %self.state(), "Ignoring queue registration after setup");
            return false;
        }
        lock(&self.registry).register(spec);
        true
    }

    /// Snapshot of the registry, including each queue's setup status.
    pub fn registry(&self) -> QueueRegistry {
        lock(&self.registry).clone()
    }

    pub fn queue_status(&self, name: &str) -> Option<QueueStatus> {
        lock(&self.registry).status(name).cloned()
    }

    /// Connects, opens channels and declares every registered queue.
    ///
    /// Configuration problems are reported before any network attempt and leave
    /// the driver uninitialized. A failed connection or send channel moves the
    /// driver to `Closed`. A consume channel that fails to open only leaves its
    /// own queues undeclared.
    #[instrument(skip(self, registry, options), fields(driver_id = %self.channel_config.id))]
    pub async fn initialize(&self, registry: QueueRegistry, options: ConnectOptions) -> Result<()> {
        {
            let state = lock(&self.state);
            match *state {
                DriverState::Uninitialized => {}
                DriverState::Closed => return Err(DriverError::Closed),
                _ => return Err(DriverError::AlreadyInitialized),
            }
        }

        let params = ConnectionParams::resolve(&options, &self.fallback, self.connection_timeout)?;
        let concurrency = options.concurrency.unwrap_or(self.concurrency);
        if concurrency == 0 {
            return Err(DriverError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }

        {
            let mut state = lock(&self.state);
            if *state != DriverState::Uninitialized {
                return Err(DriverError::AlreadyInitialized);
            }
            *state = DriverState::Connecting;
        }

        let groups = {
            let mut current = lock(&self.registry);
            for name in registry.names() {
                if let Some(queue) = registry.get(name) {
                    current.register(queue.spec.clone());
                }
            }
            current.channel_groups()
        };

        let mut connection = ConnectionManager::new(self.transport.clone())
            .with_retry_policy(self.connect_attempts, self.connect_delay_ms);

        let conn = match connection.open(&params).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Driver could not connect: {}", e);
                *lock(&self.state) = DriverState::Closed;
                self.shutdown.send_replace(true);
                return Err(e);
            }
        };

        let mut channels = ChannelManager::new(conn.clone(), self.channel_config.clone());
        let send_channel = match channels.open_send_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!("Driver could not open its send channel: {}", e);
                if let Err(close_err) = connection.close().await {
                    error!("Failed to close connection: {}", close_err);
                }
                *lock(&self.state) = DriverState::Closed;
                self.shutdown.send_replace(true);
                return Err(e);
            }
        };

        let (send_handle, publisher) = spawn_publisher(send_channel, self.shutdown.subscribe());
        let pool = DispatchPool::new(concurrency, send_handle.clone(), self.unsettled_policy);

        {
            let state = self.state.clone();
            let shutdown = self.shutdown.clone();
            let lost = self.connection_lost.clone();
            let pool = pool.clone();
            let send_handle = self.send_handle.clone();
            // The session stays in place for close() or listen() to tear down.
            conn.on_error(Box::new(move |err| {
                error!("{}", err);
                lost.store(true, Ordering::Release);
                pool.shutdown();
                shutdown.send_replace(true);
                lock(&send_handle).take();
                let mut state = lock(&state);
                if *state != DriverState::Closed {
                    warn!(previous = %*state, "Driver closed after connection failure");
                    *state = DriverState::Closed;
                }
            }));
        }

        let mut consumers = Vec::new();
        for (group, specs) in groups {
            let channel = match channels.open_consume_channel(&group).await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(group = %group, queues = specs.len(), "Consume channel failed, queues left undeclared: {}", e);
                    let mut registry = lock(&self.registry);
                    for spec in &specs {
                        registry.set_status(&spec.name, QueueStatus::Failed(e.to_string()));
                    }
                    continue;
                }
            };

            for spec in &specs {
                let status = match queue::declare(channel.clone(), spec, &pool).await {
                    Ok((status, task)) => {
                        consumers.extend(task);
                        status
                    }
                    Err(e) => {
                        error!(queue = %spec.name, group = %group, "Queue setup failed: {}", e);
                        QueueStatus::Failed(e.to_string())
                    }
                };
                lock(&self.registry).set_status(&spec.name, status);
            }
        }

        let session = Session {
            connection,
            channels,
            pool,
            publisher,
            consumers,
        };

        *self.session.lock().await = Some(session);
        *lock(&self.send_handle) = Some(send_handle);

        let closed_during_setup = {
            let mut state = lock(&self.state);
            if *state == DriverState::Connecting {
                *state = DriverState::Ready;
                false
            } else {
                true
            }
        };

        if closed_during_setup {
            warn!("Driver closed during setup, tearing down");
            lock(&self.send_handle).take();
            let session = self.session.lock().await.take();
            if let Some(session) = session {
                let _ = teardown(session).await;
            }
            return Err(DriverError::Closed);
        }

        info!(queues = lock(&self.registry).len(), concurrency, "Driver ready");
        Ok(())
    }

    /// Handle for publishing through the shared send channel.
    pub fn send_handle(&self) -> Result<SendHandle> {
        match self.state() {
            DriverState::Ready | DriverState::Listening => lock(&self.send_handle)
                .clone()
                .ok_or_else(|| DriverError::NotReady(self.state().to_string())),
            DriverState::Closed => Err(DriverError::Closed),
            other => Err(DriverError::NotReady(other.to_string())),
        }
    }

    /// Waits until `close` is called, the connection fails, or the process is
    /// interrupted, then closes the driver.
    pub async fn listen(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                DriverState::Ready => *state = DriverState::Listening,
                DriverState::Listening => return Err(DriverError::AlreadyListening),
                DriverState::Closed => return Err(DriverError::Closed),
                other => return Err(DriverError::NotReady(other.to_string())),
            }
        }

        info!("Driver listening");
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => {}
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Interrupted, closing driver"),
                    Err(e) => error!("Failed to listen for interrupt: {}", e),
                }
            }
        }

        if self.connection_lost() {
            warn!("Connection lost, driver stopped listening");
        }

        self.close().await
    }

    /// Closes every channel, then the connection. Safe to call more than once
    /// and from any task; in-flight handlers are not interrupted.
    pub async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, DriverState::Closed)
        };
        self.shutdown.send_replace(true);
        lock(&self.send_handle).take();

        // Waits for a teardown already running in another task.
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            if previous != DriverState::Closed {
                info!(previous = %previous, "Driver closed");
            }
            return Ok(());
        };

        let result = teardown(session).await;
        info!(previous = %previous, "Driver closed");
        result
    }
}

async fn teardown(mut session: Session) -> Result<()> {
    session.pool.shutdown();

    let failures = session.channels.close_all().await;
    if !failures.is_empty() {
        warn!(failures = failures.len(), "Some channels failed to close");
    }

    for consumer in session.consumers.drain(..) {
        consumer.abort();
    }

    let result = session.connection.close().await;
    if let Err(e) = &result {
        error!("Failed to close connection: {}", e);
    }

    // The publisher exits on the shutdown signal once its current command is done.
    drop(session.publisher);
    result
}
