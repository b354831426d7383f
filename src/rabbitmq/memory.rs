// src/rabbitmq/memory.rs
//
// An in-process broker behind the transport traits. It routes through the
// default exchange only, which is all the driver uses.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use lapin::BasicProperties;

use super::amqp_client::{
    AmqpChannel, AmqpConnection, AmqpTransport, ConsumeOptions, DeclaredQueue, DeliveryStream,
    ErrorCallback, QueueOptions, RawDelivery,
};
use super::connection::ConnectionParams;
use super::errors::{DriverError, Result};

/// A message as recorded by the broker when it was published.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub routed: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: BasicProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u16,
    no_ack: bool,
    exclusive: bool,
    sender: UnboundedSender<Result<RawDelivery>>,
}

#[derive(Default)]
struct MemoryQueue {
    options: QueueOptions,
    declarations: usize,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: bool,
    connect_delay: Option<Duration>,
    fail_channel_opens: HashSet<usize>,
    fail_channel_closes: HashSet<u16>,
    channel_opens: usize,
    connections_made: usize,
    open_connections: usize,
    next_channel_id: u16,
    open_channels: HashSet<u16>,
    delivery_tags: HashMap<u16, u64>,
    unacked: HashMap<(u16, u64), (String, StoredMessage)>,
    queues: BTreeMap<String, MemoryQueue>,
    published: Vec<PublishedMessage>,
    acked: Vec<(String, Vec<u8>)>,
    nacked: Vec<(String, Vec<u8>, bool)>,
    rejected: Vec<(String, Vec<u8>, bool)>,
    error_callbacks: Vec<ErrorCallback>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8], properties: BasicProperties) -> Result<()> {
        if !exchange.is_empty() {
            return Err(DriverError::Publish(format!(
                "NOT_FOUND - no exchange '{}' in the in-memory broker",
                exchange
            )));
        }

        let routed = self.queues.contains_key(routing_key);
        self.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
            routed,
        });

        if let Some(queue) = self.queues.get_mut(routing_key) {
            queue.ready.push_back(StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                properties,
                redelivered: false,
            });
            self.dispatch(routing_key);
        }
        Ok(())
    }

    /// Hands ready messages to consumers round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else { return };
            queue.consumers.retain(|c| !c.sender.is_closed());
            if queue.consumers.is_empty() || queue.ready.is_empty() {
                return;
            }

            let index = queue.next_consumer % queue.consumers.len();
            queue.next_consumer = index + 1;
            let Some(message) = queue.ready.pop_front() else { return };

            let channel_id = queue.consumers[index].channel_id;
            let no_ack = queue.consumers[index].no_ack;
            let tag = self.delivery_tags.entry(channel_id).or_insert(0);
            *tag += 1;
            let delivery_tag = *tag;

            let delivery = RawDelivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let Some(queue) = self.queues.get_mut(queue_name) else { return };
            if queue.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                queue.ready.push_front(message);
                continue;
            }
            if !no_ack {
                self.unacked
                    .insert((channel_id, delivery_tag), (queue_name.to_string(), message));
            }
        }
    }

    fn take_unacked(&mut self, channel_id: u16, delivery_tag: u64) -> Result<(String, StoredMessage)> {
        if !self.open_channels.contains(&channel_id) {
            return Err(DriverError::Ack(format!("channel {} is closed", channel_id)));
        }
        self.unacked.remove(&(channel_id, delivery_tag)).ok_or_else(|| {
            DriverError::Ack(format!(
                "PRECONDITION_FAILED - unknown delivery tag {} on channel {}",
                delivery_tag, channel_id
            ))
        })
    }

    fn requeue(&mut self, queue_name: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_front(message);
        }
        self.dispatch(queue_name);
    }

    fn close_channel(&mut self, channel_id: u16) -> bool {
        if !self.open_channels.remove(&channel_id) {
            return false;
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let orphaned: Vec<_> = self
            .unacked
            .keys()
            .filter(|(ch, _)| *ch == channel_id)
            .copied()
            .collect();
        for key in orphaned {
            if let Some((queue_name, message)) = self.unacked.remove(&key) {
                self.requeue(&queue_name, message);
            }
        }
        true
    }
}

/// In-memory broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Mutex<BrokerState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every following connection attempt fails the handshake.
    pub fn refuse_connections(&self) {
        self.state().refuse_connections = true;
    }

    /// Delays each handshake, e.g. to exercise connect timeouts.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// The n-th channel open (1-based, counted across all connections) fails.
    pub fn fail_channel_open(&self, nth: usize) {
        self.state().fail_channel_opens.insert(nth);
    }

    /// Closing the channel with this id fails and leaves it open. Closing its
    /// connection still closes it.
    pub fn fail_channel_close(&self, channel_id: u16) {
        self.state().fail_channel_closes.insert(channel_id);
    }

    /// Drops every connection as if the broker went away.
    pub fn fail_connections(&self) {
        let callbacks = {
            let mut state = self.state();
            let channels: Vec<u16> = state.open_channels.iter().copied().collect();
            for channel_id in channels {
                state.close_channel(channel_id);
            }
            state.open_connections = 0;
            std::mem::take(&mut state.error_callbacks)
        };
        for callback in callbacks {
            callback(DriverError::Connection(
                "CONNECTION_FORCED - broker forced connection closure".to_string(),
            ));
        }
    }

    /// Publishes as another process would, bypassing any driver.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        let _ = self.state().route("", queue, &body, BasicProperties::default());
    }

    /// Declares a queue as another process would.
    pub fn declare(&self, queue: &str) {
        self.state().queues.entry(queue.to_string()).or_default().declarations += 1;
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state().queues.get(queue).map(|q| q.options.clone())
    }

    pub fn declare_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.declarations)
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .acked
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// `(body, requeue)` for every nack on `queue`.
    pub fn nacked(&self, queue: &str) -> Vec<(Vec<u8>, bool)> {
        self.state()
            .nacked
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, body, requeue)| (body.clone(), *requeue))
            .collect()
    }

    /// `(body, requeue)` for every reject on `queue`.
    pub fn rejected(&self, queue: &str) -> Vec<(Vec<u8>, bool)> {
        self.state()
            .rejected
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, body, requeue)| (body.clone(), *requeue))
            .collect()
    }

    pub fn connections_made(&self) -> usize {
        self.state().connections_made
    }

    pub fn open_connections(&self) -> usize {
        self.state().open_connections
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channel_opens
    }

    pub fn open_channels(&self) -> usize {
        self.state().open_channels.len()
    }
}

#[async_trait]
impl AmqpTransport for MemoryTransport {
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn AmqpConnection>> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.refuse_connections {
            return Err(DriverError::Connection(format!(
                "connection refused by {}:{}",
                params.host, params.port
            )));
        }
        state.connections_made += 1;
        state.open_connections += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            channels: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<Mutex<BrokerState>>,
    channels: Mutex<Vec<u16>>,
    open: AtomicBool,
}

impl MemoryConnection {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        if !self.is_open() {
            return Err(DriverError::Connection("connection is closed".to_string()));
        }

        let mut state = self.state();
        state.channel_opens += 1;
        let nth = state.channel_opens;
        if state.fail_channel_opens.contains(&nth) {
            return Err(DriverError::Channel(format!("channel open #{} refused", nth)));
        }

        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.open_channels.insert(id);
        drop(state);

        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.state().error_callbacks.push(callback);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.state().open_connections > 0
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(DriverError::Connection("connection already closed".to_string()));
        }

        let channels = std::mem::take(
            &mut *self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let mut state = self.state();
        for channel_id in channels {
            state.close_channel(channel_id);
        }
        state.open_connections = state.open_connections.saturating_sub(1);
        Ok(())
    }
}

struct MemoryChannel {
    id: u16,
    broker: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.broker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.state();
        if !state.open_channels.contains(&self.id) {
            return Err(DriverError::Channel(format!("channel {} is closed", self.id)));
        }
        Ok(state)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.state().open_channels.contains(&self.id)
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<()> {
        self.open_state().map(|_| ())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.open_state().map(|_| ())
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<DeclaredQueue> {
        let mut state = self.open_state()?;
        let queue = state.queues.entry(name.to_string()).or_insert_with(|| MemoryQueue {
            options: options.clone(),
            ..MemoryQueue::default()
        });

        if queue.declarations > 0 && queue.options != *options {
            return Err(DriverError::Channel(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                name
            )));
        }
        queue.declarations += 1;

        Ok(DeclaredQueue {
            name: name.to_string(),
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;
        let entry = state.queues.get_mut(queue).ok_or_else(|| {
            DriverError::Channel(format!("NOT_FOUND - no queue '{}'", queue))
        })?;

        entry.consumers.retain(|c| !c.sender.is_closed());
        if entry.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !entry.consumers.is_empty())
        {
            return Err(DriverError::Channel(format!(
                "ACCESS_REFUSED - queue '{}' has an exclusive consumer",
                queue
            )));
        }

        let (sender, receiver) = unbounded();
        entry.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            sender,
        });
        state.dispatch(queue);

        Ok(receiver.boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let mut state = self
            .open_state()
            .map_err(|e| DriverError::Publish(e.to_string()))?;
        state.route(exchange, routing_key, payload, properties)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state();
        let (queue, message) = state.take_unacked(self.id, delivery_tag)?;
        state.acked.push((queue, message.body));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state();
        let (queue, message) = state.take_unacked(self.id, delivery_tag)?;
        state.nacked.push((queue.clone(), message.body.clone(), requeue));
        if requeue {
            state.requeue(&queue, message);
        }
        Ok(())
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state();
        let (queue, message) = state.take_unacked(self.id, delivery_tag)?;
        state.rejected.push((queue.clone(), message.body.clone(), requeue));
        if requeue {
            state.requeue(&queue, message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.fail_channel_closes.contains(&self.id) && state.open_channels.contains(&self.id) {
            return Err(DriverError::Channel(format!("channel {} close refused", self.id)));
        }
        if state.close_channel(self.id) {
            Ok(())
        } else {
            Err(DriverError::Channel(format!("channel {} already closed", self.id)))
        }
    }
}
