// src/rabbitmq/dispatch.rs
//
// Bounded worker pool that runs message handlers off the broker I/O path.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, warn};

use super::amqp_client::AmqpChannel;
use super::errors::{DriverError, Result};
use super::publisher::SendHandle;
use super::queue::AckMode;

pub const DEFAULT_CONCURRENCY: usize = 5;

/// User code attached to a queue.
///
/// In manual-ack mode the handler owns settlement: call `ack`, `nack` or
/// `reject` on the delivery before returning.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: DeliveryEvent, publisher: SendHandle) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(DeliveryEvent, SendHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: DeliveryEvent, publisher: SendHandle) -> anyhow::Result<()> {
        (self)(delivery, publisher).await
    }
}

/// What happens to a manual-ack delivery whose handler failed without settling it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnsettledPolicy {
    /// Nack with requeue on first delivery, reject without requeue once redelivered.
    #[default]
    RequeueOnce,
    /// Neither ack nor reject; the broker redelivers only when the channel goes away.
    Leave,
}

/// One inbound message, bound to the queue and channel it arrived on.
pub struct DeliveryEvent {
    pub queue: String,
    pub channel: Arc<dyn AmqpChannel>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    ack_mode: AckMode,
    settled: Arc<AtomicBool>,
}

impl fmt::Debug for DeliveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEvent")
            .field("queue", &self.queue)
            .field("channel_id", &self.channel.id())
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl DeliveryEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        channel: Arc<dyn AmqpChannel>,
        ack_mode: AckMode,
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Self {
        Self {
            queue: queue.into(),
            channel,
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            properties,
            body,
            // Auto-ack deliveries are settled by the broker on receipt.
            settled: Arc::new(AtomicBool::new(ack_mode == AckMode::Auto)),
            ack_mode,
        }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub async fn ack(&self) -> Result<()> {
        if self.ack_mode == AckMode::Auto {
            debug!(queue = %self.queue, delivery_tag = self.delivery_tag, "Ack ignored in auto-ack mode");
            return Ok(());
        }
        self.claim()?;
        self.channel.basic_ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.manual_only("nack")?;
        self.claim()?;
        self.channel.basic_nack(self.delivery_tag, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.manual_only("reject")?;
        self.claim()?;
        self.channel.basic_reject(self.delivery_tag, requeue).await
    }

    fn manual_only(&self, op: &str) -> Result<()> {
        if self.ack_mode == AckMode::Auto {
            return Err(DriverError::Ack(format!(
                "cannot {} delivery {} on auto-ack queue '{}'",
                op, self.delivery_tag, self.queue
            )));
        }
        Ok(())
    }

    fn claim(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(DriverError::Ack(format!(
                "delivery {} on queue '{}' is already settled",
                self.delivery_tag, self.queue
            )));
        }
        Ok(())
    }

    fn settlement(&self) -> Settlement {
        Settlement {
            channel: self.channel.clone(),
            delivery_tag: self.delivery_tag,
            redelivered: self.redelivered,
            settled: self.settled.clone(),
        }
    }
}

/// Kept by the worker so it can settle a delivery after the handler consumed it.
struct Settlement {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    redelivered: bool,
    settled: Arc<AtomicBool>,
}

impl Settlement {
    async fn apply(&self, queue: &str, policy: UnsettledPolicy) {
        if self.settled.load(Ordering::Acquire) {
            return;
        }

        match policy {
            UnsettledPolicy::Leave => {
                warn!(queue, delivery_tag = self.delivery_tag, "Leaving failed delivery unsettled");
            }
            UnsettledPolicy::RequeueOnce => {
                if self.settled.swap(true, Ordering::AcqRel) {
                    return;
                }
                let result = if self.redelivered {
                    warn!(queue, delivery_tag = self.delivery_tag, "Rejecting failed redelivery");
                    self.channel.basic_reject(self.delivery_tag, false).await
                } else {
                    warn!(queue, delivery_tag = self.delivery_tag, "Requeueing failed delivery");
                    self.channel.basic_nack(self.delivery_tag, true).await
                };
                if let Err(e) = result {
                    error!(queue, delivery_tag = self.delivery_tag, "Failed to settle delivery: {}", e);
                }
            }
        }
    }
}

struct Job {
    handler: Arc<dyn MessageHandler>,
    event: DeliveryEvent,
}

/// Fixed-size pool; at most `size` handlers run at once across all queues.
#[derive(Clone)]
pub struct DispatchPool {
    sender: mpsc::Sender<Job>,
    stop: Arc<watch::Sender<bool>>,
}

impl DispatchPool {
    pub fn new(size: usize, publisher: SendHandle, policy: UnsettledPolicy) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(size * 4);
        let receiver = Arc::new(Mutex::new(receiver));
        let (stop, _) = watch::channel(false);

        // Workers exit on their own once `stop` is set.
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let stop = stop.subscribe();
            let publisher = publisher.clone();
            tokio::spawn(worker_loop(worker_id, receiver, stop, publisher, policy));
        }

        debug!(size, "Dispatch pool started");

        Self {
            sender,
            stop: Arc::new(stop),
        }
    }

    /// Queues a handler invocation. Waits while the submission queue is full.
    pub async fn submit(&self, handler: Arc<dyn MessageHandler>, event: DeliveryEvent) -> Result<()> {
        if *self.stop.borrow() {
            return Err(DriverError::Closed);
        }
        self.sender
            .send(Job { handler, event })
            .await
            .map_err(|_| DriverError::Closed)
    }

    /// Stops the workers. Submissions not yet picked up are dropped; running handlers finish.
    pub fn shutdown(&self) {
        if self.stop.send_replace(true) {
            return;
        }
        // Approximate: workers may still take queued jobs before they see `stop`.
        let pending = self.sender.max_capacity() - self.sender.capacity();
        if pending > 0 {
            warn!("Discarding up to {} queued deliveries on shutdown", pending);
        }
        debug!("Dispatch pool stopping");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut stop: watch::Receiver<bool>,
    publisher: SendHandle,
    policy: UnsettledPolicy,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let job = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            job = async { receiver.lock().await.recv().await } => job,
        };

        let Some(job) = job else { break };
        run_job(worker_id, job, &publisher, policy).await;
    }

    debug!(worker_id, "Dispatch worker exiting");
}

async fn run_job(worker_id: usize, job: Job, publisher: &SendHandle, policy: UnsettledPolicy) {
    let queue = job.event.queue.clone();
    let delivery_tag = job.event.delivery_tag;
    let manual = job.event.ack_mode == AckMode::Manual;
    let settlement = job.event.settlement();

    debug!(worker_id, queue = %queue, delivery_tag, "Dispatching delivery");

    let outcome = AssertUnwindSafe(job.handler.handle(job.event, publisher.clone()))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{:#}", e)),
        Err(panic) => Some(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    };

    match failure {
        None => {
            if manual && !settlement.settled.load(Ordering::Acquire) {
                warn!(queue = %queue, delivery_tag, "Manual-ack handler returned without settling");
            }
        }
        Some(message) => {
            let err = DriverError::Handler {
                queue: queue.clone(),
                message,
            };
            error!(queue = %queue, delivery_tag, "{}", err);
            if manual {
                settlement.apply(&queue, policy).await;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_rendered() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn default_policy_requeues_once() {
        assert_eq!(UnsettledPolicy::default(), UnsettledPolicy::RequeueOnce);
    }
}
