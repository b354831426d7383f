// src/relay.rs
//
// Bucket to work queue: one ImageMessage per object, then optionally wait on
// the results queue.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use crate::message::ImageMessage;
use crate::rabbitmq::{ConnectOptions, DeliveryEvent, Driver, QueueRegistry, QueueSpec, SendHandle};
use crate::storage::{object_url, ObjectLister};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub bucket: String,
    pub publish_queue: String,
    pub results_queue: Option<String>,
    /// Base of every published `imageUrl`.
    pub storage_uri: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub listed: usize,
    pub published: usize,
}

async fn log_result(delivery: DeliveryEvent, _publisher: SendHandle) -> anyhow::Result<()> {
    info!(
        queue = %delivery.queue,
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        "Result received: {}",
        delivery.body_str()
    );
    delivery.ack().await?;
    Ok(())
}

pub fn registry(options: &RelayOptions) -> QueueRegistry {
    let mut registry = QueueRegistry::new();
    registry.register(QueueSpec::new(options.publish_queue.clone()));
    if let Some(results) = &options.results_queue {
        registry.register(QueueSpec::new(results.clone()).manual_ack().handler(log_result));
    }
    registry
}

/// Lists the bucket, publishes its objects and, when a results queue is set,
/// listens until the driver is closed.
pub async fn run(
    driver: Arc<Driver>,
    lister: &dyn ObjectLister,
    options: RelayOptions,
    connect: ConnectOptions,
) -> anyhow::Result<RelayReport> {
    let objects = lister
        .list_objects(&options.bucket)
        .await
        .with_context(|| format!("Failed to list bucket {}", options.bucket))?;
    info!(bucket = %options.bucket, objects = objects.len(), "Listed bucket");

    driver
        .initialize(registry(&options), connect)
        .await
        .context("Failed to initialize queue driver")?;

    let mut report = RelayReport {
        listed: objects.len(),
        published: 0,
    };

    let publish = async {
        let handle = driver.send_handle()?;
        for object in &objects {
            let message = ImageMessage::new(object_url(&options.storage_uri, object));
            handle.publish_json(&options.publish_queue, &message).await?;
            report.published += 1;
        }
        anyhow::Ok(())
    };

    if let Err(e) = publish.await {
        error!(published = report.published, "Publishing stopped: {:#}", e);
        if let Err(close_err) = driver.close().await {
            warn!("Failed to close driver: {}", close_err);
        }
        return Err(e.context(format!("Published {} of {} objects", report.published, report.listed)));
    }

    info!(
        queue = %options.publish_queue,
        published = report.published,
        "Finished publishing"
    );

    match &options.results_queue {
        Some(results) => {
            info!(queue = %results, "Waiting for results");
            driver.listen().await.context("Driver stopped with an error")?;
        }
        None => driver.close().await.context("Failed to close queue driver")?,
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::{DriverState, MemoryTransport};
    use crate::storage::{MockObjectLister, ObjectRef, StorageError};
    use std::time::Duration;

    fn options(results: Option<&str>) -> RelayOptions {
        RelayOptions {
            bucket: "images".into(),
            publish_queue: "work".into(),
            results_queue: results.map(str::to_string),
            storage_uri: "http://s3.local:4569".into(),
        }
    }

    fn lister_with(keys: &[&str]) -> MockObjectLister {
        let objects: Vec<ObjectRef> = keys.iter().map(|k| ObjectRef::new("images", *k)).collect();
        let mut lister = MockObjectLister::new();
        lister
            .expect_list_objects()
            .withf(|bucket| bucket.to_string() == "images")
            .times(1)
            .returning(move |_| Ok(objects.clone()));
        lister
    }

    fn connect() -> ConnectOptions {
        ConnectOptions::new().host("memory").port(5672)
    }

    #[tokio::test]
    async fn publishes_one_message_per_object_then_closes() {
        let broker = MemoryTransport::new();
        let driver = Arc::new(Driver::builder().transport(broker.clone()).build());
        let lister = lister_with(&["a.png", "dir/b.png"]);

        let report = run(driver.clone(), &lister, options(None), connect()).await.unwrap();

        assert_eq!(report, RelayReport { listed: 2, published: 2 });
        assert_eq!(driver.state(), DriverState::Closed);
        let bodies: Vec<ImageMessage> = broker
            .published()
            .iter()
            .filter(|m| m.routing_key == "work")
            .map(|m| serde_json::from_slice(&m.body).unwrap())
            .collect();
        assert_eq!(
            bodies,
            vec![
                ImageMessage::new("http://s3.local:4569/images/a.png"),
                ImageMessage::new("http://s3.local:4569/images/dir/b.png"),
            ]
        );
        assert_eq!(broker.ready_count("work"), 2);
    }

    #[tokio::test]
    async fn listing_failure_never_connects() {
        let broker = MemoryTransport::new();
        let driver = Arc::new(Driver::builder().transport(broker.clone()).build());
        let mut lister = MockObjectLister::new();
        lister
            .expect_list_objects()
            .returning(|bucket| Err(StorageError::BucketNotFound(bucket.to_string())));

        assert!(run(driver.clone(), &lister, options(None), connect()).await.is_err());
        assert_eq!(broker.connections_made(), 0);
        assert_eq!(driver.state(), DriverState::Uninitialized);
    }

    #[tokio::test]
    async fn acks_results_until_closed() {
        let broker = MemoryTransport::new();
        let driver = Arc::new(Driver::builder().transport(broker.clone()).build());
        let lister = lister_with(&["a.png"]);

        let task = {
            let driver = driver.clone();
            tokio::spawn(async move { run(driver, &lister, options(Some("results")), connect()).await })
        };

        let mut waited = 0;
        while driver.state() != DriverState::Listening && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(driver.state(), DriverState::Listening);

        broker.publish("results", r#"{"imageUrl":"http://s3.local:4569/images/a.png","labels":[]}"#);
        let mut waited = 0;
        while broker.acked("results").is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(broker.acked("results").len(), 1);

        driver.close().await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.published, 1);
    }
}
