use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bucket_relay::rabbitmq::{
    BrokerSettings, ChannelTarget, ConnectOptions, DeliveryEvent, Driver, DriverError, DriverState,
    MemoryTransport, QueueOptions, QueueRegistry, QueueSpec, QueueStatus, SendHandle,
    UnsettledPolicy,
};

fn connect() -> ConnectOptions {
    ConnectOptions::new().host("memory").port(5672)
}

fn driver_on(broker: &MemoryTransport) -> Driver {
    Driver::builder().transport(broker.clone()).build()
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn handler_runs_once_per_delivery() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

    let sink = seen.clone();
    let registry = QueueRegistry::new().with(QueueSpec::new("work").handler(
        move |delivery: DeliveryEvent, _: SendHandle| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(delivery.body.clone());
                anyhow::Ok(())
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    assert_eq!(driver.state(), DriverState::Ready);

    let body = br#"{"imageUrl":"http://host/bucket/key1"}"#;
    broker.publish("work", body.to_vec());

    assert!(wait_until(|| seen.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![body.to_vec()]);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn publish_only_queue_has_no_consumer() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);

    driver
        .initialize(QueueRegistry::new().with(QueueSpec::new("work")), connect())
        .await
        .unwrap();

    assert!(broker.queue_exists("work"));
    assert_eq!(broker.consumer_count("work"), 0);
    assert!(matches!(driver.queue_status("work"), Some(QueueStatus::Declared { .. })));

    broker.publish("work", "external");
    assert_eq!(broker.ready_count("work"), 1);

    driver.send_handle().unwrap().publish_to_queue("work", "ours").await.unwrap();
    assert_eq!(broker.ready_count("work"), 2);

    driver.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handlers_never_exceed_concurrency() {
    let broker = MemoryTransport::new();
    let driver = Driver::builder().transport(broker.clone()).concurrency(3).build();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (r, p, d) = (running.clone(), peak.clone(), done.clone());
    let registry = QueueRegistry::new().with(QueueSpec::new("work").handler(
        move |_: DeliveryEvent, _: SendHandle| {
            let (running, peak, done) = (r.clone(), p.clone(), d.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    for i in 0..20 {
        broker.publish("work", format!("job-{}", i));
    }

    assert!(wait_until(|| done.load(Ordering::SeqCst) == 20).await);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn redeclaring_with_same_options_is_idempotent() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    driver
        .initialize(QueueRegistry::new().with(QueueSpec::new("work")), connect())
        .await
        .unwrap();

    let handle = driver.send_handle().unwrap();
    handle.publish_to_queue("work", "kept").await.unwrap();
    let declared = handle.declare_queue("work", QueueOptions::default()).await.unwrap();

    assert_eq!(declared.message_count, 1);
    assert_eq!(broker.declare_count("work"), 2);
    assert_eq!(broker.ready_count("work"), 1);

    let conflict = handle
        .declare_queue(
            "work",
            QueueOptions {
                durable: true,
                ..QueueOptions::default()
            },
        )
        .await;
    assert!(conflict.is_err());

    driver.close().await.unwrap();
}

#[tokio::test]
async fn close_twice_is_a_no_op() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    driver
        .initialize(QueueRegistry::new().with(QueueSpec::new("work")), connect())
        .await
        .unwrap();

    driver.close().await.unwrap();
    driver.close().await.unwrap();

    assert_eq!(driver.state(), DriverState::Closed);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(driver.send_handle(), Err(DriverError::Closed)));
}

#[tokio::test]
async fn close_before_initialize_is_allowed() {
    let driver = driver_on(&MemoryTransport::new());
    driver.close().await.unwrap();
    assert_eq!(driver.state(), DriverState::Closed);
    assert!(matches!(
        driver.initialize(QueueRegistry::new(), connect()).await,
        Err(DriverError::Closed)
    ));
}

#[tokio::test]
async fn send_handle_requires_ready() {
    let driver = driver_on(&MemoryTransport::new());
    let err = driver.send_handle().unwrap_err();
    assert!(matches!(err, DriverError::NotReady(_)));
    assert!(err.is_state_error());
}

#[tokio::test]
async fn missing_host_fails_before_connecting() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);

    let err = driver
        .initialize(QueueRegistry::new(), ConnectOptions::new().port(5672))
        .await
        .unwrap_err();

    assert!(matches!(err, DriverError::Configuration(_)));
    assert_eq!(broker.connections_made(), 0);
    assert_eq!(driver.state(), DriverState::Uninitialized);
}

#[tokio::test]
async fn fallback_settings_fill_missing_arguments() {
    let broker = MemoryTransport::new();
    let driver = Driver::builder()
        .transport(broker.clone())
        .fallback(BrokerSettings {
            host: Some("memory".into()),
            port: Some(5672),
            username: None,
            password: None,
        })
        .build();

    driver.initialize(QueueRegistry::new(), ConnectOptions::new()).await.unwrap();
    assert_eq!(broker.connections_made(), 1);
    driver.close().await.unwrap();
}

#[tokio::test]
async fn failing_handler_does_not_stop_dispatch() {
    let broker = MemoryTransport::new();
    let driver = Driver::builder().transport(broker.clone()).concurrency(1).build();
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let registry = QueueRegistry::new().with(QueueSpec::new("results").handler(
        move |delivery: DeliveryEvent, _: SendHandle| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if delivery.body_str() == "bad" {
                    anyhow::bail!("cannot handle {}", delivery.body_str());
                }
                anyhow::Ok(())
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    broker.publish("results", "bad");
    broker.publish("results", "good");

    assert!(wait_until(|| handled.load(Ordering::SeqCst) == 2).await);
    assert_eq!(driver.state(), DriverState::Ready);
    driver.close().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_does_not_kill_worker() {
    let broker = MemoryTransport::new();
    let driver = Driver::builder().transport(broker.clone()).concurrency(1).build();
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = handled.clone();
    let registry = QueueRegistry::new().with(QueueSpec::new("results").handler(
        move |delivery: DeliveryEvent, _: SendHandle| {
            let counter = counter.clone();
            async move {
                if delivery.body_str() == "boom" {
                    panic!("handler panicked");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    broker.publish("results", "boom");
    broker.publish("results", "fine");

    assert!(wait_until(|| handled.load(Ordering::SeqCst) == 1).await);
    driver.close().await.unwrap();
}

#[tokio::test]
async fn unsettled_manual_delivery_is_requeued_once_then_rejected() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let registry = QueueRegistry::new().with(QueueSpec::new("work").manual_ack().handler(
        move |_: DeliveryEvent, _: SendHandle| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("always fails"))
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    broker.publish("work", "poison");

    assert!(wait_until(|| broker.rejected("work").len() == 1).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.nacked("work"), vec![(b"poison".to_vec(), true)]);
    assert_eq!(broker.rejected("work"), vec![(b"poison".to_vec(), false)]);
    assert_eq!(broker.unacked_count(), 0);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn leave_policy_keeps_failed_delivery_unacked() {
    let broker = MemoryTransport::new();
    let driver = Driver::builder()
        .transport(broker.clone())
        .unsettled_policy(UnsettledPolicy::Leave)
        .build();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let registry = QueueRegistry::new().with(QueueSpec::new("work").manual_ack().handler(
        move |_: DeliveryEvent, _: SendHandle| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("always fails"))
            }
        },
    ));

    driver.initialize(registry, connect()).await.unwrap();
    broker.publish("work", "stuck");

    assert!(wait_until(|| attempts.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.unacked_count(), 1);
    assert!(broker.nacked("work").is_empty());

    // Closing the consume channel hands the message back to the queue.
    driver.close().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count("work"), 1);
}

#[tokio::test]
async fn manual_ack_handler_acks_and_publishes_downstream() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);

    let registry = QueueRegistry::new()
        .with(QueueSpec::new("results"))
        .with(QueueSpec::new("work").manual_ack().handler(
            |delivery: DeliveryEvent, publisher: SendHandle| async move {
                publisher.publish_to_queue("results", delivery.body.clone()).await?;
                delivery.ack().await?;
                anyhow::Ok(())
            },
        ));

    driver.initialize(registry, connect()).await.unwrap();
    broker.publish("work", "chained");

    assert!(wait_until(|| broker.acked("work").len() == 1).await);
    assert_eq!(broker.ready_count("results"), 1);
    assert!(broker.rejected("work").is_empty());

    driver.close().await.unwrap();
}

#[tokio::test]
async fn failed_consume_channel_only_affects_its_queues() {
    let broker = MemoryTransport::new();
    // Send channel first, then the shared consume channel, then the dedicated one.
    broker.fail_channel_open(3);
    let driver = driver_on(&broker);

    let registry = QueueRegistry::new()
        .with(QueueSpec::new("shared").handler(|_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) }))
        .with(
            QueueSpec::new("isolated")
                .channel(ChannelTarget::Dedicated)
                .handler(|_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) }),
        );

    driver.initialize(registry, connect()).await.unwrap();

    assert_eq!(driver.state(), DriverState::Ready);
    assert!(matches!(driver.queue_status("shared"), Some(QueueStatus::Consuming { .. })));
    assert!(matches!(driver.queue_status("isolated"), Some(QueueStatus::Failed(_))));
    assert!(!broker.queue_exists("isolated"));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn refused_connection_closes_the_driver() {
    let broker = MemoryTransport::new();
    broker.refuse_connections();
    let driver = driver_on(&broker);

    let err = driver
        .initialize(QueueRegistry::new().with(QueueSpec::new("work")), connect())
        .await
        .unwrap_err();

    assert!(matches!(err, DriverError::Connection(_)));
    assert_eq!(driver.state(), DriverState::Closed);
    assert!(matches!(driver.send_handle(), Err(DriverError::Closed)));
}

#[tokio::test]
async fn slow_handshake_times_out() {
    let broker = MemoryTransport::new();
    broker.set_connect_delay(Duration::from_millis(500));
    let driver = Driver::builder()
        .transport(broker.clone())
        .connection_timeout(Duration::from_millis(50))
        .build();

    let err = driver.initialize(QueueRegistry::new(), connect()).await.unwrap_err();
    assert!(matches!(err, DriverError::Connection(_) | DriverError::Timeout(_)));
    assert_eq!(driver.state(), DriverState::Closed);
}

#[tokio::test]
async fn second_initialize_is_rejected() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    driver.initialize(QueueRegistry::new(), connect()).await.unwrap();

    let err = driver.initialize(QueueRegistry::new(), connect()).await.unwrap_err();
    assert!(matches!(err, DriverError::AlreadyInitialized));
    assert_eq!(broker.connections_made(), 1);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn listen_returns_when_closed_elsewhere() {
    let broker = MemoryTransport::new();
    let driver = Arc::new(driver_on(&broker));
    driver.initialize(QueueRegistry::new(), connect()).await.unwrap();

    let listener = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.listen().await })
    };

    assert!(wait_until(|| driver.state() == DriverState::Listening).await);
    assert!(matches!(driver.listen().await, Err(DriverError::AlreadyListening)));
    assert!(driver.send_handle().is_ok());

    driver.close().await.unwrap();
    listener.await.unwrap().unwrap();
    assert_eq!(driver.state(), DriverState::Closed);
}

#[tokio::test]
async fn listen_returns_when_connection_drops() {
    let broker = MemoryTransport::new();
    let driver = Arc::new(driver_on(&broker));
    driver
        .initialize(
            QueueRegistry::new()
                .with(QueueSpec::new("work").handler(|_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) })),
            connect(),
        )
        .await
        .unwrap();

    let listener = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.listen().await })
    };
    assert!(wait_until(|| driver.state() == DriverState::Listening).await);

    broker.fail_connections();

    let result = tokio::time::timeout(Duration::from_secs(2), listener).await.unwrap().unwrap();
    assert!(driver.connection_lost());
    assert_eq!(driver.state(), DriverState::Closed);
    // The broker already dropped the connection, so closing it again may fail.
    let _ = result;
}

#[tokio::test]
async fn connection_loss_without_listener_closes_driver() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    driver
        .initialize(
            QueueRegistry::new()
                .with(QueueSpec::new("work").handler(|_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) })),
            connect(),
        )
        .await
        .unwrap();
    let handle = driver.send_handle().unwrap();

    broker.fail_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(driver.connection_lost());
    assert_eq!(driver.state(), DriverState::Closed);
    assert!(matches!(driver.send_handle(), Err(DriverError::Closed)));
    assert!(matches!(
        handle.publish_to_queue("work", b"late".to_vec()).await,
        Err(DriverError::Closed)
    ));
    assert!(matches!(driver.listen().await, Err(DriverError::Closed)));

    driver.close().await.unwrap();
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn failed_channel_close_does_not_stop_teardown() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    let noop = |_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) };
    driver
        .initialize(
            QueueRegistry::new()
                .with(QueueSpec::new("work").handler(noop))
                .with(QueueSpec::new("audit").channel(ChannelTarget::Dedicated).handler(noop)),
            connect(),
        )
        .await
        .unwrap();
    assert_eq!(broker.open_channels(), 3);

    // Channel 1 is the send channel; 2 and 3 consume.
    broker.fail_channel_close(2);

    driver.close().await.unwrap();
    assert_eq!(driver.state(), DriverState::Closed);
    assert_eq!(broker.consumer_count("work"), 0);
    assert_eq!(broker.consumer_count("audit"), 0);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn registration_is_closed_after_initialize() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    assert!(driver.register(QueueSpec::new("early")));

    driver.initialize(QueueRegistry::new(), connect()).await.unwrap();
    assert!(broker.queue_exists("early"));

    assert!(!driver.register(QueueSpec::new("late")));
    assert!(driver.registry().get("late").is_none());
    assert!(!broker.queue_exists("late"));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn explicit_consumer_tag_reaches_the_broker() {
    let broker = MemoryTransport::new();
    let driver = driver_on(&broker);
    let registry = QueueRegistry::new().with(
        QueueSpec::new("work")
            .consumer_tag("relay-worker")
            .handler(|_: DeliveryEvent, _: SendHandle| async { anyhow::Ok(()) }),
    );

    driver.initialize(registry, connect()).await.unwrap();
    assert_eq!(broker.consumer_tags("work"), vec!["relay-worker".to_string()]);
    driver.close().await.unwrap();
    assert_eq!(broker.consumer_count("work"), 0);
}
