//! Connection holder lifecycle: lazy connect, limits, outages and close

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::application::{
    BrokerOptions, ConnectionHolder, HolderOptions, PooledConnectionHolder, PooledHolderOptions,
    SharedConnectionHolder, SharedHolderOptions,
};
use conveyor_core::domain::Message;
use conveyor_core::port::middleware::mocks::RecordingMiddleware;
use conveyor_core::port::TransportError;
use conveyor_core::{Broker, BrokerError};
use conveyor_infra_memory::{FaultOp, MemoryTransport};

fn broker(transport: &MemoryTransport) -> Broker {
    Broker::builder()
        .transport(Arc::new(transport.clone()), HolderOptions::default())
        .build()
        .unwrap()
}

fn message() -> Message {
    Message::new("m-1", "emails", "send_email", 0)
}

#[tokio::test]
async fn test_nothing_connects_before_first_use() {
    let transport = MemoryTransport::default();
    let broker = broker(&transport);

    assert_eq!(transport.connect_count(), 0);
    assert!(!broker.holder_status().any_connected());

    broker.enqueue(message(), None).await.unwrap();
    assert!(transport.connect_count() > 0);
    assert!(broker.holder_status().any_connected());
}

#[tokio::test]
async fn test_close_twice_leaves_nothing_connected() {
    let transport = MemoryTransport::default();
    let broker = broker(&transport);
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    broker.on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    broker.enqueue(message(), None).await.unwrap();
    let _consumer = broker
        .consume("emails", 1, Duration::from_millis(10))
        .await
        .unwrap();

    broker.close().await.unwrap();
    broker.close().await.unwrap();

    assert_eq!(transport.open_connections(), 0);
    assert!(!broker.holder_status().any_connected());
    assert_eq!(closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_closed_broker_reconnects_on_next_use() {
    let transport = MemoryTransport::default();
    let broker = broker(&transport);

    broker.enqueue(message(), None).await.unwrap();
    let connects = transport.connect_count();
    broker.close().await.unwrap();

    broker.enqueue(message(), None).await.unwrap();
    assert!(transport.connect_count() > connects);
    assert_eq!(transport.queue_len("emails"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_shared_channel_pool_is_bounded() {
    let transport = MemoryTransport::default();
    let holder = SharedConnectionHolder::new(
        Arc::new(transport.clone()),
        SharedHolderOptions {
            producer_channel_pool_size: Some(1),
            ..Default::default()
        },
    );

    let first = holder.acquire_producer(false, None).await.unwrap();

    let err = holder.acquire_producer(false, None).await.unwrap_err();
    assert!(matches!(err, BrokerError::LimitExceeded(_)));
    let err = holder
        .acquire_producer(true, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::LimitExceeded(_)));

    let status = holder.status();
    assert_eq!(
        (status.consumer_connections, status.producer_connections),
        (0, 1)
    );

    let channel_id = first.channel_id();
    first.release();
    let again = holder.acquire_producer(false, None).await.unwrap();
    assert_eq!(again.channel_id(), channel_id);
}

#[tokio::test]
async fn test_pooled_consumer_pool_is_bounded() {
    let transport = MemoryTransport::default();
    let holder = PooledConnectionHolder::new(
        Arc::new(transport.clone()),
        PooledHolderOptions {
            consumer_pool_size: Some(1),
            ..Default::default()
        },
    );

    let lease = holder.acquire_consumer_channel(false, None).await.unwrap();
    assert!(!lease.is_thread_safe());

    let err = holder
        .acquire_consumer_channel(false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::LimitExceeded(_)));

    lease.release();
    holder.acquire_consumer_channel(false, None).await.unwrap();
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_is_retried() {
    let transport = MemoryTransport::default();
    let broker = broker(&transport);
    transport.fail_next(
        FaultOp::Connect,
        TransportError::ConnectionLost("connection reset by peer".to_string()),
    );

    broker.declare_queue("emails", true).await.unwrap();
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.queue_len("emails"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_survives_broker_outage() {
    let transport = MemoryTransport::default();
    let broker = broker(&transport);
    broker.enqueue(message(), None).await.unwrap();
    let connects = transport.connect_count();

    transport.set_online(false);
    assert_eq!(transport.open_connections(), 0);

    let (result, ()) = tokio::join!(broker.enqueue(message(), None), async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        transport.set_online(true);
    });

    result.unwrap();
    assert!(transport.connect_count() > connects);
    assert_eq!(transport.queue_len("emails"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_bounded_connect_retries_give_up() {
    let transport = MemoryTransport::default();
    let holder = HolderOptions {
        pooled: PooledHolderOptions {
            connect_max_retries: Some(2),
            ..Default::default()
        },
        ..Default::default()
    };
    let options = BrokerOptions {
        max_declare_attempts: Some(0),
        ..Default::default()
    };
    let broker = Broker::builder()
        .transport(Arc::new(transport.clone()), holder)
        .options(options)
        .build()
        .unwrap();

    transport.set_online(false);
    let err = broker.declare_queue("emails", true).await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection(_)));
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn test_concurrent_declares_notify_once() {
    let transport = MemoryTransport::default();
    let recorder = Arc::new(RecordingMiddleware::new());
    let broker = Broker::builder()
        .transport(Arc::new(transport.clone()), HolderOptions::default())
        .middleware(recorder.clone())
        .build()
        .unwrap();

    let declares = (0..8).map(|_| broker.declare_queue("emails", true));
    for result in futures::future::join_all(declares).await {
        result.unwrap();
    }

    assert_eq!(recorder.count("before_declare_queue:emails"), 1);
    assert_eq!(recorder.count("after_declare_queue:emails"), 1);
    assert_eq!(recorder.count("after_declare_delay_queue:emails.DQ"), 1);
    assert_eq!(transport.declare_count("emails"), 1);
}
