//! Integration tests for the bus connection lifecycle

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use headerbus::{
    BusEnvironment, BusError, ConnectionConfig, ConnectionError, ConnectionState, EventBus,
    EventEnvelope, InMemoryBroker,
};
use parking_lot::Mutex;
use serde_json::json;

fn bus(broker: &InMemoryBroker) -> EventBus {
    EventBus::builder()
        .broker(Arc::new(broker.clone()))
        .connection_config(ConnectionConfig::new().with_timeout(Duration::from_millis(200)))
        .environment(BusEnvironment::default())
        .build()
        .unwrap()
}

async fn wait_for_state(bus: &EventBus, state: ConnectionState) {
    let mut states = bus.connections().subscribe_state();
    tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .expect("state channel closed");
}

#[tokio::test]
async fn test_repeated_connects_open_one_connection() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    for _ in 0..5 {
        bus.connect().await.unwrap();
    }
    assert!(bus.connected());
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn test_state_transitions_are_observable() {
    let broker = InMemoryBroker::new();
    broker.set_connect_latency(Duration::from_millis(100));
    let bus = bus(&broker);
    let mut states = bus.connections().subscribe_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    let connecting = bus.clone();
    let task = tokio::spawn(async move { connecting.connect().await.map(|_| ()) });

    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);
    task.await.unwrap().unwrap();
    assert_eq!(bus.state(), ConnectionState::Connected);

    bus.close().await.unwrap();
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_refused_connection_is_returned_and_reported() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections("maintenance");
    let failures: Arc<Mutex<Vec<BusError>>> = Arc::default();
    let sink = Arc::clone(&failures);
    let bus = EventBus::builder()
        .broker(Arc::new(broker.clone()))
        .environment(BusEnvironment::default())
        .on_connection_failed(move |error| sink.lock().push(error.clone()))
        .build()
        .unwrap();

    let error = bus.connect().await.unwrap_err();
    assert_eq!(
        error,
        BusError::Connection(ConnectionError::Refused {
            host: "localhost".to_string(),
            reason: "maintenance".to_string(),
        })
    );
    assert_eq!(*failures.lock(), vec![error]);

    broker.accept_connections();
    bus.connect().await.unwrap();
    assert_eq!(failures.lock().len(), 1);
}

#[tokio::test]
async fn test_connect_timeout() {
    let broker = InMemoryBroker::new();
    broker.set_connect_latency(Duration::from_secs(2));
    let bus = bus(&broker);

    let error = bus.connect().await.unwrap_err();
    assert!(matches!(
        error,
        BusError::Connection(ConnectionError::Timeout { .. })
    ));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_close_requires_connection() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);

    let error = bus.close().await.unwrap_err();
    assert_eq!(
        error,
        BusError::Connection(ConnectionError::NotConnected {
            state: ConnectionState::Disconnected,
        })
    );
}

#[tokio::test]
async fn test_loss_fires_handler_once_and_bus_recovers() {
    let broker = InMemoryBroker::new();
    let losses = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&losses);
    let bus = EventBus::builder()
        .broker(Arc::new(broker.clone()))
        .environment(BusEnvironment::default())
        .on_connection_lost(move |error| {
            assert_eq!(*error, ConnectionError::Lost("network down".to_string()));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let before = bus.connect().await.unwrap();
    broker.sever_all("network down");
    wait_for_state(&bus, ConnectionState::Disconnected).await;
    assert!(!before.is_valid());

    bus.publish(&EventEnvelope::untagged(json!({"after": "loss"})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(losses.load(Ordering::SeqCst), 1);
    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(bus.connections().generation(), 2);
}

#[tokio::test]
async fn test_explicit_close_is_not_a_loss() {
    let broker = InMemoryBroker::new();
    let losses = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&losses);
    let bus = bus(&broker);
    bus.on_connection_lost(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    bus.connect().await.unwrap();
    bus.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(losses.load(Ordering::SeqCst), 0);
    assert_eq!(broker.open_connections(), 0);
}
