//! Integration tests for publishing and subscribing through an EventBus

use std::sync::Arc;
use std::time::Duration;

use broker_client::OperationKind;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use headerbus::{
    field_table, reset_publish_hook, set_publish_hook, BusEnvironment, BusError,
    ConfigurationError, EventBus, EventEnvelope, EventHeaders, FieldTable, HeaderValue,
    InMemoryBroker, MessageOptions, ReceivedEvent, RoutingHeaders, Severity, SubscribeOptions,
    UnroutableMessage,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

// ============================================================================
// Test Helpers
// ============================================================================

fn bus(broker: &InMemoryBroker) -> EventBus {
    EventBus::builder()
        .broker(Arc::new(broker.clone()))
        .environment(BusEnvironment::default().with_named_queue_initialization(true))
        .build()
        .unwrap()
}

fn created_event() -> EventEnvelope {
    EventEnvelope::new(
        EventHeaders::new()
            .with_firehose(true)
            .with_product("p1")
            .with_component("c1")
            .with_event_type("created"),
        json!({"id": 1}),
    )
}

/// Subscribe a handler that forwards every event into a channel.
async fn collect(
    bus: &EventBus,
    bindings: Vec<FieldTable>,
    options: SubscribeOptions,
) -> (headerbus::Subscription, mpsc::UnboundedReceiver<ReceivedEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = bus.anonymous_queue(bindings).await.unwrap();
    let subscription = bus
        .subscribe(&queue, options, move |event: ReceivedEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        })
        .await
        .unwrap();
    (subscription, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ReceivedEvent>) -> ReceivedEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription ended")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<ReceivedEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(result.is_err(), "unexpected event delivered");
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_tagged_event_reaches_bound_subscriber() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) = collect(
        &bus,
        vec![field_table([("headerbus_product", "p1")])],
        SubscribeOptions::default(),
    )
    .await;

    assert_ok!(bus.publish(&created_event()).await);

    let event = next_event(&mut events).await;
    assert_eq!(event.payload, json!({"id": 1}));
    assert_eq!(
        event.headers.routing().unwrap(),
        Some(RoutingHeaders::new(true, "p1", "c1", "created"))
    );
    assert!(event.extra_headers.is_empty());
    assert!(!event.redelivered);
}

#[tokio::test]
async fn test_non_matching_binding_receives_nothing() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) = collect(
        &bus,
        vec![field_table([("headerbus_product", "p2")])],
        SubscribeOptions::default(),
    )
    .await;

    bus.publish(&created_event()).await.unwrap();
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_firehose_binding_receives_untagged_events() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) =
        collect(&bus, vec![FieldTable::new()], SubscribeOptions::default()).await;

    bus.publish(&EventEnvelope::untagged(json!({"ping": true})))
        .await
        .unwrap();

    let event = next_event(&mut events).await;
    assert!(event.headers.is_empty());
    assert_eq!(event.payload, json!({"ping": true}));
}

#[tokio::test]
async fn test_round_trip_preserves_body_and_properties() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) = collect(
        &bus,
        vec![field_table([("region", "us")])],
        SubscribeOptions::default(),
    )
    .await;

    let timestamp = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    let options = MessageOptions::new()
        .with_routing_key("orders.created")
        .persistent()
        .with_content_type("application/json")
        .with_content_encoding("identity")
        .with_priority(5)
        .with_message_id("msg-1")
        .with_correlation_id("corr-1")
        .with_reply_to("replies")
        .with_kind("order_created")
        .with_user_id("guest")
        .with_app_id("shop")
        .with_timestamp(timestamp)
        .with_expiration(Duration::from_secs(60))
        .with_header("region", "us")
        .with_header("attempt", 2i64);
    let payload = json!({"id": 1, "items": ["a", "b"], "total": 12.5});
    let envelope = EventEnvelope::new(
        RoutingHeaders::new(false, "shop", "checkout", "created"),
        payload.clone(),
    )
    .with_options(options.clone());

    bus.publish(&envelope).await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.body, Bytes::from(serde_json::to_vec(&payload).unwrap()));
    assert_eq!(event.payload, payload);
    assert_eq!(event.options, options);
    assert_eq!(event.extra_headers.get("attempt"), Some(&HeaderValue::Int(2)));
}

#[tokio::test]
async fn test_mandatory_unroutable_is_reported_once() {
    let broker = InMemoryBroker::new();
    let returned: Arc<Mutex<Vec<UnroutableMessage>>> = Arc::default();
    let sink = Arc::clone(&returned);
    let bus = EventBus::builder()
        .broker(Arc::new(broker.clone()))
        .environment(BusEnvironment::default())
        .on_unroutable(move |message| sink.lock().push(message.clone()))
        .build()
        .unwrap();

    let envelope = created_event().with_options(MessageOptions::new().mandatory());
    bus.publish(&envelope).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while returned.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let messages = returned.lock();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].reply_code, 312);
    assert_eq!(messages[0].payload().unwrap(), json!({"id": 1}));
    assert_eq!(
        messages[0].headers.get("headerbus_event_type"),
        Some(&HeaderValue::from("created"))
    );
}

#[tokio::test]
async fn test_partial_headers_are_rejected_without_broker_calls() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.connect().await.unwrap();
    broker.clear_operations();

    let envelope = EventEnvelope::new(
        EventHeaders::new()
            .with_firehose(true)
            .with_product("p1")
            .with_component("c1"),
        json!({"id": 1}),
    );
    let error = bus.publish(&envelope).await.unwrap_err();

    assert_eq!(
        error,
        BusError::Configuration(ConfigurationError::IncompleteRoutingHeaders {
            missing: vec!["headerbus_event_type"],
        })
    );
    assert!(broker.operations().is_empty());
}

#[tokio::test]
async fn test_routing_header_cannot_ride_in_extra_headers() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) = collect(
        &bus,
        vec![field_table([("headerbus_product", "p1")])],
        SubscribeOptions::default(),
    )
    .await;
    broker.clear_operations();

    let mut envelope = EventEnvelope::untagged(json!({"id": 1}));
    envelope
        .options
        .headers
        .insert("headerbus_product".to_string(), HeaderValue::from("p1"));
    let error = bus.publish(&envelope).await.unwrap_err();

    assert_eq!(
        error,
        BusError::Configuration(ConfigurationError::ReservedHeader(
            "headerbus_product".to_string()
        ))
    );
    assert!(broker.operations().is_empty());

    // The builder drops the reserved name, so the event goes out untagged
    let envelope = EventEnvelope::untagged(json!({"id": 2}))
        .with_options(MessageOptions::new().with_header("headerbus_product", "p1"));
    assert_ok!(bus.publish(&envelope).await);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_publish_hook_receives_report() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let reports: Arc<Mutex<Vec<(Severity, Value, Value, String)>>> = Arc::default();
    let sink = Arc::clone(&reports);
    set_publish_hook(move |severity, metadata, payload, message| {
        if metadata["headers"]["headerbus_event_type"] == "hook-integration" {
            sink.lock()
                .push((severity, metadata.clone(), payload.clone(), message.to_string()));
        }
    });

    let envelope = EventEnvelope::new(
        RoutingHeaders::new(true, "p1", "c1", "hook-integration"),
        json!({"id": 3}),
    );
    let published = bus.publish(&envelope).await;
    reset_publish_hook();
    published.unwrap();

    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    let (severity, metadata, payload, message) = &reports[0];
    assert_eq!(*severity, Severity::Info);
    assert_eq!(metadata["exchange"], "headerbus.headers");
    assert_eq!(*payload, json!({"id": 3}));
    assert_eq!(message, "Published event");
}

#[tokio::test]
async fn test_manual_ack_with_prefetch() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (_subscription, mut events) = collect(
        &bus,
        vec![field_table([("headerbus_product", "p1")])],
        SubscribeOptions::new().manual_ack().with_prefetch(1),
    )
    .await;

    bus.publish(&created_event()).await.unwrap();
    bus.publish(&created_event()).await.unwrap();

    let first = next_event(&mut events).await;
    assert!(first.requires_ack());
    // Prefetch of one holds the second event back until the first is acked
    assert_no_event(&mut events).await;

    first.ack().await.unwrap();
    let second = next_event(&mut events).await;
    second.ack().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_subscription_stops_dispatch() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    let (subscription, mut events) = collect(
        &bus,
        vec![field_table([("headerbus_product", "p1")])],
        SubscribeOptions::default(),
    )
    .await;
    let queue = subscription.queue().to_string();

    subscription.cancel().await.unwrap();
    assert_eq!(bus.subscriber().subscription_count(), 0);

    bus.publish(&created_event()).await.unwrap();
    assert_no_event(&mut events).await;
    assert_eq!(broker.message_count(&queue), 1);
}

#[tokio::test]
async fn test_persistent_events_survive_broker_restart() {
    let broker = InMemoryBroker::new();
    let bus = bus(&broker);
    bus.initialize_named_queue("audit", vec![field_table([("headerbus_product", "p1")])])
        .await
        .unwrap();

    bus.publish(&created_event().with_options(MessageOptions::new().persistent()))
        .await
        .unwrap();
    bus.publish(&created_event()).await.unwrap();
    assert_eq!(broker.message_count("audit"), 2);

    broker.restart();
    assert_eq!(broker.message_count("audit"), 1);

    // The bus reconnects on next use and keeps routing to the durable queue
    bus.publish(&created_event()).await.unwrap();
    assert_eq!(broker.message_count("audit"), 2);
    let publishes = broker
        .operations()
        .iter()
        .filter(|op| op.kind == OperationKind::Publish)
        .count();
    assert_eq!(publishes, 3);
}
