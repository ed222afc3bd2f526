//! # headerbus
//!
//! Publish and subscribe to tagged events over a headers-routed message broker.
//!
//! Events carry four routing headers (firehose flag, product, component and
//! event type) and a JSON payload. They are published to a single headers
//! exchange, and queues receive them according to the header sets they are
//! bound with.
//!
//! ```rust,no_run
//! use headerbus::{field_table, EventBus, EventEnvelope, InMemoryBroker, ReceivedEvent, RoutingHeaders, SubscribeOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> headerbus::Result<()> {
//!     let bus = EventBus::builder()
//!         .broker(Arc::new(InMemoryBroker::new()))
//!         .build()?;
//!
//!     let queue = bus
//!         .anonymous_queue(vec![field_table([("headerbus_product", "p1")])])
//!         .await?;
//!     let _subscription = bus
//!         .subscribe(&queue, SubscribeOptions::default(), |event: ReceivedEvent| async move {
//!             println!("{}: {}", event.headers.event_type.unwrap_or_default(), event.payload);
//!         })
//!         .await?;
//!
//!     bus.publish(&EventEnvelope::new(
//!         RoutingHeaders::new(true, "p1", "c1", "created"),
//!         json!({"id": 1}),
//!     ))
//!     .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Key Features
//!
//! - **All-or-nothing routing headers**: an event carries all four headers or
//!   none; anything in between is rejected before the broker is contacted
//! - **Idempotent connection lifecycle** with failure and loss handlers
//! - **Unroutable notifications** for mandatory messages no queue accepted
//! - **Named queue provisioning** that recreates a queue and its bindings,
//!   gated behind `HEADERBUS_INITIALIZE_NAMED_QUEUE=true`
//! - **Publish hook** for observability, falling back to `tracing`
//!
//! ## Architecture
//!
//! ```text
//! EventBus / BlockingEventBus / global
//!     ↓
//! EventPublisher   EventSubscriber   QueueProvisioner
//!     ↓                 ↓                  ↓
//! ExchangeRouter ── ConnectionManager ─────┘
//!     ↓
//! broker_client (Broker / Connection)
//! ```

pub mod blocking;
pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod exchange;
pub mod global;
pub mod hook;
pub mod logging;
pub mod provisioner;
pub mod publisher;
pub mod subscriber;

// Main exports
pub use blocking::BlockingEventBus;
pub use bus::{EventBus, EventBusBuilder};
pub use config::{
    AckMode, BusEnvironment, ConnectionConfig, ExchangeConfig, MessageOptions, QueueOptions,
    SubscribeOptions,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use envelope::{EventEnvelope, EventHeaders, ReceivedEvent, Routable, RoutingHeaders};
pub use error::{
    BusError, ConfigurationError, ConnectionError, ProvisioningError, Result, UnroutableMessage,
};
pub use exchange::{ExchangeHandle, ExchangeRouter};
pub use hook::{reset_publish_hook, set_publish_hook, Severity};
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use provisioner::{ProvisionStage, ProvisionedQueue, QueueProvisioner};
pub use publisher::EventPublisher;
pub use subscriber::{EventHandler, EventSubscriber, QueueHandle, Subscription};

// Re-export the broker seam
pub use broker_client::{field_table, Broker, FieldTable, HeaderValue, InMemoryBroker};
#[cfg(feature = "amqp")]
pub use broker_client::AmqpBroker;
