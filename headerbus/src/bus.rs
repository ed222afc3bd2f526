//! EventBus - main entry point
//!
//! Ties the connection, exchange, publisher, subscriber and provisioner of one
//! bus together behind a single cheaply cloneable handle.

use std::sync::Arc;

use broker_client::{Broker, FieldTable};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{BusEnvironment, ConnectionConfig, ExchangeConfig, SubscribeOptions};
use crate::connection::{ConnectionFailedHandler, ConnectionLostHandler, ConnectionManager, ConnectionState};
use crate::envelope::Routable;
use crate::error::{BusError, ConfigurationError, ConnectionError, UnroutableMessage};
use crate::exchange::{ExchangeHandle, ExchangeRouter, UnroutableHandler};
use crate::hook::Severity;
use crate::provisioner::{ProvisionedQueue, QueueProvisioner};
use crate::publisher::{check_publishable, EventPublisher};
use crate::subscriber::{EventHandler, EventSubscriber, QueueHandle, Subscription};

/// An event bus over a headers-routed broker.
///
/// # Example
///
/// ```rust,no_run
/// use headerbus::{EventBus, EventEnvelope, EventHeaders, InMemoryBroker};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn run() -> headerbus::Result<()> {
/// let bus = EventBus::builder()
///     .broker(Arc::new(InMemoryBroker::new()))
///     .on_connection_lost(|error| eprintln!("lost: {error}"))
///     .build()?;
///
/// bus.connect().await?;
/// bus.publish(&EventEnvelope::new(
///     EventHeaders::new()
///         .with_firehose(true)
///         .with_product("p1")
///         .with_component("c1")
///         .with_event_type("created"),
///     json!({"id": 1}),
/// ))
/// .await?;
/// bus.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    connections: ConnectionManager,
    router: ExchangeRouter,
    publisher: EventPublisher,
    subscriber: EventSubscriber,
    provisioner: QueueProvisioner,
    environment: BusEnvironment,
    /// Exchange resolved on the current connection, if any
    exchange: Mutex<Option<ExchangeHandle>>,
}

impl EventBus {
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Connect and resolve the exchange. Idempotent.
    pub async fn connect(&self) -> Result<ExchangeHandle, BusError> {
        self.exchange().await
    }

    /// Whether the bus is connected. Has no side effects.
    pub fn connected(&self) -> bool {
        self.inner.connections.connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connections.state()
    }

    /// Close the connection. Fails with `NotConnected` when not connected.
    pub async fn close(&self) -> Result<(), BusError> {
        self.inner.exchange.lock().await.take();
        self.inner.connections.close().await?;
        info!("Event bus closed");
        Ok(())
    }

    /// The exchange on the live connection.
    ///
    /// Connects first when needed, and resolves again when the cached handle
    /// belongs to an earlier connection.
    pub async fn exchange(&self) -> Result<ExchangeHandle, BusError> {
        let mut cached = self.inner.exchange.lock().await;
        if let Some(handle) = cached.as_ref().filter(|handle| handle.is_valid()) {
            return Ok(handle.clone());
        }

        self.inner.connections.connect().await?;
        let handle = self
            .inner
            .router
            .resolve(&self.inner.connections)
            .await
            .map_err(|error| {
                let error = BusError::from(error);
                self.inner.connections.report_failure(&error);
                error
            })?;

        debug!(exchange = %handle.name(), generation = handle.generation(), "Cached exchange");
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Publish an event, connecting first when needed.
    ///
    /// Partial routing headers and invalid message options are rejected before
    /// the broker is contacted.
    pub async fn publish<R>(&self, event: &R) -> Result<(), BusError>
    where
        R: Routable + Sync + ?Sized,
    {
        check_publishable(event)?;
        let exchange = self.exchange().await?;
        self.inner.publisher.publish(&exchange, event).await
    }

    /// Declare a named queue with the named-queue defaults.
    pub async fn named_queue(&self, name: &str) -> Result<QueueHandle, BusError> {
        let exchange = self.exchange().await?;
        self.inner.subscriber.named_queue(&exchange, name).await
    }

    /// Declare and bind a broker-named queue with the anonymous defaults.
    pub async fn anonymous_queue(&self, bindings: Vec<FieldTable>) -> Result<QueueHandle, BusError> {
        let exchange = self.exchange().await?;
        self.inner.subscriber.anonymous_queue(&exchange, bindings).await
    }

    /// Dispatch events from `queue` to `handler`.
    pub async fn subscribe<H>(
        &self,
        queue: &QueueHandle,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription, BusError>
    where
        H: EventHandler,
    {
        let exchange = self.exchange().await?;
        self.inner
            .subscriber
            .subscribe(&exchange, queue, options, handler)
            .await
    }

    /// Delete and recreate a named queue with the given bindings.
    ///
    /// Destructive. Requires `HEADERBUS_INITIALIZE_NAMED_QUEUE=true` in the
    /// bus environment. Runs on a fresh connection, so exchange handles taken
    /// before the call go stale.
    pub async fn initialize_named_queue(
        &self,
        queue_name: &str,
        bindings: Vec<FieldTable>,
    ) -> Result<ProvisionedQueue, BusError> {
        let mut cached = self.inner.exchange.lock().await;
        let provisioned = self
            .inner
            .provisioner
            .provision_named_queue(queue_name, bindings)
            .await;
        cached.take();
        provisioned
    }

    pub fn on_connection_failed<F>(&self, handler: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.inner.connections.on_connection_failed(handler);
    }

    pub fn on_connection_lost<F>(&self, handler: F)
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.inner.connections.on_connection_lost(handler);
    }

    pub fn on_unroutable<F>(&self, handler: F)
    where
        F: Fn(&UnroutableMessage) + Send + Sync + 'static,
    {
        self.inner.router.on_unroutable(handler);
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn router(&self) -> &ExchangeRouter {
        &self.inner.router
    }

    pub fn subscriber(&self) -> &EventSubscriber {
        &self.inner.subscriber
    }

    pub fn environment(&self) -> &BusEnvironment {
        &self.inner.environment
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("connections", &self.inner.connections)
            .field("router", &self.inner.router)
            .field("environment", &self.inner.environment)
            .finish()
    }
}

// ============================================================================
// EventBusBuilder
// ============================================================================

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    broker: Option<Arc<dyn Broker>>,
    connection: ConnectionConfig,
    exchange: ExchangeConfig,
    environment: Option<BusEnvironment>,
    severity: Option<Severity>,
    connection_failed: Option<ConnectionFailedHandler>,
    connection_lost: Option<ConnectionLostHandler>,
    unroutable: Option<UnroutableHandler>,
}

impl EventBusBuilder {
    /// Broker to connect to. Required.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection = config;
        self
    }

    pub fn exchange_config(mut self, config: ExchangeConfig) -> Self {
        self.exchange = config;
        self
    }

    /// Environment settings. Default: read from the process environment.
    pub fn environment(mut self, environment: BusEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Severity reported to the publish hook.
    pub fn publish_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn on_connection_failed<F>(mut self, handler: F) -> Self
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        self.connection_failed = Some(Arc::new(handler));
        self
    }

    pub fn on_connection_lost<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        self.connection_lost = Some(Arc::new(handler));
        self
    }

    pub fn on_unroutable<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UnroutableMessage) + Send + Sync + 'static,
    {
        self.unroutable = Some(Arc::new(handler));
        self
    }

    /// Build the bus. Nothing is opened until the first connect.
    pub fn build(self) -> Result<EventBus, ConfigurationError> {
        let broker = self
            .broker
            .ok_or_else(|| ConfigurationError::Invalid("No broker configured".to_string()))?;
        self.connection.validate()?;
        self.exchange.validate()?;
        let environment = self.environment.unwrap_or_else(BusEnvironment::from_env);

        let connections = ConnectionManager::new(broker, self.connection);
        if let Some(handler) = self.connection_failed {
            connections.on_connection_failed(move |error| handler(error));
        }
        if let Some(handler) = self.connection_lost {
            connections.on_connection_lost(move |error| handler(error));
        }

        let router = ExchangeRouter::new(self.exchange);
        if let Some(handler) = self.unroutable {
            router.on_unroutable(move |message| handler(message));
        }

        let publisher = match self.severity {
            Some(severity) => EventPublisher::new().with_severity(severity),
            None => EventPublisher::new(),
        };
        let provisioner =
            QueueProvisioner::new(connections.clone(), router.clone(), environment.clone());

        info!(
            mode = %environment.mode,
            exchange = %router.name(),
            "Event bus created"
        );
        Ok(EventBus {
            inner: Arc::new(Inner {
                connections,
                router,
                publisher,
                subscriber: EventSubscriber::new(),
                provisioner,
                environment,
                exchange: Mutex::new(None),
            }),
        })
    }
}
