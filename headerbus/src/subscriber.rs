//! Queue declaration and event subscription

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use broker_client::{Connection, FieldTable, HeaderValue};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AckMode, QueueOptions, SubscribeOptions};
use crate::envelope::ReceivedEvent;
use crate::error::BusError;
use crate::exchange::ExchangeHandle;

/// Receives events from a subscription.
///
/// Implemented for any `Fn(ReceivedEvent) -> impl Future<Output = ()>`, so
/// closures returning `async` blocks can be passed directly.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: ReceivedEvent);
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(ReceivedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: ReceivedEvent) {
        (self)(event).await
    }
}

/// A declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    name: String,
    options: QueueOptions,
    bindings: Vec<FieldTable>,
}

impl QueueHandle {
    pub(crate) fn new(name: impl Into<String>, options: QueueOptions, bindings: Vec<FieldTable>) -> Self {
        Self {
            name: name.into(),
            options,
            bindings,
        }
    }

    /// Queue name (broker generated for anonymous queues).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// Bindings applied when the queue was declared.
    pub fn bindings(&self) -> &[FieldTable] {
        &self.bindings
    }
}

/// Information about an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub queue: String,
    pub options: SubscribeOptions,
}

/// Declares queues and dispatches their events to handlers.
#[derive(Debug, Clone, Default)]
pub struct EventSubscriber {
    active: Arc<DashMap<String, SubscriptionInfo>>,
}

impl EventSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a named queue with the named-queue defaults.
    ///
    /// Bindings of named queues are managed by provisioning, so none are added here.
    pub async fn named_queue(
        &self,
        exchange: &ExchangeHandle,
        name: &str,
    ) -> Result<QueueHandle, BusError> {
        exchange.ensure_valid()?;
        let options = QueueOptions::named();
        let info = exchange
            .connection()
            .declare_queue(name, options.to_declare_options())
            .await?;

        debug!(queue = %info.name, messages = info.message_count, "Declared named queue");
        Ok(QueueHandle::new(info.name, options, Vec::new()))
    }

    /// Declare a broker-named queue with the anonymous defaults and bind it.
    ///
    /// Each binding without an `x-match` argument matches on all of its headers.
    pub async fn anonymous_queue(
        &self,
        exchange: &ExchangeHandle,
        bindings: Vec<FieldTable>,
    ) -> Result<QueueHandle, BusError> {
        exchange.ensure_valid()?;
        let options = QueueOptions::anonymous();
        let connection = exchange.connection();
        let info = connection.declare_queue("", options.to_declare_options()).await?;

        let mut applied = Vec::with_capacity(bindings.len());
        for mut arguments in bindings {
            arguments
                .entry("x-match".to_string())
                .or_insert_with(|| HeaderValue::from("all"));
            connection
                .bind_queue(&info.name, exchange.name(), arguments.clone())
                .await?;
            applied.push(arguments);
        }

        debug!(queue = %info.name, bindings = applied.len(), "Declared anonymous queue");
        Ok(QueueHandle::new(info.name, options, applied))
    }

    /// Start dispatching events from `queue` to `handler`.
    ///
    /// Events are handled one at a time in delivery order. The returned
    /// [`Subscription`] stops dispatch when cancelled or dropped.
    pub async fn subscribe<H>(
        &self,
        exchange: &ExchangeHandle,
        queue: &QueueHandle,
        options: SubscribeOptions,
        handler: H,
    ) -> Result<Subscription, BusError>
    where
        H: EventHandler,
    {
        exchange.ensure_valid()?;
        let connection = Arc::clone(exchange.connection());
        let mut consumer = connection
            .consume(queue.name(), options.to_consume_options())
            .await?;
        let tag = consumer.tag().to_string();

        self.active.insert(
            tag.clone(),
            SubscriptionInfo {
                queue: queue.name().to_string(),
                options,
            },
        );

        let acker = (options.ack == AckMode::Manual).then(|| Arc::clone(&connection));
        let active = Arc::clone(&self.active);
        let task_tag = tag.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                let event = ReceivedEvent::from_delivery(delivery, acker.clone());
                handler.handle(event).await;
            }
            debug!(consumer = %task_tag, "Consumer stream ended");
            active.remove(&task_tag);
        });

        info!(queue = %queue.name(), consumer = %tag, "Subscribed");
        Ok(Subscription {
            tag,
            queue: queue.name().to_string(),
            connection,
            task,
            active: Arc::clone(&self.active),
        })
    }

    /// Consumer tags of the active subscriptions.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.active.iter().map(|entry| entry.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Details of an active subscription.
    pub fn subscription(&self, consumer_tag: &str) -> Option<SubscriptionInfo> {
        self.active.get(consumer_tag).map(|entry| entry.value().clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.active.len()
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle stops dispatch and cancels the broker consumer.
pub struct Subscription {
    tag: String,
    queue: String,
    connection: Arc<dyn Connection>,
    task: JoinHandle<()>,
    active: Arc<DashMap<String, SubscriptionInfo>>,
}

impl Subscription {
    /// Broker consumer tag.
    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether events are still being dispatched.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop dispatch and cancel the broker consumer, waiting for the broker.
    pub async fn cancel(self) -> Result<(), BusError> {
        self.task.abort();
        self.active.remove(&self.tag);
        if self.connection.is_open() {
            self.connection.cancel(&self.tag).await?;
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        if self.active.remove(&self.tag).is_none() {
            return;
        }

        if !self.connection.is_open() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let connection = Arc::clone(&self.connection);
                let tag = self.tag.clone();
                runtime.spawn(async move {
                    if let Err(e) = connection.cancel(&tag).await {
                        warn!("Failed to cancel consumer {}: {}", tag, e);
                    }
                });
            }
            Err(_) => debug!("No runtime to cancel consumer {}", self.tag),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("active", &self.is_active())
            .finish()
    }
}
