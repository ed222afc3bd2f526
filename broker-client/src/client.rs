//! Broker and connection traits.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::types::{
    BasicProperties, ConnectParams, ConnectionId, ConsumeOptions, Delivery, ExchangeKind,
    FieldTable, LinkState, PublishOptions, QueueDeclareOptions, QueueInfo, ReturnedMessage,
};

/// A message broker that can open connections.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new connection.
    ///
    /// Implementations are not required to honour `params.timeout`; callers that
    /// need a bound should wrap the call in `tokio::time::timeout`.
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>>;
}

/// A single live link to the broker.
///
/// Every operation completes when the broker confirms it. Once the link leaves
/// [`LinkState::Open`] every operation fails with `BrokerError::ConnectionClosed`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier of this connection.
    fn id(&self) -> ConnectionId;

    /// Whether the link is still open.
    fn is_open(&self) -> bool;

    /// Watch the link state. The value changes exactly once, from open to closed.
    fn state(&self) -> watch::Receiver<LinkState>;

    /// Declare an exchange, creating it if absent.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    /// Declare a queue, creating it if absent. An empty name asks the broker to
    /// generate one.
    async fn declare_queue(&self, name: &str, options: QueueDeclareOptions) -> Result<QueueInfo>;

    /// Delete a queue and its bindings, returning the number of dropped messages.
    async fn delete_queue(&self, name: &str) -> Result<u32>;

    /// Bind a queue to an exchange with header match arguments.
    async fn bind_queue(&self, queue: &str, exchange: &str, arguments: FieldTable) -> Result<()>;

    /// Publish a message. Completes once the broker has accepted it for routing.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<()>;

    /// Start consuming from a queue.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer>;

    /// Stop a consumer. Unacknowledged deliveries are requeued.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery made to a manual-ack consumer.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Take the receiver for returned (unroutable mandatory) messages.
    ///
    /// There is one receiver per connection; later calls return `None`.
    fn take_returns(&self) -> Option<mpsc::UnboundedReceiver<ReturnedMessage>>;

    /// Close the connection and release its resources.
    async fn close(&self) -> Result<()>;
}

/// A stream of deliveries for one queue.
///
/// The stream ends when the consumer is cancelled, the queue is deleted or the
/// connection closes.
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    /// Create a consumer from its delivery channel.
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            receiver,
        }
    }

    /// The broker-assigned consumer tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The queue this consumer reads from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery. Returns `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Take the next delivery if one is ready.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .finish()
    }
}
