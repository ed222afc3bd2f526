//! AMQP 0-9-1 backend built on `lapin`.
//!
//! `AmqpBroker` opens one `lapin` connection per [`Broker::connect`] call. Each
//! connection keeps a single channel in publisher-confirm mode for topology
//! and publishing, and opens a dedicated channel per consumer so that prefetch
//! limits stay per subscription.
//!
//! Delivery tags are channel scoped in AMQP. Deliveries are handed out with a
//! connection-wide tag and mapped back to their channel on `ack`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions as AmqpQueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable as AmqpFieldTable, LongString, ShortString};
use lapin::{BasicProperties as AmqpProperties, Channel, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::client::{Broker, Connection, Consumer};
use crate::error::{BrokerError, Result};
use crate::types::{
    BasicProperties, CloseReason, ConnectParams, ConnectionId, ConsumeOptions, Delivery,
    DeliveryMode, ExchangeKind, FieldTable, HeaderValue, LinkState, OperationKind,
    PublishOptions, QueueDeclareOptions, QueueInfo, ReturnedMessage,
};

/// Default AMQP port used when the host carries no scheme.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Reply code sent with a requested connection close.
const REPLY_SUCCESS: u16 = 200;

/// Broker backend speaking AMQP 0-9-1 through `lapin`.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    next_connection_id: Arc<AtomicU64>,
}

impl AmqpBroker {
    /// Create a broker backend.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the connection URI for a configured host.
///
/// A value that already carries a scheme (`amqp://` or `amqps://`) is used
/// verbatim. A bare host, or `host:port`, is expanded to the default vhost.
pub fn amqp_uri(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else if host.contains(':') {
        format!("amqp://{host}/%2f")
    } else {
        format!("amqp://{host}:{DEFAULT_AMQP_PORT}/%2f")
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Connection>> {
        let uri = amqp_uri(&params.host);
        let connection = lapin::Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionRefused {
                host: params.host.clone(),
                reason: e.to_string(),
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| map_error(OperationKind::Connect, e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| map_error(OperationKind::Connect, e))?;

        let id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (link, _) = watch::channel(LinkState::Open);
        let link = Arc::new(link);

        let on_error = Arc::clone(&link);
        connection.on_error(move |error| {
            warn!(connection = %id, error = %error, "AMQP connection error");
            mark_closed(&on_error, CloseReason::Lost(error.to_string()));
        });

        let (returns_tx, returns_rx) = mpsc::unbounded_channel();

        debug!(connection = %id, host = %params.host, "AMQP connection opened");

        Ok(Arc::new(AmqpConnection {
            id,
            connection,
            channel,
            link,
            returns_tx,
            returns_rx: Mutex::new(Some(returns_rx)),
            consumers: Mutex::new(HashMap::new()),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            next_delivery_tag: Arc::new(AtomicU64::new(0)),
        }))
    }
}

/// Move the link to closed, keeping the first reason.
fn mark_closed(link: &watch::Sender<LinkState>, reason: CloseReason) {
    link.send_if_modified(|state| {
        if state.is_open() {
            *state = LinkState::Closed(reason);
            true
        } else {
            false
        }
    });
}

fn map_error(operation: OperationKind, error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            BrokerError::ConnectionClosed
        }
        other => BrokerError::OperationFailed {
            operation,
            reason: other.to_string(),
        },
    }
}

/// An unacknowledged delivery: its consumer channel and channel-scoped tag.
type PendingAck = (Channel, u64);

struct AmqpConnection {
    id: ConnectionId,
    connection: lapin::Connection,
    channel: Channel,
    link: Arc<watch::Sender<LinkState>>,
    returns_tx: mpsc::UnboundedSender<ReturnedMessage>,
    returns_rx: Mutex<Option<mpsc::UnboundedReceiver<ReturnedMessage>>>,
    consumers: Mutex<HashMap<String, Channel>>,
    unacked: Arc<Mutex<HashMap<u64, PendingAck>>>,
    next_delivery_tag: Arc<AtomicU64>,
}

impl AmqpConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.link.borrow().is_open() {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.link.borrow().is_open() && self.connection.status().connected()
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;
        let kind = match kind {
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        self.channel
            .exchange_declare(name, kind, options, AmqpFieldTable::default())
            .await
            .map_err(|e| map_error(OperationKind::DeclareExchange, e))
    }

    async fn declare_queue(&self, name: &str, options: QueueDeclareOptions) -> Result<QueueInfo> {
        self.ensure_open()?;
        let options = AmqpQueueDeclareOptions {
            durable: options.durable,
            auto_delete: options.auto_delete,
            exclusive: options.exclusive,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(name, options, AmqpFieldTable::default())
            .await
            .map_err(|e| map_error(OperationKind::DeclareQueue, e))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<u32> {
        self.ensure_open()?;
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| map_error(OperationKind::DeleteQueue, e))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, arguments: FieldTable) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                to_amqp_table(&arguments),
            )
            .await
            .map_err(|e| map_error(OperationKind::Bind, e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<()> {
        self.ensure_open()?;
        let publish_options = BasicPublishOptions {
            mandatory: options.mandatory,
            ..Default::default()
        };
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                publish_options,
                &body,
                to_amqp_properties(&properties),
            )
            .await
            .map_err(|e| map_error(OperationKind::Publish, e))?;

        let confirmation = confirm
            .await
            .map_err(|e| map_error(OperationKind::Publish, e))?;

        match confirmation {
            Confirmation::Ack(Some(returned)) => {
                trace!(exchange = %exchange, "Mandatory message returned");
                let _ = self.returns_tx.send(ReturnedMessage {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                    exchange: returned.delivery.exchange.as_str().to_string(),
                    routing_key: returned.delivery.routing_key.as_str().to_string(),
                    properties: from_amqp_properties(&returned.delivery.properties),
                    body: Bytes::from(returned.delivery.data),
                });
                Ok(())
            }
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(_) => Err(BrokerError::OperationFailed {
                operation: OperationKind::Publish,
                reason: "message was nacked by the broker".to_string(),
            }),
        }
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Consumer> {
        self.ensure_open()?;
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| map_error(OperationKind::Consume, e))?;

        if let Some(prefetch) = options.prefetch.filter(|_| options.manual_ack) {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| map_error(OperationKind::Consume, e))?;
        }

        let consume_options = BasicConsumeOptions {
            no_ack: !options.manual_ack,
            exclusive: options.exclusive,
            ..Default::default()
        };
        let mut stream = channel
            .basic_consume(queue, "", consume_options, AmqpFieldTable::default())
            .await
            .map_err(|e| map_error(OperationKind::Consume, e))?;

        let tag = stream.tag().as_str().to_string();
        self.consumers.lock().insert(tag.clone(), channel.clone());

        let (sender, receiver) = mpsc::unbounded_channel();
        let unacked = Arc::clone(&self.unacked);
        let next_tag = Arc::clone(&self.next_delivery_tag);
        let manual_ack = options.manual_ack;
        let consumer_tag = tag.clone();

        tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        debug!(consumer = %consumer_tag, error = %e, "Consumer stream ended");
                        break;
                    }
                };

                let tag = next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                if manual_ack {
                    unacked
                        .lock()
                        .insert(tag, (channel.clone(), delivery.delivery_tag));
                }

                let delivery = Delivery {
                    delivery_tag: tag,
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    properties: from_amqp_properties(&delivery.properties),
                    body: Bytes::from(delivery.data),
                };
                if sender.send(delivery).is_err() {
                    break;
                }
            }
        });

        Ok(Consumer::new(tag, queue, receiver))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.ensure_open()?;
        let Some(channel) = self.consumers.lock().remove(consumer_tag) else {
            return Ok(());
        };

        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| map_error(OperationKind::Cancel, e))?;

        // Closing the channel requeues whatever it still holds unacked
        self.unacked
            .lock()
            .retain(|_, (pending, _)| pending.id() != channel.id());
        channel
            .close(REPLY_SUCCESS, "consumer cancelled")
            .await
            .map_err(|e| map_error(OperationKind::Cancel, e))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let (channel, channel_tag) = self
            .unacked
            .lock()
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;

        channel
            .basic_ack(channel_tag, BasicAckOptions::default())
            .await
            .map_err(|e| map_error(OperationKind::Ack, e))
    }

    fn take_returns(&self) -> Option<mpsc::UnboundedReceiver<ReturnedMessage>> {
        self.returns_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        mark_closed(&self.link, CloseReason::Requested);
        self.consumers.lock().clear();
        self.unacked.lock().clear();

        self.connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| map_error(OperationKind::Close, e))?;
        debug!(connection = %self.id, "AMQP connection closed");
        Ok(())
    }
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
        HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.as_str())),
    }
}

/// Convert a wire value back into a header value.
///
/// Numeric widths collapse into `Int`. Values with no header counterpart
/// (floats, arrays, nested tables) are skipped.
fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::Boolean(b) => Some(HeaderValue::Bool(*b)),
        AMQPValue::ShortShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::ShortUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongUInt(i) => Some(HeaderValue::Int(i64::from(*i))),
        AMQPValue::LongLongInt(i) => Some(HeaderValue::Int(*i)),
        AMQPValue::ShortString(s) => Some(HeaderValue::Str(s.as_str().to_string())),
        AMQPValue::LongString(s) => Some(HeaderValue::Str(
            String::from_utf8_lossy(s.as_bytes()).into_owned(),
        )),
        _ => None,
    }
}

/// Convert a header table into its wire representation.
pub fn to_amqp_table(table: &FieldTable) -> AmqpFieldTable {
    let mut amqp = AmqpFieldTable::default();
    for (key, value) in table {
        amqp.insert(ShortString::from(key.as_str()), to_amqp_value(value));
    }
    amqp
}

/// Convert a wire header table into a header table.
pub fn from_amqp_table(table: &AmqpFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            from_amqp_value(value).map(|value| (key.as_str().to_string(), value))
        })
        .collect()
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_deref().map(ShortString::from)
}

fn string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

/// Convert message properties into their wire representation.
pub fn to_amqp_properties(properties: &BasicProperties) -> AmqpProperties {
    let mut amqp = AmqpProperties::default();
    if let Some(value) = short(&properties.content_type) {
        amqp = amqp.with_content_type(value);
    }
    if let Some(value) = short(&properties.content_encoding) {
        amqp = amqp.with_content_encoding(value);
    }
    if !properties.headers.is_empty() {
        amqp = amqp.with_headers(to_amqp_table(&properties.headers));
    }
    if let Some(mode) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(match mode {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        });
    }
    if let Some(priority) = properties.priority {
        amqp = amqp.with_priority(priority);
    }
    if let Some(value) = short(&properties.correlation_id) {
        amqp = amqp.with_correlation_id(value);
    }
    if let Some(value) = short(&properties.reply_to) {
        amqp = amqp.with_reply_to(value);
    }
    if let Some(value) = short(&properties.expiration) {
        amqp = amqp.with_expiration(value);
    }
    if let Some(value) = short(&properties.message_id) {
        amqp = amqp.with_message_id(value);
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp);
    }
    if let Some(value) = short(&properties.kind) {
        amqp = amqp.with_kind(value);
    }
    if let Some(value) = short(&properties.user_id) {
        amqp = amqp.with_user_id(value);
    }
    if let Some(value) = short(&properties.app_id) {
        amqp = amqp.with_app_id(value);
    }
    amqp
}

/// Convert wire properties into message properties.
pub fn from_amqp_properties(amqp: &AmqpProperties) -> BasicProperties {
    BasicProperties {
        content_type: string(amqp.content_type()),
        content_encoding: string(amqp.content_encoding()),
        headers: amqp
            .headers()
            .as_ref()
            .map(from_amqp_table)
            .unwrap_or_default(),
        delivery_mode: amqp.delivery_mode().map(|mode| {
            if mode == 2 {
                DeliveryMode::Persistent
            } else {
                DeliveryMode::Transient
            }
        }),
        priority: *amqp.priority(),
        correlation_id: string(amqp.correlation_id()),
        reply_to: string(amqp.reply_to()),
        expiration: string(amqp.expiration()),
        message_id: string(amqp.message_id()),
        timestamp: *amqp.timestamp(),
        kind: string(amqp.kind()),
        user_id: string(amqp.user_id()),
        app_id: string(amqp.app_id()),
    }
}
