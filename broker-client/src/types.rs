//! Core types for the broker client.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single value in a header table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// UTF-8 string
    Str(String),
}

impl HeaderValue {
    /// Get the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a bool if it is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the value as an integer if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Bool(b) => write!(f, "{b}"),
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Ordered header table, used both for message headers and binding arguments.
pub type FieldTable = BTreeMap<String, HeaderValue>;

/// Build a [`FieldTable`] from key/value pairs.
///
/// ```
/// use broker_client::{field_table, HeaderValue};
///
/// let table = field_table([("region", "us")]);
/// assert_eq!(table.get("region"), Some(&HeaderValue::Str("us".to_string())));
/// ```
pub fn field_table<I, K, V>(pairs: I) -> FieldTable
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<HeaderValue>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}

/// Exchange routing algorithms supported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Route on header match arguments
    Headers,
    /// Route to every bound queue
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Headers => write!(f, "headers"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Message delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Dropped if the broker restarts
    Transient,
    /// Survives a broker restart when routed to a durable queue
    Persistent,
}

/// Broker-level message properties. All fields are optional pass-through values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: FieldTable,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, encoded as a string
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Unix timestamp in seconds
    pub timestamp: Option<u64>,
    /// The AMQP `type` property
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl BasicProperties {
    /// Whether the message was published with persistent delivery mode.
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent)
    }
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeclareOptions {
    /// Queue survives a broker restart
    pub durable: bool,
    /// Queue is deleted when its declaring connection goes away
    pub auto_delete: bool,
    /// Queue may only be used by its declaring connection
    pub exclusive: bool,
}

/// Options for starting a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries must be acknowledged explicitly
    pub manual_ack: bool,
    /// Maximum unacknowledged deliveries in flight (manual ack only)
    pub prefetch: Option<u16>,
    /// No other consumer may attach to the queue
    pub exclusive: bool,
}

/// Options for publishing a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Return the message to the publisher if it cannot be routed
    pub mandatory: bool,
}

/// Parameters for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Broker host
    pub host: String,
    /// Maximum time to wait for the connection to open
    pub timeout: Duration,
}

impl ConnectParams {
    /// Create connection parameters.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

/// Result of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Queue name (broker generated for anonymous queues)
    pub name: String,
    /// Messages waiting in the queue
    pub message_count: u32,
    /// Consumers attached to the queue
    pub consumer_count: u32,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A mandatory message that the broker could not route to any queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Reply code used when a mandatory message has no route.
pub const REPLY_NO_ROUTE: u16 = 312;

/// Unique identifier for a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new ConnectionId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection stopped being open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner closed the connection
    Requested,
    /// The connection dropped without being asked to
    Lost(String),
}

/// Observable state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed(CloseReason),
}

impl LinkState {
    /// Whether the link is open.
    pub fn is_open(&self) -> bool {
        matches!(self, LinkState::Open)
    }
}

/// Broker operations, used for failure injection and the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    DeclareExchange,
    DeclareQueue,
    DeleteQueue,
    Bind,
    Publish,
    Consume,
    Cancel,
    Ack,
    Close,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connection.open",
            OperationKind::DeclareExchange => "exchange.declare",
            OperationKind::DeclareQueue => "queue.declare",
            OperationKind::DeleteQueue => "queue.delete",
            OperationKind::Bind => "queue.bind",
            OperationKind::Publish => "basic.publish",
            OperationKind::Consume => "basic.consume",
            OperationKind::Cancel => "basic.cancel",
            OperationKind::Ack => "basic.ack",
            OperationKind::Close => "connection.close",
        };
        write!(f, "{name}")
    }
}
