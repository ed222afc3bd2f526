//! Configuration types for the headerbus crate
//!
//! Every broker-facing operation takes an explicit configuration struct with
//! documented defaults: the connection, the exchange, per-message options,
//! queue declaration and subscription options. Process environment is read in
//! one place, [`BusEnvironment`].

use std::time::Duration;

use broker_client::{
    BasicProperties, ConnectParams, ConsumeOptions, DeliveryMode, FieldTable, HeaderValue,
    PublishOptions, QueueDeclareOptions,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::envelope::ROUTING_HEADER_NAMES;
use crate::error::ConfigurationError;

/// Environment variable selecting the deployment mode.
pub const ENV_MODE: &str = "HEADERBUS_ENV";

/// Environment variable that must equal exactly `true` to allow queue provisioning.
pub const ENV_INITIALIZE_NAMED_QUEUE: &str = "HEADERBUS_INITIALIZE_NAMED_QUEUE";

/// Deployment mode used when `HEADERBUS_ENV` is unset.
pub const DEFAULT_MODE: &str = "development";

/// Default broker host.
pub const DEFAULT_BROKER_HOST: &str = "localhost";

/// Default headers exchange name.
pub const DEFAULT_EXCHANGE_NAME: &str = "headerbus.headers";

/// Default content type for published events.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Settings read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEnvironment {
    /// Deployment mode selector
    /// Default: "development"
    pub mode: String,

    /// Administrative authorization for destructive queue provisioning
    /// Default: false
    pub initialize_named_queue: bool,
}

impl Default for BusEnvironment {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE.to_string(),
            initialize_named_queue: false,
        }
    }
}

impl BusEnvironment {
    /// Read the environment of the current process.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the environment through `lookup`.
    ///
    /// Provisioning is authorized only when the variable equals exactly `true`;
    /// `TRUE`, `1` or `yes` leave it disabled.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            mode: lookup(ENV_MODE).unwrap_or_else(|| DEFAULT_MODE.to_string()),
            initialize_named_queue: lookup(ENV_INITIALIZE_NAMED_QUEUE).as_deref() == Some("true"),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn with_named_queue_initialization(mut self, enabled: bool) -> Self {
        self.initialize_named_queue = enabled;
        self
    }

    /// Whether the bus runs in the development deployment mode.
    pub fn is_development(&self) -> bool {
        self.mode == DEFAULT_MODE
    }
}

/// Configuration for the broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Broker host
    /// Default: "localhost"
    pub broker_host: String,

    /// Maximum time to wait for the broker to accept a connection
    /// Default: 2 seconds
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_host: DEFAULT_BROKER_HOST.to_string(),
            timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    /// Create a new ConnectionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "Broker host must not be empty".to_string(),
            ));
        }

        if self.timeout == Duration::ZERO {
            return Err(ConfigurationError::Invalid(
                "Connection timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn connect_params(&self) -> ConnectParams {
        ConnectParams::new(self.broker_host.clone(), self.timeout)
    }
}

/// Configuration for the headers exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Name of the headers exchange all events are published to
    /// Default: "headerbus.headers"
    pub exchange_name: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
        }
    }
}

impl ExchangeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.exchange_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.exchange_name.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "Exchange name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-message options. Every field is passed through to the broker as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Routing key (ignored by a headers exchange, kept for consumers)
    pub routing_key: String,
    /// Persistent delivery mode
    pub persistent: bool,
    /// Return the message if no queue matches
    pub mandatory: bool,
    /// Default: "application/json"
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub priority: Option<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// The broker `type` property
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    /// Second precision on the wire
    pub timestamp: Option<DateTime<Utc>>,
    /// Per-message TTL, millisecond precision on the wire
    pub expiration: Option<Duration>,
    /// Extra match headers published alongside the routing headers
    pub headers: FieldTable,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            routing_key: String::new(),
            persistent: false,
            mandatory: false,
            content_type: Some(DEFAULT_CONTENT_TYPE.to_string()),
            content_encoding: None,
            priority: None,
            message_id: None,
            correlation_id: None,
            reply_to: None,
            kind: None,
            user_id: None,
            app_id: None,
            timestamp: None,
            expiration: None,
            headers: FieldTable::new(),
        }
    }
}

impl MessageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    /// Add an extra match header.
    ///
    /// Routing header names are reserved and ignored here. Set them through
    /// the event's routing headers.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        let key = key.into();
        if ROUTING_HEADER_NAMES.contains(&key.as_str()) {
            warn!(header = %key, "Ignoring reserved routing header in message options");
        } else {
            self.headers.insert(key, value.into());
        }
        self
    }

    /// Check the options can be published as given.
    ///
    /// Extra headers must not use a routing header name, and the timestamp
    /// must not predate the Unix epoch.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(name) = self
            .headers
            .keys()
            .find(|key| ROUTING_HEADER_NAMES.contains(&key.as_str()))
        {
            return Err(ConfigurationError::ReservedHeader(name.clone()));
        }

        if let Some(timestamp) = self.timestamp {
            if timestamp.timestamp() < 0 {
                return Err(ConfigurationError::TimestampBeforeEpoch {
                    seconds: timestamp.timestamp(),
                });
            }
        }

        Ok(())
    }

    pub(crate) fn publish_options(&self) -> PublishOptions {
        PublishOptions {
            mandatory: self.mandatory,
        }
    }

    /// Broker properties for these options. Routing headers are added by the publisher.
    ///
    /// Run [`MessageOptions::validate`] first: a pre-epoch timestamp has no wire
    /// form and is left out here.
    pub fn to_properties(&self) -> BasicProperties {
        BasicProperties {
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            headers: self.headers.clone(),
            delivery_mode: Some(if self.persistent {
                DeliveryMode::Persistent
            } else {
                DeliveryMode::Transient
            }),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            expiration: self.expiration.map(|ttl| ttl.as_millis().to_string()),
            message_id: self.message_id.clone(),
            timestamp: self
                .timestamp
                .and_then(|ts| u64::try_from(ts.timestamp()).ok()),
            kind: self.kind.clone(),
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
        }
    }

    /// Rebuild options from received broker properties.
    ///
    /// Routing headers are excluded from `headers`; `mandatory` is a publish-time
    /// flag and is not carried by the message.
    pub fn from_properties(routing_key: &str, properties: &BasicProperties) -> Self {
        let headers = properties
            .headers
            .iter()
            .filter(|(key, _)| !ROUTING_HEADER_NAMES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            routing_key: routing_key.to_string(),
            persistent: properties.is_persistent(),
            mandatory: false,
            content_type: properties.content_type.clone(),
            content_encoding: properties.content_encoding.clone(),
            priority: properties.priority,
            message_id: properties.message_id.clone(),
            correlation_id: properties.correlation_id.clone(),
            reply_to: properties.reply_to.clone(),
            kind: properties.kind.clone(),
            user_id: properties.user_id.clone(),
            app_id: properties.app_id.clone(),
            timestamp: properties
                .timestamp
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            expiration: properties
                .expiration
                .as_deref()
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(Duration::from_millis),
            headers,
        }
    }
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueOptions {
    /// Defaults for named queues: durable, kept when unused.
    pub fn named() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }

    /// Defaults for anonymous queues: transient, deleted with their connection.
    pub fn anonymous() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            exclusive: false,
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub(crate) fn to_declare_options(self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
        }
    }
}

/// How deliveries are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// The broker considers a message handled once delivered
    #[default]
    Auto,
    /// The handler acknowledges each event with `ReceivedEvent::ack`
    Manual,
}

/// Subscription options. The default is the empty set: broker defaults apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub ack: AckMode,
    /// Unacknowledged deliveries in flight (manual ack only)
    pub prefetch: Option<u16>,
    pub exclusive: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual_ack(mut self) -> Self {
        self.ack = AckMode::Manual;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub(crate) fn to_consume_options(self) -> ConsumeOptions {
        ConsumeOptions {
            manual_ack: self.ack == AckMode::Manual,
            prefetch: self.prefetch,
            exclusive: self.exclusive,
        }
    }
}
