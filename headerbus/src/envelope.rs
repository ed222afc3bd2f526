//! Event envelope and routing headers
//!
//! An event is routed by four headers: the firehose flag, product, component
//! and event type. A routing-capable event carries all four or none; a partial
//! set is rejected before anything reaches the broker.

use std::sync::Arc;

use broker_client::{Connection, Delivery, FieldTable, HeaderValue};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::MessageOptions;
use crate::error::{BusError, ConfigurationError};

/// Header carrying the firehose flag.
pub const HEADER_FIREHOSE: &str = "headerbus_firehose";
/// Header carrying the product name.
pub const HEADER_PRODUCT: &str = "headerbus_product";
/// Header carrying the component name.
pub const HEADER_COMPONENT: &str = "headerbus_component";
/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "headerbus_event_type";

/// The four routing headers, in canonical order.
pub const ROUTING_HEADER_NAMES: [&str; 4] = [
    HEADER_FIREHOSE,
    HEADER_PRODUCT,
    HEADER_COMPONENT,
    HEADER_EVENT_TYPE,
];

/// Routing headers as supplied by an event. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders {
    pub firehose: Option<bool>,
    pub product: Option<String>,
    pub component: Option<String>,
    pub event_type: Option<String>,
}

impl EventHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_firehose(mut self, firehose: bool) -> Self {
        self.firehose = Some(firehose);
        self
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Whether no routing header is set.
    pub fn is_empty(&self) -> bool {
        self.missing().len() == ROUTING_HEADER_NAMES.len()
    }

    /// Names of the routing headers that are not set.
    pub fn missing(&self) -> Vec<&'static str> {
        let present = [
            self.firehose.is_some(),
            self.product.is_some(),
            self.component.is_some(),
            self.event_type.is_some(),
        ];
        ROUTING_HEADER_NAMES
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }

    /// Apply the all-or-nothing rule.
    ///
    /// Returns `Ok(Some(_))` when all four headers are set, `Ok(None)` when none
    /// are, and an error naming the missing headers otherwise.
    pub fn routing(&self) -> Result<Option<RoutingHeaders>, ConfigurationError> {
        match (
            self.firehose,
            &self.product,
            &self.component,
            &self.event_type,
        ) {
            (Some(firehose), Some(product), Some(component), Some(event_type)) => {
                Ok(Some(RoutingHeaders {
                    firehose,
                    product: product.clone(),
                    component: component.clone(),
                    event_type: event_type.clone(),
                }))
            }
            _ if self.is_empty() => Ok(None),
            _ => Err(ConfigurationError::IncompleteRoutingHeaders {
                missing: self.missing(),
            }),
        }
    }

    /// Read routing headers from a message header table, returning the
    /// remaining headers separately.
    pub fn from_field_table(table: &FieldTable) -> (Self, FieldTable) {
        let string = |key: &str| table.get(key).and_then(HeaderValue::as_str).map(str::to_string);
        let headers = Self {
            firehose: table.get(HEADER_FIREHOSE).and_then(HeaderValue::as_bool),
            product: string(HEADER_PRODUCT),
            component: string(HEADER_COMPONENT),
            event_type: string(HEADER_EVENT_TYPE),
        };
        let extra = table
            .iter()
            .filter(|(key, _)| !ROUTING_HEADER_NAMES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        (headers, extra)
    }
}

/// A complete set of routing headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHeaders {
    pub firehose: bool,
    pub product: String,
    pub component: String,
    pub event_type: String,
}

impl RoutingHeaders {
    pub fn new(
        firehose: bool,
        product: impl Into<String>,
        component: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            firehose,
            product: product.into(),
            component: component.into(),
            event_type: event_type.into(),
        }
    }

    /// The headers as broker message headers.
    pub fn to_field_table(&self) -> FieldTable {
        let mut table = FieldTable::new();
        table.insert(HEADER_FIREHOSE.to_string(), HeaderValue::Bool(self.firehose));
        table.insert(HEADER_PRODUCT.to_string(), HeaderValue::from(self.product.as_str()));
        table.insert(HEADER_COMPONENT.to_string(), HeaderValue::from(self.component.as_str()));
        table.insert(HEADER_EVENT_TYPE.to_string(), HeaderValue::from(self.event_type.as_str()));
        table
    }
}

impl From<RoutingHeaders> for EventHeaders {
    fn from(headers: RoutingHeaders) -> Self {
        Self {
            firehose: Some(headers.firehose),
            product: Some(headers.product),
            component: Some(headers.component),
            event_type: Some(headers.event_type),
        }
    }
}

/// Anything that can be published as a tagged event.
///
/// Implement this for domain types to publish them directly instead of
/// building an [`EventEnvelope`].
pub trait Routable {
    /// Routing headers for the event (all four, or none for an untagged publish).
    fn routing_headers(&self) -> EventHeaders;

    /// The event payload.
    fn payload(&self) -> Value;

    /// Message options to publish with.
    fn message_options(&self) -> MessageOptions {
        MessageOptions::default()
    }
}

/// The unit exchanged between producers and consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub headers: EventHeaders,
    pub payload: Value,
    pub options: MessageOptions,
}

impl EventEnvelope {
    /// Create an envelope with default message options.
    pub fn new(headers: impl Into<EventHeaders>, payload: Value) -> Self {
        Self {
            headers: headers.into(),
            payload,
            options: MessageOptions::default(),
        }
    }

    /// Create an envelope without routing headers.
    pub fn untagged(payload: Value) -> Self {
        Self::new(EventHeaders::default(), payload)
    }

    /// Create an envelope from any serializable payload.
    pub fn from_serializable<T: Serialize>(
        headers: impl Into<EventHeaders>,
        payload: &T,
    ) -> Result<Self, BusError> {
        Ok(Self::new(headers, serde_json::to_value(payload)?))
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }
}

impl Routable for EventEnvelope {
    fn routing_headers(&self) -> EventHeaders {
        self.headers.clone()
    }

    fn payload(&self) -> Value {
        self.payload.clone()
    }

    fn message_options(&self) -> MessageOptions {
        self.options.clone()
    }
}

/// An event received by a subscription.
pub struct ReceivedEvent {
    /// Routing headers found on the message
    pub headers: EventHeaders,
    /// Every other header on the message
    pub extra_headers: FieldTable,
    /// The message body exactly as published
    pub body: Bytes,
    /// The body decoded as JSON (`Value::Null` when it is not JSON)
    pub payload: Value,
    /// Message options as published
    pub options: MessageOptions,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Option<Arc<dyn Connection>>,
}

impl ReceivedEvent {
    pub(crate) fn from_delivery(delivery: Delivery, acker: Option<Arc<dyn Connection>>) -> Self {
        let (headers, extra_headers) = EventHeaders::from_field_table(&delivery.properties.headers);
        let options = MessageOptions::from_properties(&delivery.routing_key, &delivery.properties);
        let payload = serde_json::from_slice(&delivery.body).unwrap_or_else(|e| {
            tracing::debug!("Received body is not JSON: {}", e);
            Value::Null
        });

        Self {
            headers,
            extra_headers,
            body: delivery.body,
            payload,
            options,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            acker,
        }
    }

    /// Decode the body into a typed payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether this event must be acknowledged.
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge the event. A no-op for auto-ack subscriptions.
    pub async fn ack(&self) -> Result<(), BusError> {
        match &self.acker {
            Some(connection) => Ok(connection.ack(self.delivery_tag).await?),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ReceivedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedEvent")
            .field("headers", &self.headers)
            .field("extra_headers", &self.extra_headers)
            .field("payload", &self.payload)
            .field("options", &self.options)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
