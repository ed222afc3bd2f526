//! Event publishing

use bytes::Bytes;
use serde_json::{json, Value};
use tracing::trace;

use crate::config::MessageOptions;
use crate::envelope::{Routable, RoutingHeaders};
use crate::error::{BusError, ConfigurationError};
use crate::exchange::ExchangeHandle;
use crate::hook::{log_event_published, Severity};

/// Check an event before any broker call.
///
/// Returns its routing headers (`None` for an untagged event) and the options
/// it will be published with.
pub(crate) fn check_publishable<R>(
    event: &R,
) -> Result<(Option<RoutingHeaders>, MessageOptions), ConfigurationError>
where
    R: Routable + ?Sized,
{
    let routing = event.routing_headers().routing()?;
    let options = event.message_options();
    options.validate()?;
    Ok((routing, options))
}

/// Publishes routable events through a resolved exchange.
///
/// Publishing does not wait for delivery; it completes once the broker has
/// accepted the message. Whether the message survives a broker restart is
/// decided by the `persistent` option and the durability of the queues it
/// reaches.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    severity: Severity,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self {
            severity: Severity::Info,
        }
    }
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Severity reported to the publish hook. Default: `Severity::Info`.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Publish an event.
    ///
    /// Events carrying all four routing headers are published tagged, events
    /// carrying none are published untagged. A partial header set is rejected
    /// with `ConfigurationError::IncompleteRoutingHeaders` before the broker is
    /// contacted, as are message options that fail
    /// [`MessageOptions::validate`].
    pub async fn publish<R>(&self, exchange: &ExchangeHandle, event: &R) -> Result<(), BusError>
    where
        R: Routable + Sync + ?Sized,
    {
        let (routing, options) = check_publishable(event)?;
        exchange.ensure_valid()?;

        let payload = event.payload();
        let body = Bytes::from(serde_json::to_vec(&payload)?);

        let mut properties = options.to_properties();
        if let Some(routing) = &routing {
            properties.headers.extend(routing.to_field_table());
        }
        let metadata = json!({
            "exchange": exchange.name(),
            "headers": &properties.headers,
            "options": &options,
        });

        exchange
            .connection()
            .publish(
                exchange.name(),
                &options.routing_key,
                options.publish_options(),
                properties,
                body,
            )
            .await?;

        trace!(
            exchange = %exchange.name(),
            tagged = routing.is_some(),
            "Published event"
        );
        log_event_published(self.severity, &metadata, &payload, "Published event");

        Ok(())
    }

    /// Publish a JSON payload without routing headers.
    pub async fn publish_untagged(
        &self,
        exchange: &ExchangeHandle,
        payload: Value,
    ) -> Result<(), BusError> {
        self.publish(exchange, &crate::envelope::EventEnvelope::untagged(payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ExchangeConfig, MessageOptions};
    use crate::connection::ConnectionManager;
    use crate::envelope::{EventEnvelope, EventHeaders, HEADER_PRODUCT};
    use crate::error::ConfigurationError;
    use crate::exchange::ExchangeRouter;
    use broker_client::{
        ConsumeOptions, FieldTable, HeaderValue, InMemoryBroker, OperationKind,
        QueueDeclareOptions,
    };
    use std::sync::Arc;

    async fn setup() -> (InMemoryBroker, ExchangeHandle) {
        let broker = InMemoryBroker::new();
        let connections = ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::new());
        connections.connect().await.unwrap();
        let exchange = ExchangeRouter::new(ExchangeConfig::new())
            .resolve(&connections)
            .await
            .unwrap();
        (broker, exchange)
    }

    fn publishes(broker: &InMemoryBroker) -> usize {
        broker
            .operations()
            .iter()
            .filter(|op| op.kind == OperationKind::Publish)
            .count()
    }

    #[tokio::test]
    async fn test_partial_headers_make_no_broker_call() {
        let (broker, exchange) = setup().await;
        let envelope = EventEnvelope::new(
            EventHeaders::new().with_product("p1").with_firehose(true),
            json!({"id": 1}),
        );

        let error = EventPublisher::new()
            .publish(&exchange, &envelope)
            .await
            .unwrap_err();

        assert_eq!(
            error,
            BusError::Configuration(ConfigurationError::IncompleteRoutingHeaders {
                missing: vec!["headerbus_component", "headerbus_event_type"],
            })
        );
        assert_eq!(publishes(&broker), 0);
    }

    #[tokio::test]
    async fn test_routing_header_in_options_makes_no_broker_call() {
        let (broker, exchange) = setup().await;
        let mut envelope = EventEnvelope::untagged(json!({"id": 1}));
        envelope.options.headers.insert(HEADER_PRODUCT.to_string(), HeaderValue::from("p1"));

        let error = EventPublisher::new()
            .publish(&exchange, &envelope)
            .await
            .unwrap_err();

        assert_eq!(
            error,
            BusError::Configuration(ConfigurationError::ReservedHeader(
                HEADER_PRODUCT.to_string()
            ))
        );
        assert_eq!(publishes(&broker), 0);
    }

    #[tokio::test]
    async fn test_pre_epoch_timestamp_makes_no_broker_call() {
        let (broker, exchange) = setup().await;
        let timestamp = chrono::DateTime::<chrono::Utc>::from_timestamp(-60, 0).unwrap();
        let envelope = EventEnvelope::untagged(json!({"id": 1}))
            .with_options(MessageOptions::new().with_timestamp(timestamp));

        let error = EventPublisher::new()
            .publish(&exchange, &envelope)
            .await
            .unwrap_err();

        assert_eq!(
            error,
            BusError::Configuration(ConfigurationError::TimestampBeforeEpoch { seconds: -60 })
        );
        assert_eq!(publishes(&broker), 0);
    }

    #[tokio::test]
    async fn test_tagged_publish_attaches_headers() {
        let (broker, exchange) = setup().await;
        let connection = exchange.connection().clone();
        connection
            .declare_queue("all", QueueDeclareOptions::default())
            .await
            .unwrap();
        connection
            .bind_queue("all", exchange.name(), FieldTable::new())
            .await
            .unwrap();
        let mut consumer = connection
            .consume("all", ConsumeOptions::default())
            .await
            .unwrap();

        let envelope = EventEnvelope::new(
            EventHeaders::new()
                .with_firehose(true)
                .with_product("p1")
                .with_component("c1")
                .with_event_type("created"),
            json!({"id": 1}),
        )
        .with_options(MessageOptions::new().with_header("region", "us"));

        EventPublisher::new().publish(&exchange, &envelope).await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(
            delivery.properties.headers.get(HEADER_PRODUCT),
            Some(&HeaderValue::from("p1"))
        );
        assert_eq!(
            delivery.properties.headers.get("region"),
            Some(&HeaderValue::from("us"))
        );
        assert_eq!(delivery.body, Bytes::from_static(br#"{"id":1}"#));
        assert_eq!(publishes(&broker), 1);
    }

    #[tokio::test]
    async fn test_untagged_publish() {
        let (broker, exchange) = setup().await;
        EventPublisher::new()
            .publish_untagged(&exchange, json!({"ping": true}))
            .await
            .unwrap();
        assert_eq!(publishes(&broker), 1);
    }

    #[tokio::test]
    async fn test_stale_handle_is_rejected() {
        let (broker, exchange) = setup().await;
        broker.sever_all("network down");

        let error = EventPublisher::new()
            .publish_untagged(&exchange, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(error, BusError::Connection(_)));
        assert_eq!(publishes(&broker), 0);
    }
}
