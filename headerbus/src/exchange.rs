//! Headers exchange resolution and unroutable-message forwarding

use std::fmt;
use std::sync::Arc;

use broker_client::{Connection, ExchangeKind, ReturnedMessage};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ExchangeConfig, MessageOptions};
use crate::connection::ConnectionManager;
use crate::error::{ConnectionError, UnroutableMessage};

/// Handler for mandatory messages the broker could not route.
pub type UnroutableHandler = Arc<dyn Fn(&UnroutableMessage) + Send + Sync>;

/// The headers exchange all events are published through.
///
/// Cloning yields another handle sharing the same unroutable handler.
#[derive(Clone)]
pub struct ExchangeRouter {
    config: ExchangeConfig,
    handler: Arc<RwLock<Option<UnroutableHandler>>>,
}

impl ExchangeRouter {
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            handler: Arc::new(RwLock::new(None)),
        }
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.config.exchange_name
    }

    /// Set the handler for unroutable messages. It may be replaced at any time,
    /// including after resolution.
    pub fn on_unroutable<F>(&self, handler: F)
    where
        F: Fn(&UnroutableMessage) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Remove the unroutable handler; returned messages are then logged.
    pub fn clear_unroutable_handler(&self) {
        *self.handler.write() = None;
    }

    /// Declare the exchange on the live connection and return a handle to it.
    ///
    /// The handle is valid until the connection it was resolved on goes away.
    pub async fn resolve(
        &self,
        connections: &ConnectionManager,
    ) -> Result<ExchangeHandle, ConnectionError> {
        let connection = connections.connection()?;
        let generation = connections.generation();

        connection
            .declare_exchange(self.name(), ExchangeKind::Headers, true)
            .await?;

        if let Some(returns) = connection.take_returns() {
            tokio::spawn(forward_returns(returns, Arc::clone(&self.handler)));
        }

        debug!(
            exchange = %self.name(),
            connection = %connection.id(),
            generation,
            "Resolved exchange"
        );

        Ok(ExchangeHandle {
            name: self.name().to_string(),
            generation,
            connection,
            connections: connections.clone(),
        })
    }
}

impl fmt::Debug for ExchangeRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeRouter")
            .field("name", &self.config.exchange_name)
            .field("has_handler", &self.handler.read().is_some())
            .finish()
    }
}

async fn forward_returns(
    mut returns: mpsc::UnboundedReceiver<ReturnedMessage>,
    handler: Arc<RwLock<Option<UnroutableHandler>>>,
) {
    while let Some(returned) = returns.recv().await {
        let message = UnroutableMessage {
            reply_code: returned.reply_code,
            reply_text: returned.reply_text,
            exchange: returned.exchange,
            routing_key: returned.routing_key.clone(),
            options: MessageOptions::from_properties(&returned.routing_key, &returned.properties),
            headers: returned.properties.headers,
            body: returned.body,
        };

        let current = handler.read().clone();
        match current {
            Some(handler) => handler(&message),
            None => warn!(
                exchange = %message.exchange,
                reply_code = message.reply_code,
                "Unroutable message returned: {}",
                message.reply_text
            ),
        }
    }
}

/// A resolved exchange, tied to the connection generation it was resolved on.
#[derive(Clone)]
pub struct ExchangeHandle {
    name: String,
    generation: u64,
    connection: Arc<dyn Connection>,
    connections: ConnectionManager,
}

impl ExchangeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection generation the handle was resolved on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the handle can still be used.
    pub fn is_valid(&self) -> bool {
        self.ensure_valid().is_ok()
    }

    pub(crate) fn ensure_valid(&self) -> Result<(), ConnectionError> {
        let current = self.connections.generation();
        if current != self.generation {
            return Err(ConnectionError::StaleExchange {
                handle: self.generation,
                current,
            });
        }
        if !self.connections.connected() || !self.connection.is_open() {
            return Err(ConnectionError::NotConnected {
                state: self.connections.state(),
            });
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }
}

impl fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("connection", &self.connection.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionState;
    use broker_client::{InMemoryBroker, PublishOptions};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn setup() -> (InMemoryBroker, ConnectionManager, ExchangeRouter) {
        let broker = InMemoryBroker::new();
        let connections = ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::new());
        let router = ExchangeRouter::new(ExchangeConfig::new().with_name("test.headers"));
        (broker, connections, router)
    }

    #[tokio::test]
    async fn test_resolve_requires_connection() {
        let (_broker, connections, router) = setup();

        let error = router.resolve(&connections).await.unwrap_err();
        assert_eq!(
            error,
            ConnectionError::NotConnected {
                state: ConnectionState::Disconnected
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_declares_headers_exchange() {
        let (broker, connections, router) = setup();
        connections.connect().await.unwrap();

        let handle = router.resolve(&connections).await.unwrap();
        assert_eq!(handle.name(), "test.headers");
        assert_eq!(handle.generation(), 1);
        assert!(handle.is_valid());
        assert_eq!(broker.exchange_kind("test.headers"), Some(ExchangeKind::Headers));
    }

    #[tokio::test]
    async fn test_handle_goes_stale_after_reconnect() {
        let (broker, connections, router) = setup();
        connections.connect().await.unwrap();
        let handle = router.resolve(&connections).await.unwrap();

        broker.sever_all("network down");
        connections.connect().await.unwrap();

        assert_eq!(
            handle.ensure_valid(),
            Err(ConnectionError::StaleExchange {
                handle: 1,
                current: 2
            })
        );
        let fresh = router.resolve(&connections).await.unwrap();
        assert!(fresh.is_valid());
    }

    #[tokio::test]
    async fn test_returned_messages_reach_handler() {
        let (_broker, connections, router) = setup();
        let returned = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&returned);
        router.on_unroutable(move |message| sink.lock().push(message.clone()));

        connections.connect().await.unwrap();
        let handle = router.resolve(&connections).await.unwrap();

        handle
            .connection()
            .publish(
                handle.name(),
                "",
                PublishOptions { mandatory: true },
                MessageOptions::new().to_properties(),
                Bytes::from_static(br#"{"id":9}"#),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while returned.lock().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let messages = returned.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].reply_code, 312);
        assert_eq!(messages[0].body, Bytes::from_static(br#"{"id":9}"#));
    }
}
