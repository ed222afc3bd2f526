//! Broker connection lifecycle
//!
//! [`ConnectionManager`] owns the single broker connection of a bus. It makes
//! `connect` idempotent, serializes connect and close, reports failures and
//! asynchronous losses to registered handlers, and counts connection
//! generations so that exchange handles from an earlier connection can be
//! recognised as stale.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --close--> Closing --> Disconnected
//!                               |                  |
//!                               +--err--> Disconnected <--lost--+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use broker_client::{Broker, BrokerError, CloseReason, Connection, ConnectionId, LinkState};
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{BusError, ConnectionError};

/// State of the bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        write!(f, "{name}")
    }
}

/// Handler for failed connection attempts and failed provisioning runs.
pub type ConnectionFailedHandler = Arc<dyn Fn(&BusError) + Send + Sync>;

/// Handler for connections that drop without being closed.
pub type ConnectionLostHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Owner of the bus's broker connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    /// Serializes connect, close and loss handling
    lifecycle: Mutex<Lifecycle>,
    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<Arc<dyn Connection>>>,
    generation: AtomicU64,
    failed_handler: RwLock<Option<ConnectionFailedHandler>>,
    lost_handler: RwLock<Option<ConnectionLostHandler>>,
}

#[derive(Default)]
struct Lifecycle {
    monitor: Option<JoinHandle<()>>,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

impl ConnectionManager {
    /// Create a manager for connections to `broker`. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                broker,
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                state,
                current: RwLock::new(None),
                generation: AtomicU64::new(0),
                failed_handler: RwLock::new(None),
                lost_handler: RwLock::new(None),
            }),
        }
    }

    /// The connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the bus is connected. Has no side effects.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of connections established so far. Exchange handles record the
    /// generation they were resolved on.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Register the handler for connection failures, replacing any previous one.
    pub fn on_connection_failed<F>(&self, handler: F)
    where
        F: Fn(&BusError) + Send + Sync + 'static,
    {
        *self.shared.failed_handler.write() = Some(Arc::new(handler));
    }

    /// Register the handler for connection losses, replacing any previous one.
    pub fn on_connection_lost<F>(&self, handler: F)
    where
        F: Fn(&ConnectionError) + Send + Sync + 'static,
    {
        *self.shared.lost_handler.write() = Some(Arc::new(handler));
    }

    /// Remove both handlers. Failures and losses are then logged at error level.
    pub fn clear_handlers(&self) {
        *self.shared.failed_handler.write() = None;
        *self.shared.lost_handler.write() = None;
    }

    /// Connect to the broker, or return the live connection if already connected.
    ///
    /// A failed attempt is returned to the caller and reported to the
    /// connection-failed handler.
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, BusError> {
        self.shared.config.validate()?;

        self.establish().await.map_err(|error| {
            let error = BusError::from(error);
            self.report_failure(&error);
            error
        })
    }

    /// The live connection.
    pub fn connection(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        let current = self.shared.current.read();
        match current.as_ref() {
            Some(connection) if self.connected() && connection.is_open() => {
                Ok(Arc::clone(connection))
            }
            _ => Err(ConnectionError::NotConnected {
                state: self.state(),
            }),
        }
    }

    /// Close the connection.
    ///
    /// Completes after the broker has released the connection. Calling this
    /// when not connected is an error.
    pub async fn close(&self) -> Result<(), BusError> {
        Ok(self.shutdown().await?)
    }

    /// Connect without reporting failures to the handler.
    pub(crate) async fn establish(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;

        if let Some(connection) = self.take_current_if_closed() {
            self.settle_closed(&connection);
        }
        let existing = self.shared.current.read().clone();
        if let Some(connection) = existing {
            debug!("Already connected; reusing {}", connection.id());
            return Ok(connection);
        }

        self.set_state(ConnectionState::Connecting);
        let params = self.shared.config.connect_params();
        let attempt = tokio::time::timeout(params.timeout, self.shared.broker.connect(&params)).await;

        let connection = match attempt {
            Ok(Ok(connection)) => connection,
            Ok(Err(BrokerError::ConnectionRefused { host, reason })) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Refused { host, reason });
            }
            Ok(Err(other)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Broker(other));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Timeout {
                    host: params.host,
                    timeout: params.timeout,
                });
            }
        };

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.current.write() = Some(Arc::clone(&connection));
        if let Some(previous) = lifecycle.monitor.replace(self.spawn_monitor(&connection)) {
            previous.abort();
        }
        self.set_state(ConnectionState::Connected);

        info!(
            host = %params.host,
            connection = %connection.id(),
            generation,
            "Connected to broker"
        );
        Ok(connection)
    }

    /// Close without reporting to handlers.
    pub(crate) async fn shutdown(&self) -> Result<(), ConnectionError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;

        if let Some(connection) = self.take_current_if_closed() {
            self.settle_closed(&connection);
        }
        let existing = self.shared.current.read().clone();
        let connection = match existing {
            Some(connection) if self.connected() => connection,
            _ => {
                return Err(ConnectionError::NotConnected {
                    state: self.state(),
                })
            }
        };

        self.set_state(ConnectionState::Closing);
        // Detach first so the monitor does not mistake the close for a loss
        self.shared.current.write().take();
        if let Some(monitor) = lifecycle.monitor.take() {
            monitor.abort();
        }

        let result = connection.close().await;
        self.set_state(ConnectionState::Disconnected);

        match result {
            Ok(()) => {
                info!(connection = %connection.id(), "Closed broker connection");
                Ok(())
            }
            // Dropped between the check above and the close; it is released either way
            Err(BrokerError::ConnectionClosed) => {
                debug!(connection = %connection.id(), "Connection already closed by broker");
                Ok(())
            }
            Err(other) => Err(ConnectionError::Broker(other)),
        }
    }

    /// Report a failure to the connection-failed handler, or log it.
    pub(crate) fn report_failure(&self, error: &BusError) {
        let handler = self.shared.failed_handler.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!("Broker connection failed: {}", error),
        }
    }

    fn report_loss(&self, error: &ConnectionError) {
        let handler = self.shared.lost_handler.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!("Broker connection lost: {}", error),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// Detach the current connection if its link has already closed.
    fn take_current_if_closed(&self) -> Option<Arc<dyn Connection>> {
        let mut current = self.shared.current.write();
        let closed = current
            .as_ref()
            .is_some_and(|connection| !connection.is_open());
        if closed {
            current.take()
        } else {
            None
        }
    }

    /// Finish the bookkeeping for a connection whose link closed on its own.
    fn settle_closed(&self, connection: &Arc<dyn Connection>) {
        self.set_state(ConnectionState::Disconnected);
        let link = connection.state().borrow().clone();
        match link {
            LinkState::Closed(CloseReason::Lost(reason)) => {
                warn!(connection = %connection.id(), reason = %reason, "Broker connection lost");
                self.report_loss(&ConnectionError::Lost(reason));
            }
            LinkState::Closed(CloseReason::Requested) | LinkState::Open => {
                debug!(connection = %connection.id(), "Connection closed outside the manager");
            }
        }
    }

    async fn handle_link_closed(&self, id: ConnectionId) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let is_current = self
            .shared
            .current
            .read()
            .as_ref()
            .is_some_and(|connection| connection.id() == id);
        if !is_current {
            return;
        }
        if let Some(connection) = self.take_current_if_closed() {
            self.settle_closed(&connection);
        }
    }

    fn spawn_monitor(&self, connection: &Arc<dyn Connection>) -> JoinHandle<()> {
        let manager: Weak<Shared> = Arc::downgrade(&self.shared);
        let id = connection.id();
        let mut link = connection.state();

        tokio::spawn(async move {
            loop {
                let open = link.borrow_and_update().is_open();
                if !open {
                    break;
                }
                if link.changed().await.is_err() {
                    // Connection dropped without reporting a state change
                    return;
                }
            }

            if let Some(shared) = manager.upgrade() {
                ConnectionManager { shared }.handle_link_closed(id).await;
            }
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("host", &self.shared.config.broker_host)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig::new().with_timeout(Duration::from_millis(200)),
        )
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
        let mut states = manager.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), states.wait_for(|s| *s == state))
            .await
            .expect("state change timed out")
            .expect("state channel closed");
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(manager.generation(), 1);
        assert!(manager.connected());
    }

    #[tokio::test]
    async fn test_concurrent_connects_open_one_connection() {
        let broker = InMemoryBroker::new();
        broker.set_connect_latency(Duration::from_millis(20));
        let manager = manager(&broker);

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert_eq!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_refusal_is_reported_and_returned() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections("maintenance");
        let manager = manager(&broker);

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reported);
        manager.on_connection_failed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let error = manager.connect().await.err().unwrap();
        assert!(matches!(
            error,
            BusError::Connection(ConnectionError::Refused { .. })
        ));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_timeout() {
        let broker = InMemoryBroker::new();
        broker.set_connect_latency(Duration::from_secs(5));
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig::new().with_timeout(Duration::from_millis(20)),
        );

        let error = manager.connect().await.err().unwrap();
        assert_eq!(
            error,
            BusError::Connection(ConnectionError::Timeout {
                host: "localhost".to_string(),
                timeout: Duration::from_millis(20),
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_broker() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig::new().with_host(""),
        );

        let error = manager.connect().await.err().unwrap();
        assert!(matches!(error, BusError::Configuration(_)));
        assert!(broker.operations().is_empty());
    }

    #[tokio::test]
    async fn test_close_when_not_connected_is_an_error() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let error = manager.close().await.unwrap_err();
        assert_eq!(
            error,
            BusError::Connection(ConnectionError::NotConnected {
                state: ConnectionState::Disconnected
            })
        );
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lost);
        manager.on_connection_lost(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_connections(), 0);
        assert!(manager.connection().is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lost.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loss_is_reported_once() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let lost = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&lost);
        manager.on_connection_lost(move |error| sink.lock().push(error.clone()));

        manager.connect().await.unwrap();
        broker.sever_all("network down");
        wait_for(&manager, ConnectionState::Disconnected).await;

        // A reconnect must not report the same loss again
        manager.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *lost.lock(),
            vec![ConnectionError::Lost("network down".to_string())]
        );
        assert_eq!(manager.generation(), 2);
        assert_eq!(broker.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_connect_after_unobserved_loss_reconnects() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lost);
        manager.on_connection_lost(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let first = manager.connect().await.unwrap();
        broker.sever_all("blip");
        // Reconnect immediately, racing the monitor
        let second = manager.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_ne!(first.id(), second.id());
        assert!(second.is_open());
        assert!(manager.connected());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }
}
