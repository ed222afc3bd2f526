//! Named queue provisioning
//!
//! Provisioning resets a named queue and its bindings from scratch. It is
//! destructive: the queue is deleted along with any messages waiting in it.
//! It only runs when the environment grants administrative authorization
//! (`HEADERBUS_INITIALIZE_NAMED_QUEUE=true`).
//!
//! # Stages
//!
//! 1. Connect (reusing a live connection)
//! 2. Declare the existing queue
//! 3. Delete it
//! 4. Close the connection
//! 5. Reconnect
//! 6. Resolve the exchange on the fresh connection
//! 7. Redeclare the queue with the named-queue defaults
//! 8. Bind every argument set, submitted in list order
//!
//! Binds are submitted without waiting for earlier confirmations, so the broker
//! may confirm them in any order. Provisioning completes when every bind has
//! been confirmed, however they interleave. Any failure aborts the run.

use std::fmt;
use std::sync::Arc;

use broker_client::{Connection, FieldTable, QueueInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::config::{BusEnvironment, QueueOptions, ENV_INITIALIZE_NAMED_QUEUE};
use crate::connection::ConnectionManager;
use crate::error::{BusError, ConfigurationError, ConnectionError, ProvisioningError};
use crate::exchange::ExchangeRouter;

/// A step of the provisioning sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStage {
    Connect,
    DeclareExisting,
    Delete,
    Close,
    Reconnect,
    ResolveExchange,
    Redeclare,
    /// Binding at `index` in the supplied list
    Bind { index: usize },
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStage::Connect => write!(f, "connect"),
            ProvisionStage::DeclareExisting => write!(f, "declare-existing"),
            ProvisionStage::Delete => write!(f, "delete"),
            ProvisionStage::Close => write!(f, "close"),
            ProvisionStage::Reconnect => write!(f, "reconnect"),
            ProvisionStage::ResolveExchange => write!(f, "resolve-exchange"),
            ProvisionStage::Redeclare => write!(f, "redeclare"),
            ProvisionStage::Bind { index } => write!(f, "bind[{index}]"),
        }
    }
}

/// Outcome of a completed provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedQueue {
    /// The redeclared queue
    pub queue: QueueInfo,
    /// Bindings in list order
    pub bindings: Vec<FieldTable>,
    /// List indices in the order the broker confirmed them
    pub confirmation_order: Vec<usize>,
}

/// Runs the destructive queue provisioning sequence.
#[derive(Debug, Clone)]
pub struct QueueProvisioner {
    connections: ConnectionManager,
    router: ExchangeRouter,
    environment: BusEnvironment,
}

impl QueueProvisioner {
    pub fn new(
        connections: ConnectionManager,
        router: ExchangeRouter,
        environment: BusEnvironment,
    ) -> Self {
        Self {
            connections,
            router,
            environment,
        }
    }

    /// Delete and recreate `queue_name`, then apply `bindings` in order.
    ///
    /// Fails with a `ConfigurationError`, before any broker call, when
    /// provisioning is not authorized or `bindings` is empty. A failed stage
    /// is returned as a `ProvisioningError` and reported to the
    /// connection-failed handler.
    pub async fn provision_named_queue(
        &self,
        queue_name: &str,
        bindings: Vec<FieldTable>,
    ) -> Result<ProvisionedQueue, BusError> {
        self.authorize(queue_name, &bindings)?;

        match self.run(queue_name, bindings).await {
            Ok(provisioned) => Ok(provisioned),
            Err(error) => {
                let error = BusError::from(error);
                self.connections.report_failure(&error);
                Err(error)
            }
        }
    }

    fn authorize(&self, queue_name: &str, bindings: &[FieldTable]) -> Result<(), ConfigurationError> {
        if !self.environment.initialize_named_queue {
            warn!(queue = %queue_name, "Refusing to provision queue without authorization");
            return Err(ConfigurationError::ProvisioningNotAuthorized {
                variable: ENV_INITIALIZE_NAMED_QUEUE,
            });
        }
        if queue_name.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "Queue name must not be empty".to_string(),
            ));
        }
        if bindings.is_empty() {
            return Err(ConfigurationError::EmptyBindings(queue_name.to_string()));
        }
        self.connections.config().validate()
    }

    async fn run(
        &self,
        queue_name: &str,
        bindings: Vec<FieldTable>,
    ) -> Result<ProvisionedQueue, ProvisioningError> {
        let fail = |stage: ProvisionStage| {
            move |source: ConnectionError| ProvisioningError {
                queue: queue_name.to_string(),
                stage,
                source,
            }
        };
        let options = QueueOptions::named().to_declare_options();

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::Connect);
        let connection = self
            .connections
            .establish()
            .await
            .map_err(fail(ProvisionStage::Connect))?;

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::DeclareExisting);
        connection
            .declare_queue(queue_name, options)
            .await
            .map_err(|e| fail(ProvisionStage::DeclareExisting)(e.into()))?;

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::Delete);
        let dropped = connection
            .delete_queue(queue_name)
            .await
            .map_err(|e| fail(ProvisionStage::Delete)(e.into()))?;
        info!(queue = %queue_name, dropped, "Deleted old queue");

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::Close);
        drop(connection);
        self.connections
            .shutdown()
            .await
            .map_err(fail(ProvisionStage::Close))?;

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::Reconnect);
        let connection = self
            .connections
            .establish()
            .await
            .map_err(fail(ProvisionStage::Reconnect))?;

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::ResolveExchange);
        let exchange = self
            .router
            .resolve(&self.connections)
            .await
            .map_err(fail(ProvisionStage::ResolveExchange))?;

        debug!(queue = %queue_name, "Provisioning stage {}", ProvisionStage::Redeclare);
        let queue = connection
            .declare_queue(queue_name, options)
            .await
            .map_err(|e| fail(ProvisionStage::Redeclare)(e.into()))?;
        info!(queue = %queue.name, "Created queue");

        let confirmation_order =
            apply_bindings(&connection, &queue.name, exchange.name(), &bindings)
                .await
                .map_err(|(index, source)| fail(ProvisionStage::Bind { index })(source))?;
        info!(queue = %queue.name, bindings = bindings.len(), "Finished adding bindings to queue");

        Ok(ProvisionedQueue {
            queue,
            bindings,
            confirmation_order,
        })
    }
}

/// Submit every bind in list order and wait until all are confirmed.
///
/// Returns list indices in confirmation order, or the index and error of the
/// first bind that failed.
async fn apply_bindings(
    connection: &Arc<dyn Connection>,
    queue: &str,
    exchange: &str,
    bindings: &[FieldTable],
) -> Result<Vec<usize>, (usize, ConnectionError)> {
    let mut pending: FuturesUnordered<_> = bindings
        .iter()
        .enumerate()
        .map(|(index, arguments)| {
            let connection = Arc::clone(connection);
            let arguments = arguments.clone();
            async move {
                debug!(queue = %queue, "Provisioning stage {}", ProvisionStage::Bind { index });
                let result = connection.bind_queue(queue, exchange, arguments).await;
                (index, result)
            }
        })
        .collect();

    let mut confirmed = Vec::with_capacity(bindings.len());
    while let Some((index, result)) = pending.next().await {
        result.map_err(|e| (index, ConnectionError::from(e)))?;
        info!(queue = %queue, binding = ?bindings[index], "Added binding to queue");
        confirmed.push(index);
    }

    debug_assert_eq!(confirmed.len(), bindings.len());
    Ok(confirmed)
}
