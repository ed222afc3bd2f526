//! Error types for the headerbus crate.

use std::time::Duration;

use broker_client::{BrokerError, FieldTable};
use bytes::Bytes;

use crate::config::MessageOptions;
use crate::connection::ConnectionState;
use crate::provisioner::ProvisionStage;

/// A precondition of the call was violated. Raised before any broker interaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// Destructive provisioning was attempted without the administrative opt-in
    #[error("Queue provisioning is disabled; set {variable}=true to allow it")]
    ProvisioningNotAuthorized {
        /// The environment variable that grants authorization
        variable: &'static str,
    },

    /// An event carried some, but not all, of the routing headers
    #[error("Incomplete routing headers: missing {}", .missing.join(", "))]
    IncompleteRoutingHeaders {
        /// Header names that were absent
        missing: Vec<&'static str>,
    },

    /// Message options carried a header name reserved for routing
    #[error("Header '{0}' is reserved for routing; set it through the event's routing headers")]
    ReservedHeader(String),

    /// A message timestamp has no wire form
    #[error("Message timestamp is before the Unix epoch ({seconds}s)")]
    TimestampBeforeEpoch {
        /// Seconds relative to the epoch
        seconds: i64,
    },

    /// Provisioning was asked to bind a queue with no bindings
    #[error("No bindings supplied for queue '{0}'")]
    EmptyBindings(String),

    /// No event bus has been installed as the process-wide instance
    #[error("No event bus installed")]
    NotInstalled,

    /// A configuration value is invalid
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures establishing or using the broker connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The broker did not accept the connection within the configured timeout
    #[error("Timed out connecting to {host} after {timeout:?}")]
    Timeout {
        /// Broker host
        host: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The broker refused the connection
    #[error("Broker at {host} refused the connection: {reason}")]
    Refused {
        /// Broker host
        host: String,
        /// Reason given by the broker
        reason: String,
    },

    /// The connection dropped without being closed
    #[error("Connection lost: {0}")]
    Lost(String),

    /// The operation requires a connected bus
    #[error("Not connected (state: {state})")]
    NotConnected {
        /// State of the connection when the operation was attempted
        state: ConnectionState,
    },

    /// An exchange handle was used after the connection it was resolved on went away
    #[error("Exchange handle is stale (resolved on generation {handle}, current generation {current})")]
    StaleExchange {
        /// Generation the handle was resolved on
        handle: u64,
        /// Current connection generation
        current: u64,
    },

    /// A broker operation failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// A step of queue provisioning failed. The sequence was aborted at `stage`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Provisioning queue '{queue}' failed at {stage}: {source}")]
pub struct ProvisioningError {
    /// Queue being provisioned
    pub queue: String,
    /// Stage that failed
    pub stage: ProvisionStage,
    /// Underlying failure
    pub source: ConnectionError,
}

/// A mandatory message the broker could not route to any queue.
///
/// This is delivered to the exchange's unroutable handler and never returned
/// as an `Err`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Message returned by exchange '{exchange}': {reply_code} {reply_text}")]
pub struct UnroutableMessage {
    /// Broker reply code (312 for NO_ROUTE)
    pub reply_code: u16,
    /// Broker reply text
    pub reply_text: String,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// All headers the message carried
    pub headers: FieldTable,
    /// Message options as published
    pub options: MessageOptions,
    /// The original body, unaltered
    pub body: Bytes,
}

impl UnroutableMessage {
    /// Decode the returned body as JSON.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

/// Top-level error for event bus operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    /// The event payload could not be serialized or decoded
    #[error("Payload serialization failed: {0}")]
    Serialization(String),

    /// The background worker driving a blocking bus has stopped
    #[error("Event bus worker has stopped")]
    WorkerStopped,
}

impl From<BrokerError> for BusError {
    fn from(error: BrokerError) -> Self {
        BusError::Connection(ConnectionError::Broker(error))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(error: serde_json::Error) -> Self {
        BusError::Serialization(error.to_string())
    }
}

/// Convenience type alias for Results using BusError.
pub type Result<T> = std::result::Result<T, BusError>;
