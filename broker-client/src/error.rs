//! Error types for broker client operations.

use crate::types::OperationKind;

/// Errors reported by a broker or one of its connections.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker refused the connection attempt
    #[error("Connection refused by {host}: {reason}")]
    ConnectionRefused {
        /// Host the connection was attempted against
        host: String,
        /// Reason given by the broker
        reason: String,
    },

    /// The operation was attempted on a connection that is no longer open
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The named exchange has not been declared
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// The named queue has not been declared
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A redeclaration conflicts with the existing entity
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An exclusive resource is owned by another connection
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// The operation is not permitted on this resource
    #[error("Access refused: {0}")]
    AccessRefused(String),

    /// An acknowledgement referenced an unknown delivery
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// The broker rejected the operation
    #[error("{operation} failed: {reason}")]
    OperationFailed {
        /// The operation that failed
        operation: OperationKind,
        /// Reason given by the broker
        reason: String,
    },
}

/// Convenience type alias for Results using BrokerError.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_display() {
        let error = BrokerError::ConnectionRefused {
            host: "localhost".to_string(),
            reason: "access denied".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Connection refused by localhost: access denied"
        );

        assert_eq!(BrokerError::ConnectionClosed.to_string(), "Connection is closed");

        let error = BrokerError::QueueNotFound("orders".to_string());
        assert_eq!(error.to_string(), "Queue not found: orders");

        let error = BrokerError::OperationFailed {
            operation: OperationKind::Bind,
            reason: "channel error".to_string(),
        };
        assert_eq!(error.to_string(), "queue.bind failed: channel error");

        assert_eq!(
            BrokerError::UnknownDeliveryTag(7).to_string(),
            "Unknown delivery tag: 7"
        );
    }
}
