//! Broker client seam for the headerbus event bus.
//!
//! This crate declares the asynchronous primitives the event bus needs from a
//! message broker (connect, declare, delete, bind, publish, consume, close).
//!
//! Two backends implement them:
//!
//! - `AmqpBroker` (feature `amqp`) talks AMQP 0-9-1 to a real broker such as
//!   RabbitMQ through `lapin`.
//! - [`InMemoryBroker`] is an in-process test double that implements
//!   headers-exchange routing with the same observable behaviour, plus
//!   controls for driving failure paths.
//!
//! # Overview
//!
//! - [`Broker`]: opens connections.
//! - [`Connection`]: a single live link with topology and messaging operations.
//!   Its [`LinkState`] is observable through a `watch` channel so that owners can
//!   detect asynchronous loss.
//! - [`Consumer`]: a stream of [`Delivery`] values for one queue.
//! - [`ReturnedMessage`]: a mandatory message the broker could not route.
//!
//! Anything that can express these primitives can back the event bus.
//!
//! # Example
//!
//! ```no_run
//! use broker_client::{field_table, Broker, ConnectParams, ExchangeKind, InMemoryBroker, QueueDeclareOptions};
//! use std::time::Duration;
//!
//! # async fn run() -> broker_client::Result<()> {
//! let broker = InMemoryBroker::new();
//! let connection = broker
//!     .connect(&ConnectParams::new("localhost", Duration::from_secs(2)))
//!     .await?;
//!
//! connection.declare_exchange("events", ExchangeKind::Headers, true).await?;
//! let queue = connection.declare_queue("orders", QueueDeclareOptions::default()).await?;
//! connection
//!     .bind_queue(&queue.name, "events", field_table([("region", "us")]))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Private Workspace Crate
//!
//! This crate is intended for internal use within the workspace.

#[cfg(feature = "amqp")]
mod amqp;
mod client;
mod error;
pub mod matching;
mod memory;
mod types;

#[cfg(feature = "amqp")]
pub use amqp::{
    amqp_uri, from_amqp_properties, from_amqp_table, to_amqp_properties, to_amqp_table,
    AmqpBroker, DEFAULT_AMQP_PORT,
};
pub use client::{Broker, Connection, Consumer};
pub use error::{BrokerError, Result};
pub use matching::headers_match;
pub use memory::{BrokerOperation, InMemoryBroker};
pub use types::*;
