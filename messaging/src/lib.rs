//! SwapRail Messaging Library
//!
//! Publishes and consumes persistent messages over an AMQP broker, with
//! publisher confirms, bounded handler execution and automatic reconnection.

pub mod amqp;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use amqp::AmqpTransport;
pub use config::MessagingConfig;
pub use connection::{BrokerConnection, ConnectionState, ConsumerStats, Publisher};
pub use error::{MessagingError, MessagingResult};
pub use handler::{FnHandler, HandlerError, LoggingHandler, MessageHandler};
pub use message::{Message, MessageBuilder};
pub use transport::{Acknowledger, Delivery, DeliveryStream, Session, Transport};

#[cfg(any(test, feature = "test-utils"))]
pub use memory::{AckOutcome, ConfirmMode, MemoryBroker};
