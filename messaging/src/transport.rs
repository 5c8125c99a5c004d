//! Broker transport seam.
//!
//! [`BrokerConnection`](crate::BrokerConnection) drives reconnection, timeouts
//! and ack/nack policy on top of these traits; a transport only has to move
//! bytes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use crate::config::MessagingConfig;
use crate::error::MessagingResult;
use crate::message::Message;

/// Opens sessions to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, open a channel and apply QoS.
    async fn connect(&self, config: &MessagingConfig) -> MessagingResult<Arc<dyn Session>>;
}

/// An open connection plus channel.
#[async_trait]
pub trait Session: Send + Sync {
    /// Publish a persistent message to `exchange`.
    ///
    /// With `confirm` set, resolves only once the broker acknowledged it.
    async fn publish(&self, exchange: &str, message: &Message, confirm: bool) -> MessagingResult<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> MessagingResult<DeliveryStream>;

    /// Becomes `Some(reason)` when the broker closes the session.
    fn closed(&self) -> watch::Receiver<Option<String>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> MessagingResult<()>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> MessagingResult<()>;

    async fn nack(&self, requeue: bool) -> MessagingResult<()>;
}

/// A consumed message awaiting ack or nack.
pub struct Delivery {
    pub message: Message,
    pub acker: Box<dyn Acknowledger>,
}

/// Stream of deliveries from one queue.
pub type DeliveryStream = BoxStream<'static, MessagingResult<Delivery>>;
