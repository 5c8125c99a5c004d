//! AMQP 0-9-1 transport backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::transport::{Acknowledger, Delivery, DeliveryStream, Session, Transport};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Transport for RabbitMQ and other AMQP 0-9-1 brokers.
///
/// Exchanges and queues are expected to be provisioned outside the service.
#[derive(Debug, Default, Clone)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &MessagingConfig) -> MessagingResult<Arc<dyn Session>> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        let channel = match open_channel(&connection, config.prefetch_count).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(200, "setup failed").await {
                    debug!(error = %close_err, "Error closing half-open connection");
                }
                return Err(e);
            }
        };

        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            closed_tx.send_replace(Some(err.to_string()));
        });

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            closed: closed_rx,
        }))
    }
}

async fn open_channel(connection: &Connection, prefetch_count: u16) -> MessagingResult<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| MessagingError::Connection(format!("failed to open channel: {}", e)))?;

    channel
        .basic_qos(prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| MessagingError::Connection(format!("failed to set QoS: {}", e)))?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| {
            MessagingError::Connection(format!("failed to enable publisher confirms: {}", e))
        })?;

    Ok(channel)
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: watch::Receiver<Option<String>>,
}

#[async_trait]
impl Session for AmqpSession {
    async fn publish(&self, exchange: &str, message: &Message, confirm: bool) -> MessagingResult<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_message_id(message.request_id.clone().into())
            .with_content_type("application/json".into())
            .with_timestamp(message.timestamp.timestamp().max(0) as u64);

        let pending = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if !confirm {
            return Ok(());
        }

        match pending
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?
        {
            Confirmation::Ack(_) => Ok(()),
            Confirmation::Nack(_) | Confirmation::NotRequested => Err(MessagingError::NotConfirmed),
        }
    }

    async fn consume(&self, queue: &str) -> MessagingResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Consume(format!("queue {}: {}", queue, e)))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(into_delivery)
                .map_err(|e| MessagingError::Consume(e.to_string()))
        });

        Ok(deliveries.boxed())
    }

    fn closed(&self) -> watch::Receiver<Option<String>> {
        self.closed.clone()
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> MessagingResult<()> {
        if let Err(e) = self.channel.close(200, "Bye").await {
            debug!(error = %e, "Error closing channel");
        }
        self.connection
            .close(200, "Bye")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let request_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();
    let timestamp = (*delivery.properties.timestamp())
        .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
        .unwrap_or_else(Utc::now);
    let routing_key = delivery.routing_key.as_str().to_string();

    Delivery {
        message: Message {
            body: delivery.data,
            routing_key,
            request_id,
            timestamp,
        },
        acker: Box::new(AmqpAcker(delivery.acker)),
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }
}
