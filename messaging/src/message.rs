//! Broker message and builder.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MessagingResult;

/// A message published to or delivered from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Vec<u8>,
    /// Required for publishing.
    pub routing_key: String,
    /// Correlation id, carried as the AMQP message id.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Decode a JSON body.
    pub fn decode<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Fluent builder for [`Message`].
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            message: Message {
                body: Vec::new(),
                routing_key: String::new(),
                request_id: String::new(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.message.body = body.into();
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json_body<T: Serialize>(mut self, value: &T) -> MessagingResult<Self> {
        self.message.body = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.message.routing_key = routing_key.into();
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.message.request_id = request_id.into();
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
