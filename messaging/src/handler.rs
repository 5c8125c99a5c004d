//! Handlers for consumed messages.

use async_trait::async_trait;

use crate::message::Message;

/// Error returned by a handler. Any error requeues the message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivered message.
///
/// Returning `Ok` acknowledges the delivery; returning an error (or running
/// past the handler timeout) rejects it with requeue, so handlers must be
/// idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

/// Handler that logs messages and acknowledges them.
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        tracing::info!(
            routing_key = %message.routing_key,
            request_id = %message.request_id,
            bytes = message.body.len(),
            "Message received"
        );
        Ok(())
    }
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self.f)(message).await
    }
}
