//! Reconnecting broker connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::transport::{Delivery, DeliveryStream, Session, Transport};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; either never connected or gave up reconnecting.
    Disconnected,
    /// Connecting to the broker.
    Connecting,
    /// Connected and operational.
    Connected,
    /// Explicitly closed. Final.
    Closed,
}

/// Publishes messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: Message) -> MessagingResult<()>;

    async fn publish_with_confirm(&self, message: Message) -> MessagingResult<()>;
}

/// Delivery counters for consumers started from a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
}

struct Inner {
    config: MessagingConfig,
    transport: Arc<dyn Transport>,
    session: RwLock<Option<Arc<dyn Session>>>,
    state: RwLock<ConnectionState>,
    closed: AtomicBool,
    /// Bumped on every new session so that stale watchers exit.
    generation: AtomicU64,
    /// Held while a reconnect is in flight, manual or from the watcher.
    reconnecting: tokio::sync::Mutex<()>,
    acked: AtomicU64,
    requeued: AtomicU64,
}

/// Connection to a message broker.
///
/// Connects eagerly and, once connected, watches for broker-initiated
/// closure, reconnecting with a fixed delay up to `max_reconnects` times.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    /// Connect to the broker, failing fast if it cannot be reached.
    #[instrument(skip_all)]
    pub async fn connect(
        config: MessagingConfig,
        transport: Arc<dyn Transport>,
    ) -> MessagingResult<Self> {
        config.validate().map_err(MessagingError::Configuration)?;

        let inner = Arc::new(Inner {
            config,
            transport,
            session: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnecting: tokio::sync::Mutex::new(()),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        });

        Inner::establish(&inner).await?;

        Ok(Self { inner })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// Get current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.has_open_session()
    }

    /// Drop the current session and connect again.
    #[instrument(skip(self))]
    pub async fn reconnect(&self) -> MessagingResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }

        let _guard = self.inner.reconnecting.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let old = self.inner.session.write().take();
        if let Some(old) = old {
            if let Err(e) = old.close().await {
                debug!(error = %e, "Error closing previous session");
            }
        }

        info!("Manual reconnect requested");
        Inner::establish(&self.inner).await
    }

    /// Close the connection. No reconnect happens afterwards.
    #[instrument(skip(self))]
    pub async fn close(&self) -> MessagingResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Closed);

        let session = self.inner.session.write().take();
        if let Some(session) = session {
            session.close().await?;
        }

        info!("Broker connection closed");
        Ok(())
    }

    /// Consume every configured queue, one task per queue.
    ///
    /// Each delivery is handled under the handler timeout, then acked on
    /// success or nacked with requeue otherwise. Consumers stop when
    /// `shutdown` flips to `true` or their delivery stream ends.
    pub async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> MessagingResult<Vec<JoinHandle<()>>> {
        let queues = &self.inner.config.queues;
        if queues.iter().any(|q| q.trim().is_empty()) {
            return Err(MessagingError::MissingQueueName);
        }

        let session = self.session()?;
        let mut tasks = Vec::with_capacity(queues.len());

        for queue in queues {
            let deliveries = session.consume(queue).await?;
            info!(queue = %queue, "Started consuming");

            let task = consume_queue(
                queue.clone(),
                deliveries,
                Arc::clone(&handler),
                shutdown.clone(),
                Arc::clone(&self.inner),
            );
            tasks.push(tokio::spawn(task));
        }

        Ok(tasks)
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        ConsumerStats {
            acked: self.inner.acked.load(Ordering::Relaxed),
            requeued: self.inner.requeued.load(Ordering::Relaxed),
        }
    }

    fn session(&self) -> MessagingResult<Arc<dyn Session>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        self.inner
            .session
            .read()
            .clone()
            .ok_or(MessagingError::NotConnected)
    }
}

#[async_trait]
impl Publisher for BrokerConnection {
    /// Publish a persistent message. Not retried on failure.
    async fn publish(&self, message: Message) -> MessagingResult<()> {
        if message.routing_key.is_empty() {
            return Err(MessagingError::MissingRoutingKey);
        }

        let session = self.session()?;
        session
            .publish(&self.inner.config.exchange, &message, false)
            .await?;

        debug!(
            routing_key = %message.routing_key,
            request_id = %message.request_id,
            "Published message"
        );
        Ok(())
    }

    /// Publish and wait for the broker's confirmation.
    async fn publish_with_confirm(&self, message: Message) -> MessagingResult<()> {
        if message.routing_key.is_empty() {
            return Err(MessagingError::MissingRoutingKey);
        }

        let session = self.session()?;
        let confirm = session.publish(&self.inner.config.exchange, &message, true);
        tokio::time::timeout(self.inner.config.confirm_timeout, confirm)
            .await
            .map_err(|_| MessagingError::ConfirmTimeout)??;

        debug!(
            routing_key = %message.routing_key,
            request_id = %message.request_id,
            "Published message with confirmation"
        );
        Ok(())
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        // Closed is final.
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    async fn establish(this: &Arc<Self>) -> MessagingResult<()> {
        this.set_state(ConnectionState::Connecting);

        match this.transport.connect(&this.config).await {
            Ok(session) => {
                if this.closed.load(Ordering::SeqCst) {
                    let _ = session.close().await;
                    return Err(MessagingError::Closed);
                }

                let generation = this.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let closed = session.closed();
                let replaced = this.session.write().replace(session);
                this.set_state(ConnectionState::Connected);
                Inner::spawn_watcher(this, generation, closed);

                if let Some(replaced) = replaced {
                    if let Err(e) = replaced.close().await {
                        debug!(error = %e, "Error closing replaced session");
                    }
                }

                info!(exchange = %this.config.exchange, "Connected to broker");
                Ok(())
            }
            Err(e) => {
                this.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn has_open_session(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn spawn_watcher(this: &Arc<Self>, generation: u64, mut closed: watch::Receiver<Option<String>>) {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            let reason = loop {
                if let Some(reason) = closed.borrow_and_update().clone() {
                    break reason;
                }
                if closed.changed().await.is_err() {
                    break "session dropped".to_string();
                }
            };

            {
                let _guard = inner.reconnecting.lock().await;
                if !inner.is_current(generation) {
                    return;
                }

                warn!(reason = %reason, "Broker connection lost, attempting to reconnect");
                *inner.session.write() = None;
                inner.set_state(ConnectionState::Disconnected);
            }
            Inner::reconnect_loop(&inner).await;
        });
    }

    async fn reconnect_loop(this: &Arc<Self>) {
        let max = this.config.max_reconnects;

        for attempt in 1..=max {
            if this.closed.load(Ordering::SeqCst) {
                return;
            }

            let result = {
                let _guard = this.reconnecting.lock().await;
                if this.has_open_session() {
                    debug!("Session restored by another reconnect, watcher exiting");
                    return;
                }
                info!(attempt, max, "Reconnection attempt");
                Inner::establish(this).await
            };

            match result {
                Ok(()) => {
                    info!(attempt, "Reconnected to broker");
                    return;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Reconnection failed");
                    tokio::time::sleep(this.config.reconnect_delay).await;
                }
            }
        }

        error!(max, "Max reconnection attempts reached, giving up");
        this.set_state(ConnectionState::Disconnected);
    }
}

async fn consume_queue(
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
    inner: Arc<Inner>,
) {
    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                match result {
                    Ok(_) => {
                        if *shutdown.borrow() {
                            info!(queue = %queue, "Shutdown signal received, stopping consumer");
                            break;
                        }
                    }
                    Err(_) => {
                        info!(queue = %queue, "Shutdown channel closed, stopping consumer");
                        break;
                    }
                }
            }
            next = deliveries.next() => {
                match next {
                    Some(Ok(delivery)) => {
                        handle_delivery(
                            &queue,
                            delivery,
                            handler.as_ref(),
                            inner.config.handler_timeout,
                            &inner,
                        )
                        .await;
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Delivery stream failed");
                        break;
                    }
                    None => {
                        info!(queue = %queue, "Delivery stream ended");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_delivery(
    queue: &str,
    delivery: Delivery,
    handler: &dyn MessageHandler,
    timeout: Duration,
    inner: &Inner,
) {
    let Delivery { message, acker } = delivery;
    let span = info_span!(
        "message",
        queue = %queue,
        request_id = %message.request_id,
        routing_key = %message.routing_key,
    );

    async move {
        let failure = match tokio::time::timeout(timeout, handler.handle(message)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("handler timed out after {}ms", timeout.as_millis())),
        };

        match failure {
            None => match acker.ack().await {
                Ok(()) => {
                    inner.acked.fetch_add(1, Ordering::Relaxed);
                    debug!("Message acknowledged");
                }
                Err(e) => error!(error = %e, "Error acking message"),
            },
            Some(reason) => {
                error!(error = %reason, "Error processing message, requeueing");
                match acker.nack(true).await {
                    Ok(()) => {
                        inner.requeued.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "Error nacking message"),
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{FnHandler, HandlerError, LoggingHandler};
    use crate::memory::{ConfirmMode, MemoryBroker};
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_ok;

    const ROUTING_KEY: &str = "swaprail.swap";
    const QUEUE: &str = "swaprail.swaps";

    fn test_config() -> MessagingConfig {
        MessagingConfig {
            queues: vec![QUEUE.to_string()],
            reconnect_delay: Duration::from_millis(10),
            max_reconnects: 3,
            handler_timeout: Duration::from_millis(200),
            confirm_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn connect(broker: &MemoryBroker) -> BrokerConnection {
        broker.bind(ROUTING_KEY, QUEUE);
        BrokerConnection::connect(test_config(), Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    fn message(request_id: &str) -> Message {
        Message::builder()
            .routing_key(ROUTING_KEY)
            .request_id(request_id)
            .body("{}")
            .build()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_connect() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.is_connected());
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_fast() {
        let broker = MemoryBroker::new();
        broker.fail_connects(1);

        let result = BrokerConnection::connect(test_config(), Arc::new(broker.clone())).await;

        assert!(matches!(result, Err(MessagingError::Connection(_))));
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_routing_key() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        let message = Message::builder().body("{}").build();
        assert!(matches!(
            conn.publish(message.clone()).await,
            Err(MessagingError::MissingRoutingKey)
        ));
        assert!(matches!(
            conn.publish_with_confirm(message).await,
            Err(MessagingError::MissingRoutingKey)
        ));
        assert_eq!(broker.publish_calls(), 0);
    }

    #[tokio::test]
    async fn test_publish() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        assert_ok!(conn.publish(message("RQ_1")).await);
        assert_ok!(conn.publish_with_confirm(message("RQ_2")).await);

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, conn.config().exchange);
        assert_eq!(published[1].1.request_id, "RQ_2");
    }

    #[tokio::test]
    async fn test_publish_with_confirm_failures() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        broker.set_confirm_mode(ConfirmMode::Nack);
        assert!(matches!(
            conn.publish_with_confirm(message("RQ_1")).await,
            Err(MessagingError::NotConfirmed)
        ));

        broker.set_confirm_mode(ConfirmMode::Stall);
        assert!(matches!(
            conn.publish_with_confirm(message("RQ_2")).await,
            Err(MessagingError::ConfirmTimeout)
        ));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_consume_acks_on_success() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        conn.consume(Arc::new(LoggingHandler), shutdown_rx).await.unwrap();
        conn.publish(message("RQ_1")).await.unwrap();

        wait_for(|| broker.acked() == 1).await;
        assert_eq!(broker.requeued(), 0);
        assert_eq!(conn.consumer_stats().acked, 1);
    }

    #[tokio::test]
    async fn test_consume_requeues_on_error() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handler = FnHandler::new(move |_message: Message| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err::<(), HandlerError>("transient failure".into())
                } else {
                    Ok(())
                }
            }
        });

        conn.consume(Arc::new(handler), shutdown_rx).await.unwrap();
        conn.publish(message("RQ_1")).await.unwrap();

        wait_for(|| broker.acked() == 1).await;
        assert_eq!(broker.requeued(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(conn.consumer_stats(), ConsumerStats { acked: 1, requeued: 1 });
    }

    #[tokio::test]
    async fn test_consume_requeues_on_timeout() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handler = FnHandler::new(move |_message: Message| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<(), HandlerError>(())
            }
        });

        conn.consume(Arc::new(handler), shutdown_rx).await.unwrap();
        conn.publish(message("RQ_1")).await.unwrap();

        wait_for(|| broker.acked() == 1).await;
        assert_eq!(broker.requeued(), 1);
    }

    #[tokio::test]
    async fn test_consume_requires_queue_name() {
        let broker = MemoryBroker::new();
        let config = MessagingConfig {
            queues: vec![String::new()],
            ..test_config()
        };
        let conn = BrokerConnection::connect(config, Arc::new(broker.clone()))
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        assert!(matches!(
            conn.consume(Arc::new(LoggingHandler), shutdown_rx).await,
            Err(MessagingError::MissingQueueName)
        ));
    }

    #[tokio::test]
    async fn test_consumer_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = conn.consume(Arc::new(LoggingHandler), shutdown_rx).await.unwrap();
        shutdown_tx.send(true).unwrap();

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("consumer should stop on shutdown")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_consumer_stops_when_stream_ends() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = conn.consume(Arc::new(LoggingHandler), shutdown_rx).await.unwrap();
        broker.close_queue(QUEUE);

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("consumer should stop when the stream ends")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_broker_close() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        broker.fail_connects(1);
        broker.drop_connections("connection reset");

        wait_for(|| broker.connects() == 3 && conn.is_connected()).await;
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.publish(message("RQ_1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_reconnects() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        broker.fail_connects(100);
        broker.drop_connections("broker gone");

        // One initial connect plus three attempts.
        wait_for(|| broker.connects() == 4).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connects(), 4);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(
            conn.publish(message("RQ_1")).await,
            Err(MessagingError::NotConnected)
        ));

        broker.fail_connects(0);
        conn.reconnect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_manual_reconnect_during_watcher_reconnect_keeps_one_session() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        broker.drop_connections("broker restart");
        let manual = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.reconnect().await })
        };
        assert_ok!(manual.await.unwrap());

        wait_for(|| conn.is_connected()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(conn.is_connected());
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;

        assert_ok!(conn.close().await);
        broker.drop_connections("late close");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(broker.connects(), 1);
        assert!(matches!(
            conn.publish(message("RQ_1")).await,
            Err(MessagingError::Closed)
        ));
        assert!(matches!(conn.reconnect().await, Err(MessagingError::Closed)));
    }
}
