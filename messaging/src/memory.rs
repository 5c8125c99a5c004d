//! In-memory broker for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::transport::{Acknowledger, Delivery, DeliveryStream, Session, Transport};

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Ack,
    Nack,
    /// Never answer.
    Stall,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Ack(Message),
    Nack { message: Message, requeue: bool },
}

struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

#[derive(Default)]
struct BrokerState {
    published: Mutex<Vec<(String, Message)>>,
    bindings: Mutex<HashMap<String, Vec<String>>>,
    queues: Mutex<HashMap<String, Queue>>,
    outcomes: Mutex<Vec<AckOutcome>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
    confirm_mode: Mutex<Option<ConfirmMode>>,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
    publish_calls: AtomicUsize,
}

impl BrokerState {
    fn route(&self, message: &Message) {
        let queues = self
            .bindings
            .lock()
            .get(&message.routing_key)
            .cloned()
            .unwrap_or_default();
        for queue in queues {
            self.enqueue(&queue, message.clone());
        }
    }

    fn enqueue(&self, queue: &str, message: Message) {
        if let Some(q) = self.queues.lock().get(queue) {
            let _ = q.sender.send(message);
        }
    }

    fn receiver(&self, queue: &str) -> Option<Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>> {
        self.queues.lock().get(queue).map(|q| Arc::clone(&q.receiver))
    }
}

/// In-memory stand-in for an AMQP broker.
///
/// Routing is by exact routing key. Nacked messages with requeue go back
/// to the end of their queue.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `queue` and bind it to `routing_key`.
    pub fn bind(&self, routing_key: impl Into<String>, queue: impl Into<String>) -> &Self {
        let queue = queue.into();
        self.declare_queue(&queue);
        self.state
            .bindings
            .lock()
            .entry(routing_key.into())
            .or_default()
            .push(queue);
        self
    }

    pub fn declare_queue(&self, queue: &str) {
        let mut queues = self.state.queues.lock();
        queues.entry(queue.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            Queue {
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            }
        });
    }

    /// Put a message straight onto a queue.
    pub fn enqueue(&self, queue: &str, message: Message) {
        self.state.enqueue(queue, message);
    }

    /// Delete a queue; its consumers see the stream end once drained.
    pub fn close_queue(&self, queue: &str) {
        self.state.queues.lock().remove(queue);
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *self.state.confirm_mode.lock() = Some(mode);
    }

    /// Close every open session as if the broker went away.
    pub fn drop_connections(&self, reason: &str) {
        let sessions: Vec<Arc<MemorySession>> = self.state.sessions.lock().drain(..).collect();
        for session in sessions {
            session.open.store(false, Ordering::SeqCst);
            session.closed_tx.send_replace(Some(reason.to_string()));
        }
    }

    /// Sessions connected and not yet closed by their owner.
    pub fn open_sessions(&self) -> usize {
        self.state.sessions.lock().len()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.state.publish_calls.load(Ordering::SeqCst)
    }

    /// Messages accepted by the broker, with their exchange.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.state.published.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<AckOutcome> {
        self.state.outcomes.lock().clone()
    }

    pub fn acked(&self) -> usize {
        self.outcomes()
            .iter()
            .filter(|o| matches!(o, AckOutcome::Ack(_)))
            .count()
    }

    pub fn requeued(&self) -> usize {
        self.outcomes()
            .iter()
            .filter(|o| matches!(o, AckOutcome::Nack { requeue: true, .. }))
            .count()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, _config: &MessagingConfig) -> MessagingResult<Arc<dyn Session>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(MessagingError::Connection("connection refused".to_string()));
        }

        let (closed_tx, _) = watch::channel(None);
        let session = Arc::new(MemorySession {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            closed_tx,
        });
        self.state.sessions.lock().push(Arc::clone(&session));
        Ok(session as Arc<dyn Session>)
    }
}

struct MemorySession {
    state: Arc<BrokerState>,
    open: AtomicBool,
    closed_tx: watch::Sender<Option<String>>,
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, exchange: &str, message: &Message, confirm: bool) -> MessagingResult<()> {
        self.state.publish_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_open() {
            return Err(MessagingError::Publish("channel closed".to_string()));
        }

        let mode = (*self.state.confirm_mode.lock()).unwrap_or(ConfirmMode::Ack);
        if confirm {
            match mode {
                ConfirmMode::Ack => {}
                ConfirmMode::Nack => return Err(MessagingError::NotConfirmed),
                ConfirmMode::Stall => futures::future::pending::<()>().await,
            }
        }

        self.state
            .published
            .lock()
            .push((exchange.to_string(), message.clone()));
        self.state.route(message);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> MessagingResult<DeliveryStream> {
        let receiver = self
            .state
            .receiver(queue)
            .ok_or_else(|| MessagingError::Consume(format!("no queue '{}'", queue)))?;
        let state = Arc::clone(&self.state);
        let queue = queue.to_string();

        let deliveries = stream::unfold(receiver, |receiver| async move {
            let next = receiver.lock().await.recv().await;
            next.map(|message| (message, receiver))
        })
        .map(move |message| {
            Ok(Delivery {
                acker: Box::new(MemoryAcker {
                    state: Arc::clone(&state),
                    queue: queue.clone(),
                    message: message.clone(),
                    settled: AtomicBool::new(false),
                }),
                message,
            })
        });

        Ok(deliveries.boxed())
    }

    fn closed(&self) -> watch::Receiver<Option<String>> {
        self.closed_tx.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> MessagingResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let me = self as *const MemorySession;
        self.state
            .sessions
            .lock()
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), me));
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    message: Message,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> MessagingResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::Ack("delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> MessagingResult<()> {
        self.settle()?;
        self.state
            .outcomes
            .lock()
            .push(AckOutcome::Ack(self.message.clone()));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> MessagingResult<()> {
        self.settle()?;
        self.state.outcomes.lock().push(AckOutcome::Nack {
            message: self.message.clone(),
            requeue,
        });
        if requeue {
            self.state.enqueue(&self.queue, self.message.clone());
        }
        Ok(())
    }
}
