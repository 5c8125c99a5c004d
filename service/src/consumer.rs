//! Consumes swap notifications and drives each swap forward.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info_span, Instrument};

use swaprail_common::{Swap, SwapId, SwapRailError};
use swaprail_messaging::{HandlerError, Message, MessageHandler};

use crate::config::SwapRetryConfig;
use crate::swap_service::SwapService;

/// Message handler for swap notifications.
///
/// A message that cannot be decoded is logged and acknowledged, since
/// redelivering it would fail the same way. Any processing error,
/// including a swap the exchange has not finished, requeues the message.
/// In-progress swaps are held for a growing delay first so a pending swap
/// is not polled in a tight loop.
pub struct SwapConsumer {
    swaps: Arc<SwapService>,
    retry: SwapRetryConfig,
    /// Redeliveries so far per in-progress swap.
    attempts: Mutex<HashMap<SwapId, u32>>,
}

impl SwapConsumer {
    pub fn new(swaps: Arc<SwapService>, retry: SwapRetryConfig) -> Self {
        Self {
            swaps,
            retry,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn next_attempt(&self, id: SwapId) -> u32 {
        let mut attempts = self.attempts.lock();
        let attempt = attempts.entry(id).or_insert(0);
        *attempt = attempt.saturating_add(1);
        *attempt
    }
}

#[async_trait]
impl MessageHandler for SwapConsumer {
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let span = info_span!("process_swap", request_id = %message.request_id);

        async move {
            let swap: Swap = match message.decode() {
                Ok(swap) => swap,
                Err(e) => {
                    error!(error = %e, "Dropping undecodable swap message");
                    return Ok(());
                }
            };

            let id = swap.id;
            match self.swaps.process_swap(swap).await {
                Err(SwapRailError::SwapInProgress(_)) => {
                    let attempt = self.next_attempt(id);
                    let delay = self.retry.backoff(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Swap in progress, delaying redelivery"
                    );
                    tokio::time::sleep(delay).await;
                    Err(HandlerError::from(SwapRailError::SwapInProgress(id.to_string())))
                }
                result => {
                    self.attempts.lock().remove(&id);
                    result?;
                    Ok::<(), HandlerError>(())
                }
            }
        }
        .instrument(span)
        .await
    }
}
