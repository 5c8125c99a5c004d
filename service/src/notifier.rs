//! Swap hand-off to asynchronous processing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use swaprail_common::{RequestId, Swap, SwapRailError, SwapRailResult};
use swaprail_messaging::{Message, MessagingError, Publisher};

/// Announces swaps that need processing.
#[async_trait]
pub trait SwapNotifier: Send + Sync {
    async fn notify_swap(&self, swap: &Swap) -> SwapRailResult<()>;
}

pub(crate) fn messaging_err(e: MessagingError) -> SwapRailError {
    SwapRailError::Messaging(e.to_string())
}

/// Publishes swaps as persistent JSON messages and waits for the broker's
/// confirmation.
pub struct BrokerNotifier {
    publisher: Arc<dyn Publisher>,
    routing_key: String,
}

impl BrokerNotifier {
    pub fn new(publisher: Arc<dyn Publisher>, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl SwapNotifier for BrokerNotifier {
    #[instrument(skip(self, swap), fields(swap_id = %swap.id))]
    async fn notify_swap(&self, swap: &Swap) -> SwapRailResult<()> {
        let request_id = RequestId::new();
        let message = Message::builder()
            .routing_key(&self.routing_key)
            .request_id(request_id.as_str())
            .json_body(swap)
            .map_err(messaging_err)?
            .build();

        self.publisher
            .publish_with_confirm(message)
            .await
            .map_err(messaging_err)?;

        debug!(request_id = %request_id, "Swap notification published");
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingNotifier;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use parking_lot::Mutex;

    use super::*;

    /// Notifier that keeps every swap it is given.
    #[derive(Default)]
    pub struct RecordingNotifier {
        swaps: Mutex<Vec<Swap>>,
        failing: Mutex<Option<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, message: Option<&str>) {
            *self.failing.lock() = message.map(str::to_string);
        }

        pub fn notified(&self) -> Vec<Swap> {
            self.swaps.lock().clone()
        }
    }

    #[async_trait]
    impl SwapNotifier for RecordingNotifier {
        async fn notify_swap(&self, swap: &Swap) -> SwapRailResult<()> {
            if let Some(message) = self.failing.lock().clone() {
                return Err(SwapRailError::Messaging(message));
            }
            self.swaps.lock().push(swap.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use swaprail_common::{NetworkPair, SwapRequest, SwapResponse, SwapStatus};
    use swaprail_messaging::{BrokerConnection, ConfirmMode, MemoryBroker, MessagingConfig};

    fn swap() -> Swap {
        let request = SwapRequest {
            from: NetworkPair::new("btc", "btc"),
            to: NetworkPair::new("usdt", "eth"),
            amount: dec!(0.5),
            to_address: "0xabc".to_string(),
            refund_address: "bc1qrefund".to_string(),
            exchange: "alpha".to_string(),
        };
        let order = SwapResponse {
            id: "alpha-1".to_string(),
            status: "waiting".to_string(),
            from: request.from.clone(),
            to: request.to.clone(),
            payin_address: "bc1qdeposit".to_string(),
            payin_amount: request.amount,
            payout_amount: dec!(32000),
            payout_address: request.to_address.clone(),
            exchange: "alpha".to_string(),
            created_at: Utc::now(),
        };
        Swap::from_order(&request, &order)
    }

    async fn connection(broker: &MemoryBroker) -> Arc<BrokerConnection> {
        broker.bind("swaprail.swap", "swaprail.swaps");
        let config = MessagingConfig {
            confirm_timeout: std::time::Duration::from_millis(100),
            ..MessagingConfig::default()
        };
        Arc::new(
            BrokerConnection::connect(config, Arc::new(broker.clone()))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_notify_publishes_json_swap() {
        let broker = MemoryBroker::new();
        let notifier = BrokerNotifier::new(connection(&broker).await, "swaprail.swap");
        let swap = swap();

        notifier.notify_swap(&swap).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let message = &published[0].1;
        assert_eq!(message.routing_key, "swaprail.swap");
        assert!(message.request_id.starts_with("RQ_"));

        let decoded: Swap = message.decode().unwrap();
        assert_eq!(decoded, swap);
        assert_eq!(decoded.status, SwapStatus::Pending);
    }

    #[tokio::test]
    async fn test_unconfirmed_publish_is_messaging_error() {
        let broker = MemoryBroker::new();
        let notifier = BrokerNotifier::new(connection(&broker).await, "swaprail.swap");
        broker.set_confirm_mode(ConfirmMode::Nack);

        let err = notifier.notify_swap(&swap()).await.unwrap_err();
        assert!(matches!(err, SwapRailError::Messaging(_)));
        assert!(err.is_retryable());
    }
}
